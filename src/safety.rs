//! Hard overrides that run before and after scoring
//!
//! Nothing in here talks to the network. Contact and open-rate lookups are
//! resolved by the caller and passed in as a [`SafetyContext`].

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use std::collections::HashSet;

use crate::classifier::is_bulk_platform;
use crate::config::SafetyConfig;
use crate::models::{ClassificationResult, ClassificationSignal, Disposition, MessageMetadata};

/// Phrases that keep a message out of archive and trash
pub const PROTECTED_PHRASES: &[&str] = &[
    "job offer",
    "offer letter",
    "interview",
    "invoice",
    "medical",
    "lab results",
    "prescription",
    "appointment",
    "tax return",
    "tax document",
    "w-2",
    "1099",
    "security alert",
    "password reset",
    "verification code",
    "sign-in",
    "unusual activity",
    "payment failed",
    "legal notice",
    "your order",
];

/// Marketing phrases that cancel protection
pub const NEGATIVE_PHRASES: &[&str] = &[
    "special offer",
    "limited time offer",
    "exclusive offer",
    "% off",
    "sale ends",
    "free shipping",
    "act now",
    "shop now",
    "flash sale",
    "promo code",
    "coupon code",
    "deal of the day",
];

const SHORT_SUBJECT_CHARS: usize = 5;

static PERSONAL_PRONOUNS: Lazy<HashSet<&'static str>> =
    Lazy::new(|| ["i", "me", "my", "you", "u", "we", "us"].into_iter().collect());

static PROMO_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    ["sale", "deal", "deals", "new", "hot", "off", "free", "save", "promo", "shop"]
        .into_iter()
        .collect()
});

/// Lowercased word tokens; '%' stands alone, everything else splits
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();

    for c in text.chars() {
        if c.is_alphanumeric() {
            current.extend(c.to_lowercase());
            continue;
        }
        if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
        if c == '%' {
            tokens.push("%".to_string());
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn contains_phrase(haystack: &[String], phrase: &[String]) -> bool {
    !phrase.is_empty()
        && haystack.len() >= phrase.len()
        && haystack.windows(phrase.len()).any(|w| w == phrase)
}

/// Caller-resolved facts about the sender
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SafetyContext {
    pub is_contact: bool,
    pub open_rate: Option<f64>,
}

/// How a short subject is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShortSubject {
    NotShort,
    LeansImportant,
    /// Looks like bulk mail; no caution needed
    Benign,
    Flagged,
}

impl ShortSubject {
    pub fn needs_review(&self) -> bool {
        matches!(self, ShortSubject::LeansImportant | ShortSubject::Flagged)
    }
}

#[derive(Debug, Clone)]
pub struct SafetyRails {
    protected: Vec<(String, Vec<String>)>,
    negative: Vec<Vec<String>>,
    recent: chrono::Duration,
    recent_min_confidence: f64,
    high_open_rate: f64,
}

impl SafetyRails {
    pub fn new(config: &SafetyConfig) -> Self {
        let protected = PROTECTED_PHRASES
            .iter()
            .map(|p| p.to_string())
            .chain(config.extra_protected_phrases.iter().cloned())
            .map(|phrase| {
                let tokens = tokenize(&phrase);
                (phrase, tokens)
            })
            .filter(|(_, tokens)| !tokens.is_empty())
            .collect();

        let negative = NEGATIVE_PHRASES.iter().map(|p| tokenize(p)).collect();

        Self {
            protected,
            negative,
            recent: chrono::Duration::days(i64::from(config.recent_days)),
            recent_min_confidence: config.recent_min_confidence,
            high_open_rate: config.high_open_rate,
        }
    }

    /// The protected phrase found in subject or snippet, unless a marketing phrase cancels it
    pub fn is_protected(&self, subject: &str, snippet: &str) -> Option<&str> {
        let texts = [tokenize(subject), tokenize(snippet)];

        let negated = texts
            .iter()
            .any(|tokens| self.negative.iter().any(|n| contains_phrase(tokens, n)));
        if negated {
            return None;
        }

        self.protected
            .iter()
            .find(|(_, phrase)| texts.iter().any(|tokens| contains_phrase(tokens, phrase)))
            .map(|(name, _)| name.as_str())
    }

    pub fn assess_short_subject(
        &self,
        message: &MessageMetadata,
        ctx: &SafetyContext,
    ) -> ShortSubject {
        let subject = message.subject.trim();
        if subject.chars().count() >= SHORT_SUBJECT_CHARS {
            return ShortSubject::NotShort;
        }

        if ctx.is_contact {
            return ShortSubject::LeansImportant;
        }

        // Bulk senders and bare promo words are never flagged, whatever their casing
        let tokens = tokenize(subject);
        let promo_word =
            !tokens.is_empty() && tokens.iter().all(|t| PROMO_WORDS.contains(t.as_str()));
        if is_bulk_platform(&message.sender_domain) || promo_word {
            return ShortSubject::Benign;
        }

        let all_caps = subject.chars().any(|c| c.is_alphabetic())
            && subject
                .chars()
                .filter(|c| c.is_alphabetic())
                .all(|c| c.is_uppercase());
        let has_pronoun = tokens.iter().any(|t| PERSONAL_PRONOUNS.contains(t.as_str()));
        let high_open_rate = ctx.open_rate.is_some_and(|rate| rate >= self.high_open_rate);
        if high_open_rate || all_caps || has_pronoun {
            return ShortSubject::LeansImportant;
        }

        ShortSubject::Flagged
    }

    /// Overrides that decide the outcome without scoring
    pub fn pre_check(
        &self,
        message: &MessageMetadata,
        ctx: &SafetyContext,
    ) -> Option<ClassificationResult> {
        if message.is_starred() {
            return Some(ClassificationResult::forced(
                Disposition::Keep,
                1.0,
                ClassificationSignal::new("starred", 0.0, "starred by user"),
            ));
        }
        if ctx.is_contact {
            return Some(ClassificationResult::forced(
                Disposition::Keep,
                0.95,
                ClassificationSignal::new("known_contact", 0.0, "sender is a known contact"),
            ));
        }
        if let Some(phrase) = self.is_protected(&message.subject, &message.snippet) {
            return Some(ClassificationResult::forced(
                Disposition::Keep,
                0.95,
                ClassificationSignal::new(
                    "protected_phrase",
                    0.0,
                    format!("protected phrase '{}'", phrase),
                ),
            ));
        }
        None
    }

    /// Final say over a scored result
    pub fn post_check(
        &self,
        message: &MessageMetadata,
        ctx: &SafetyContext,
        result: ClassificationResult,
        now: DateTime<Utc>,
    ) -> ClassificationResult {
        if let Some(forced) = self.pre_check(message, ctx) {
            return forced;
        }

        if result.disposition.is_mutating() {
            let short = self.assess_short_subject(message, ctx);
            if short.needs_review() {
                let reason = match short {
                    ShortSubject::LeansImportant => "short subject looks personal",
                    _ => "short subject needs a human look",
                };
                return result.overridden(
                    Disposition::Review,
                    ClassificationSignal::new("short_subject", 0.0, reason),
                );
            }
        }

        if result.disposition == Disposition::Trash
            && message.age_at(now) < self.recent
            && result.confidence < self.recent_min_confidence
        {
            return result.overridden(
                Disposition::Review,
                ClassificationSignal::new(
                    "recent_message",
                    0.0,
                    "too recent to trash at this confidence",
                ),
            );
        }

        result
    }
}

impl Default for SafetyRails {
    fn default() -> Self {
        Self::new(&SafetyConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ClassifierTier, ListHeaders, MessageCategory};
    use chrono::Duration;

    fn message(subject: &str) -> MessageMetadata {
        MessageMetadata {
            id: "m1".to_string(),
            thread_id: "t1".to_string(),
            sender_email: "news@store.example.com".to_string(),
            sender_domain: "store.example.com".to_string(),
            sender_name: "Store".to_string(),
            subject: subject.to_string(),
            snippet: String::new(),
            labels: vec!["INBOX".to_string()],
            category: MessageCategory::Promotions,
            headers: ListHeaders::default(),
            date_received: Utc::now() - Duration::days(10),
        }
    }

    fn scored(disposition: Disposition, confidence: f64) -> ClassificationResult {
        ClassificationResult {
            disposition,
            confidence,
            signals: Vec::new(),
            reason: "scored".to_string(),
            tier: ClassifierTier::Rules,
        }
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(tokenize("Save 50% OFF!"), vec!["save", "50", "%", "off"]);
        assert_eq!(tokenize("Your W-2 is ready"), vec!["your", "w", "2", "is", "ready"]);
        assert!(tokenize("  ...  ").is_empty());
    }

    #[test]
    fn test_phrase_protection() {
        let rails = SafetyRails::default();
        assert_eq!(
            rails.is_protected("Job offer for Senior Engineer", ""),
            Some("job offer")
        );
        assert_eq!(rails.is_protected("Special offer: 50% off", ""), None);
        assert_eq!(rails.is_protected("Limited time offer on your order", ""), None);
    }

    #[test]
    fn test_phrase_matching_is_whole_word() {
        let rails = SafetyRails::default();
        assert_eq!(rails.is_protected("Interviewing tips for 2024", ""), None);
        assert_eq!(rails.is_protected("Invoices overview", ""), None);
        assert_eq!(rails.is_protected("Your invoice #1234", ""), Some("invoice"));
        assert_eq!(rails.is_protected("New sign in from Chrome", ""), Some("sign-in"));
    }

    #[test]
    fn test_snippet_can_protect_and_negate() {
        let rails = SafetyRails::default();
        assert_eq!(
            rails.is_protected("Update", "Your lab results are available"),
            Some("lab results")
        );
        assert_eq!(rails.is_protected("Your order shipped", "Act now for more"), None);
    }

    #[test]
    fn test_extra_phrases_from_config() {
        let mut config = SafetyConfig::default();
        config.extra_protected_phrases = vec!["Board Meeting".to_string()];
        let rails = SafetyRails::new(&config);
        assert_eq!(
            rails.is_protected("Agenda for the board meeting", ""),
            Some("Board Meeting")
        );
    }

    #[test]
    fn test_pre_check_order() {
        let rails = SafetyRails::default();

        let mut starred = message("Weekly digest");
        starred.labels.push("STARRED".to_string());
        let result = rails
            .pre_check(&starred, &SafetyContext { is_contact: true, open_rate: None })
            .unwrap();
        assert_eq!(result.disposition, Disposition::Keep);
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.tier, ClassifierTier::Safety);

        let known = SafetyContext {
            is_contact: true,
            open_rate: None,
        };
        let contact = rails.pre_check(&message("Weekly digest"), &known).unwrap();
        assert_eq!(contact.confidence, 0.95);
        assert_eq!(contact.signals[0].name, "known_contact");

        assert!(rails
            .pre_check(&message("Weekly digest"), &SafetyContext::default())
            .is_none());
    }

    #[test]
    fn test_short_subject_assessment() {
        let rails = SafetyRails::default();
        let ctx = SafetyContext::default();

        assert_eq!(rails.assess_short_subject(&message("Weekly"), &ctx), ShortSubject::NotShort);
        assert_eq!(
            rails.assess_short_subject(&message("HELP"), &ctx),
            ShortSubject::LeansImportant
        );
        assert_eq!(
            rails.assess_short_subject(&message("u up"), &ctx),
            ShortSubject::LeansImportant
        );
        assert_eq!(rails.assess_short_subject(&message("Sale"), &ctx), ShortSubject::Benign);
        assert_eq!(rails.assess_short_subject(&message("fyi"), &ctx), ShortSubject::Flagged);

        let frequent = SafetyContext { is_contact: false, open_rate: Some(0.8) };
        assert_eq!(
            rails.assess_short_subject(&message("fyi"), &frequent),
            ShortSubject::LeansImportant
        );

        let mut bulk = message("fyi");
        bulk.sender_domain = "mail.sendgrid.net".to_string();
        assert_eq!(rails.assess_short_subject(&bulk, &ctx), ShortSubject::Benign);

        // Casing does not make a promo blast important
        assert_eq!(rails.assess_short_subject(&message("SALE"), &ctx), ShortSubject::Benign);
        let mut shouted = message("SALE");
        shouted.sender_domain = "em.sendgrid.net".to_string();
        assert_eq!(rails.assess_short_subject(&shouted, &ctx), ShortSubject::Benign);
        let mut caps_bulk = message("HEY");
        caps_bulk.sender_domain = "em.sendgrid.net".to_string();
        assert_eq!(rails.assess_short_subject(&caps_bulk, &ctx), ShortSubject::Benign);

        // Only a known contact outranks the exemptions
        let contact = SafetyContext { is_contact: true, open_rate: None };
        assert_eq!(
            rails.assess_short_subject(&shouted, &contact),
            ShortSubject::LeansImportant
        );
    }

    #[test]
    fn test_post_check_keeps_promo_blast_trash() {
        let rails = SafetyRails::default();
        let mut shouted = message("SALE");
        shouted.sender_domain = "em.sendgrid.net".to_string();

        let result = rails.post_check(
            &shouted,
            &SafetyContext::default(),
            scored(Disposition::Trash, 1.0),
            Utc::now(),
        );
        assert_eq!(result.disposition, Disposition::Trash);
    }

    #[test]
    fn test_post_check_short_subject_demotes() {
        let rails = SafetyRails::default();
        let result = rails.post_check(
            &message("fyi"),
            &SafetyContext::default(),
            scored(Disposition::Archive, 0.7),
            Utc::now(),
        );
        assert_eq!(result.disposition, Disposition::Review);

        let result = rails.post_check(
            &message("Sale"),
            &SafetyContext::default(),
            scored(Disposition::Archive, 0.7),
            Utc::now(),
        );
        assert_eq!(result.disposition, Disposition::Archive);
    }

    #[test]
    fn test_post_check_recent_trash() {
        let rails = SafetyRails::default();
        let mut recent = message("Weekly digest");
        recent.date_received = Utc::now() - Duration::hours(12);

        let result = rails.post_check(
            &recent,
            &SafetyContext::default(),
            scored(Disposition::Trash, 0.9),
            Utc::now(),
        );
        assert_eq!(result.disposition, Disposition::Review);
        assert!(result.signals.iter().any(|s| s.name == "recent_message"));

        let confident = rails.post_check(
            &recent,
            &SafetyContext::default(),
            scored(Disposition::Trash, 0.95),
            Utc::now(),
        );
        assert_eq!(confident.disposition, Disposition::Trash);

        let old = rails.post_check(
            &message("Weekly digest"),
            &SafetyContext::default(),
            scored(Disposition::Trash, 0.9),
            Utc::now(),
        );
        assert_eq!(old.disposition, Disposition::Trash);
    }

    #[test]
    fn test_post_check_cannot_be_outvoted() {
        let rails = SafetyRails::default();
        let result = rails.post_check(
            &message("Your tax return is ready"),
            &SafetyContext::default(),
            scored(Disposition::Trash, 1.0),
            Utc::now(),
        );
        assert_eq!(result.disposition, Disposition::Keep);
    }
}
