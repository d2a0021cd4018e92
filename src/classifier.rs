//! Weighted-signal classification with optional assisted escalation

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::{ClassificationConfig, ClassificationThresholds};
use crate::error::Result;
use crate::models::{
    ClassificationResult, ClassificationSignal, ClassifierTier, Disposition, MessageCategory,
    MessageMetadata,
};

/// Signal weights
pub mod weights {
    pub const PROMOTIONS: f64 = 0.60;
    pub const SOCIAL: f64 = 0.30;
    pub const UPDATES: f64 = 0.15;
    pub const FORUMS: f64 = 0.15;
    pub const PRIMARY: f64 = -0.20;
    pub const UNSUBSCRIBE: f64 = 0.40;
    pub const BULK_PRECEDENCE: f64 = 0.35;
    pub const AUTO_GENERATED: f64 = 0.50;
    pub const BULK_PLATFORM: f64 = 0.30;
    pub const NO_REPLY: f64 = 0.15;
    pub const MARKETING_SUBJECT: f64 = 0.20;
    pub const IMPORTANT: f64 = -0.40;
    pub const REPLY_SUBJECT: f64 = -0.30;
}

/// Bulk-mail sending platforms
static BULK_PLATFORMS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "amazonses.com",
        "mailchimp.com",
        "mcsv.net",
        "list-manage.com",
        "sendgrid.net",
        "mailgun.org",
        "sparkpostmail.com",
        "mandrillapp.com",
        "postmarkapp.com",
        "constantcontact.com",
        "hubspotemail.net",
        "klaviyomail.com",
        "exacttarget.com",
        "substack.com",
        "mailerlite.com",
        "sendinblue.com",
        "campaign-archive.com",
    ]
});

/// Sender local-part prefixes that mark an unattended mailbox
static NO_REPLY_PREFIXES: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "noreply@",
        "no-reply@",
        "no_reply@",
        "donotreply@",
        "do-not-reply@",
        "mailer-daemon@",
    ]
});

static MARKETING_SUBJECT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        concat!(
            r"(?i)(\bsale\b|discount|\boffer\b|\bdeals?\b|promo|coupon|limited time|exclusive",
            r"|\bsave\b|% off|free shipping|clearance|last chance)",
        ),
    )
    .unwrap()
});

static REPLY_SUBJECT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(re|fwd?|aw|sv)\s*:").unwrap());

/// Whether `domain` is (a subdomain of) a known bulk-mail platform
pub fn is_bulk_platform(domain: &str) -> bool {
    let domain = domain.to_ascii_lowercase();
    BULK_PLATFORMS.iter().any(|platform| {
        domain == *platform
            || domain
                .strip_suffix(platform)
                .is_some_and(|prefix| prefix.ends_with('.'))
    })
}

/// Drop float noise from summed weights so a score that should land on a
/// threshold does not fall just under it
fn round_score(score: f64) -> f64 {
    (score * 1e6).round() / 1e6
}

pub fn is_no_reply_sender(address: &str) -> bool {
    let address = address.to_ascii_lowercase();
    NO_REPLY_PREFIXES.iter().any(|p| address.starts_with(p))
}

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, message: &MessageMetadata) -> Result<ClassificationResult>;
}

/// Tier-1: deterministic weighted signals over metadata
#[derive(Debug, Clone)]
pub struct RuleClassifier {
    thresholds: ClassificationThresholds,
}

impl RuleClassifier {
    pub fn new(thresholds: ClassificationThresholds) -> Self {
        Self { thresholds }
    }

    /// Signals that fire for a message, in evaluation order
    pub fn signals(&self, message: &MessageMetadata) -> Vec<ClassificationSignal> {
        let mut signals = Vec::new();

        let category = match message.category {
            MessageCategory::Promotions => Some(weights::PROMOTIONS),
            MessageCategory::Social => Some(weights::SOCIAL),
            MessageCategory::Updates => Some(weights::UPDATES),
            MessageCategory::Forums => Some(weights::FORUMS),
            MessageCategory::Primary => Some(weights::PRIMARY),
            MessageCategory::Unknown => None,
        };
        if let Some(weight) = category {
            signals.push(ClassificationSignal::new(
                format!("category_{}", message.category.as_str()),
                weight,
                format!("{} category", message.category.as_str()),
            ));
        }

        if message.headers.has_unsubscribe {
            signals.push(ClassificationSignal::new(
                "unsubscribe_header",
                weights::UNSUBSCRIBE,
                "list unsubscribe header",
            ));
        }
        if message.headers.is_bulk {
            signals.push(ClassificationSignal::new(
                "bulk_precedence",
                weights::BULK_PRECEDENCE,
                "bulk precedence",
            ));
        }
        if message.headers.is_auto_generated {
            signals.push(ClassificationSignal::new(
                "auto_generated",
                weights::AUTO_GENERATED,
                "auto-submitted",
            ));
        }
        if is_bulk_platform(&message.sender_domain) {
            signals.push(ClassificationSignal::new(
                "bulk_platform",
                weights::BULK_PLATFORM,
                format!("sent via {}", message.sender_domain),
            ));
        }
        if is_no_reply_sender(&message.sender_email) {
            signals.push(ClassificationSignal::new(
                "no_reply_sender",
                weights::NO_REPLY,
                "no-reply sender",
            ));
        }
        if MARKETING_SUBJECT.is_match(&message.subject) {
            signals.push(ClassificationSignal::new(
                "marketing_subject",
                weights::MARKETING_SUBJECT,
                "marketing language in subject",
            ));
        }
        if message.is_important() {
            signals.push(ClassificationSignal::new(
                "important_label",
                weights::IMPORTANT,
                "marked important",
            ));
        }
        if REPLY_SUBJECT.is_match(&message.subject) {
            signals.push(ClassificationSignal::new(
                "reply_subject",
                weights::REPLY_SUBJECT,
                "part of a conversation",
            ));
        }

        signals
    }

    pub fn evaluate(&self, message: &MessageMetadata) -> ClassificationResult {
        let signals = self.signals(message);
        let score: f64 = signals.iter().map(|s| s.contribution).sum();
        let confidence = round_score(score).clamp(0.0, 1.0);
        let disposition = self.thresholds.disposition_for(confidence);

        let reason = if signals.is_empty() {
            "no signals".to_string()
        } else {
            signals
                .iter()
                .map(|s| s.reason.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        };

        ClassificationResult {
            disposition,
            confidence,
            signals,
            reason,
            tier: ClassifierTier::Rules,
        }
    }
}

#[async_trait]
impl Classifier for RuleClassifier {
    async fn classify(&self, message: &MessageMetadata) -> Result<ClassificationResult> {
        Ok(self.evaluate(message))
    }
}

/// When and how Tier-2 is consulted
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EscalationPolicy {
    /// Archive or trash below this confidence is escalated
    pub escalation_threshold: f64,
    pub rules_weight: f64,
    pub assisted_weight: f64,
    /// Trash below this is demoted to review
    pub trash_floor: f64,
}

impl EscalationPolicy {
    pub fn from_config(config: &ClassificationConfig) -> Self {
        Self {
            escalation_threshold: config.escalation_threshold,
            rules_weight: config.rules_weight,
            assisted_weight: config.assisted_weight,
            trash_floor: config.assisted_trash_floor,
        }
    }

    pub fn should_escalate(&self, result: &ClassificationResult) -> bool {
        result.disposition.is_mutating() && result.confidence < self.escalation_threshold
    }

    /// Blend both tiers into one result
    pub fn combine(
        &self,
        rules: &ClassificationResult,
        assisted: &ClassificationResult,
    ) -> ClassificationResult {
        let (mut disposition, confidence) = if rules.disposition == assisted.disposition {
            (
                rules.disposition,
                self.rules_weight * rules.confidence + self.assisted_weight * assisted.confidence,
            )
        } else {
            (
                assisted.disposition,
                self.assisted_weight * assisted.confidence
                    + self.rules_weight * (1.0 - rules.confidence),
            )
        };
        let confidence = round_score(confidence).clamp(0.0, 1.0);

        let mut signals = rules.signals.clone();
        signals.extend(assisted.signals.iter().cloned());
        let mut reason = format!("rules: {}; assisted: {}", rules.reason, assisted.reason);

        if disposition == Disposition::Trash && confidence < self.trash_floor {
            disposition = Disposition::Review;
            reason.push_str("; combined trash below floor");
        }

        ClassificationResult {
            disposition,
            confidence,
            signals,
            reason,
            tier: ClassifierTier::Combined,
        }
    }

    /// Tier-1 result kept after Tier-2 failed
    pub fn fallback(&self, rules: ClassificationResult) -> ClassificationResult {
        if rules.disposition == Disposition::Trash && rules.confidence < self.trash_floor {
            return rules.overridden(
                Disposition::Review,
                ClassificationSignal::new(
                    "assisted_unavailable",
                    0.0,
                    "marginal trash without assisted confirmation",
                ),
            );
        }
        rules
    }
}

/// Tier-1 always, Tier-2 on escalation
pub struct TieredClassifier {
    rules: RuleClassifier,
    assisted: Option<Arc<dyn Classifier>>,
    policy: EscalationPolicy,
}

impl TieredClassifier {
    pub fn new(
        rules: RuleClassifier,
        assisted: Option<Arc<dyn Classifier>>,
        policy: EscalationPolicy,
    ) -> Self {
        Self {
            rules,
            assisted,
            policy,
        }
    }
}

#[async_trait]
impl Classifier for TieredClassifier {
    async fn classify(&self, message: &MessageMetadata) -> Result<ClassificationResult> {
        let tier1 = self.rules.evaluate(message);

        if !self.policy.should_escalate(&tier1) {
            return Ok(tier1);
        }
        let Some(assisted) = self.assisted.as_ref() else {
            return Ok(tier1);
        };

        debug!(
            message_id = %message.id,
            confidence = tier1.confidence,
            disposition = %tier1.disposition,
            "Escalating to assisted classifier"
        );

        match assisted.classify(message).await {
            Ok(tier2) => Ok(self.policy.combine(&tier1, &tier2)),
            Err(e) if e.must_propagate() => Err(e),
            Err(e) => {
                warn!(message_id = %message.id, "Assisted classification failed: {}", e);
                Ok(self.policy.fallback(tier1))
            }
        }
    }
}
