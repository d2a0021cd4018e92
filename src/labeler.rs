//! Document-type labels for archived messages
//!
//! Each type has weighted subject, snippet and sender-domain patterns. A
//! label is applied only when the best match clears the configured bar.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info};

use crate::client::MailboxClient;
use crate::config::ExecutionConfig;
use crate::error::Result;
use crate::models::{DocumentType, MessageMetadata};

const SUBJECT_WEIGHT: f64 = 0.65;
const SNIPPET_WEIGHT: f64 = 0.25;
const DOMAIN_WEIGHT: f64 = 0.25;

struct DocumentPatterns {
    doc_type: DocumentType,
    subject: Regex,
    snippet: Regex,
    domains: &'static [&'static str],
}

static DOCUMENT_PATTERNS: Lazy<Vec<DocumentPatterns>> = Lazy::new(|| {
    vec![
        DocumentPatterns {
            doc_type: DocumentType::Receipt,
            subject: Regex::new(
                concat!(
                    r"(?i)\b(receipt|your order|order confirmation|purchase confirmation",
                    r"|thank you for your (order|purchase))\b",
                ),
            )
            .unwrap(),
            snippet: Regex::new(
                r"(?i)\b(order (number|#)|subtotal|total paid|payment received)",
            )
            .unwrap(),
            domains: &["amazon.com", "ebay.com", "etsy.com", "shopify.com", "squareup.com"],
        },
        DocumentPatterns {
            doc_type: DocumentType::Invoice,
            subject: Regex::new(r"(?i)\b(invoice|bill is ready|payment due|amount due)\b").unwrap(),
            snippet: Regex::new(
                r"(?i)\b(due date|amount due|invoice (number|#)|balance due)",
            )
            .unwrap(),
            domains: &["stripe.com", "quickbooks.com", "intuit.com", "freshbooks.com", "xero.com"],
        },
        DocumentPatterns {
            doc_type: DocumentType::Shipping,
            subject: Regex::new(
                concat!(
                    r"(?i)\b(shipped|shipping (update|confirmation)|out for delivery",
                    r"|delivered|tracking|dispatched)\b",
                ),
            )
            .unwrap(),
            snippet: Regex::new(
                r"(?i)\b(tracking (number|#)|carrier|estimated delivery|your package)",
            )
            .unwrap(),
            domains: &["ups.com", "fedex.com", "usps.com", "dhl.com", "royalmail.com"],
        },
        DocumentPatterns {
            doc_type: DocumentType::Booking,
            subject: Regex::new(
                r"(?i)\b(booking|reservation|itinerary|e-ticket|flight confirmation|check-in)\b",
            )
            .unwrap(),
            snippet: Regex::new(
                r"(?i)\b(confirmation (code|number)|check-in|departure|arrival)",
            )
            .unwrap(),
            domains: &["booking.com", "airbnb.com", "expedia.com", "hotels.com", "opentable.com"],
        },
        DocumentPatterns {
            doc_type: DocumentType::Financial,
            subject: Regex::new(
                r"(?i)\b(statement|deposit|withdrawal|transfer|transaction alert|balance)\b",
            )
            .unwrap(),
            snippet: Regex::new(
                r"(?i)\b(account ending|available balance|transaction|direct deposit)",
            )
            .unwrap(),
            domains: &[
                "chase.com",
                "bankofamerica.com",
                "wellsfargo.com",
                "paypal.com",
                "schwab.com",
                "fidelity.com",
            ],
        },
        DocumentPatterns {
            doc_type: DocumentType::Newsletter,
            subject: Regex::new(
                r"(?i)\b(newsletter|digest|weekly|monthly|edition|issue #?\d+)\b",
            )
            .unwrap(),
            snippet: Regex::new(
                r"(?i)(unsubscribe|view (this|it) in your browser|read more)",
            )
            .unwrap(),
            domains: &["substack.com", "beehiiv.com", "mailchimp.com", "buttondown.email"],
        },
        DocumentPatterns {
            doc_type: DocumentType::Research,
            subject: Regex::new(
                r"(?i)\b(paper|journal|preprint|citation|arxiv|publication)\b",
            )
            .unwrap(),
            snippet: Regex::new(r"(?i)\b(abstract|doi|cited by|peer review)").unwrap(),
            domains: &[
                "arxiv.org",
                "researchgate.net",
                "academia.edu",
                "springer.com",
                "elsevier.com",
                "nature.com",
            ],
        },
    ]
});

fn domain_matches(domain: &str, candidate: &str) -> bool {
    domain == candidate
        || domain
            .strip_suffix(candidate)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

/// Detects the document type of a message and applies `<prefix>/<Type>`
pub struct DocumentTypeLabeler {
    prefix: String,
    min_confidence: f64,
    /// "mailbox:lowercase name" -> label id
    label_cache: Mutex<HashMap<String, String>>,
}

impl DocumentTypeLabeler {
    pub fn new(prefix: &str, min_confidence: f64) -> Self {
        Self {
            prefix: prefix.to_string(),
            min_confidence,
            label_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self::new(&config.label_prefix, config.label_min_confidence)
    }

    /// Score of every document type for this message
    pub fn scores(&self, message: &MessageMetadata) -> Vec<(DocumentType, f64)> {
        let domain = message.sender_domain.to_ascii_lowercase();

        DOCUMENT_PATTERNS
            .iter()
            .map(|p| {
                let mut score = 0.0;
                if p.subject.is_match(&message.subject) {
                    score += SUBJECT_WEIGHT;
                }
                if p.snippet.is_match(&message.snippet) {
                    score += SNIPPET_WEIGHT;
                }
                let list_mail =
                    p.doc_type == DocumentType::Newsletter && message.headers.has_unsubscribe;
                if list_mail || p.domains.iter().any(|d| domain_matches(&domain, d)) {
                    score += DOMAIN_WEIGHT;
                }
                (p.doc_type, f64::min(score, 1.0))
            })
            .collect()
    }

    /// Best document type, when it clears the confidence bar
    pub fn detect(&self, message: &MessageMetadata) -> Option<(DocumentType, f64)> {
        self.scores(message)
            .into_iter()
            .filter(|(_, score)| *score > self.min_confidence)
            .fold(None, |best: Option<(DocumentType, f64)>, candidate| match best {
                Some(b) if b.1 >= candidate.1 => Some(b),
                _ => Some(candidate),
            })
    }

    pub fn label_name(&self, doc_type: DocumentType) -> String {
        format!("{}/{}", self.prefix, doc_type.label_name())
    }

    async fn label_id(
        &self,
        client: &dyn MailboxClient,
        mailbox_id: &str,
        name: &str,
    ) -> Result<String> {
        let key = format!("{}:{}", mailbox_id, name.to_lowercase());
        let cached = {
            let cache = self.label_cache.lock().unwrap_or_else(|p| p.into_inner());
            cache.get(&key).cloned()
        };
        if let Some(id) = cached {
            return Ok(id);
        }

        let id = client.ensure_label(name).await?;
        debug!(mailbox_id, label = name, label_id = %id, "Label resolved");
        self.label_cache
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key, id.clone());
        Ok(id)
    }

    /// Ensure the label (and its parent) exists and add it to the message
    pub async fn apply(
        &self,
        client: &dyn MailboxClient,
        mailbox_id: &str,
        message_id: &str,
        doc_type: DocumentType,
    ) -> Result<String> {
        self.label_id(client, mailbox_id, &self.prefix).await?;

        let name = self.label_name(doc_type);
        let label_id = self.label_id(client, mailbox_id, &name).await?;
        client.apply_label(message_id, &label_id).await?;

        info!(mailbox_id, message_id, label = %name, "Document label applied");
        Ok(name)
    }

    /// Detect and apply in one step; `None` when nothing matched well enough
    pub async fn label(
        &self,
        client: &dyn MailboxClient,
        mailbox_id: &str,
        message: &MessageMetadata,
    ) -> Result<Option<String>> {
        match self.detect(message) {
            Some((doc_type, confidence)) => {
                debug!(message_id = %message.id, ?doc_type, confidence, "Document type detected");
                self.apply(client, mailbox_id, &message.id, doc_type)
                    .await
                    .map(Some)
            }
            None => Ok(None),
        }
    }
}
