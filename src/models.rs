use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::config::ClassificationThresholds;
use crate::error::TriageError;

pub const INBOX_LABEL: &str = "INBOX";
pub const STARRED_LABEL: &str = "STARRED";
pub const IMPORTANT_LABEL: &str = "IMPORTANT";
pub const TRASH_LABEL: &str = "TRASH";

/// Maximum snippet length carried through the pipeline
pub const SNIPPET_MAX_CHARS: usize = 200;

/// Header-level view of a message. There is deliberately no body field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageMetadata {
    pub id: String,
    pub thread_id: String,
    pub sender_email: String,
    pub sender_domain: String,
    pub sender_name: String,
    pub subject: String,
    pub snippet: String,
    pub labels: Vec<String>,
    pub category: MessageCategory,
    pub headers: ListHeaders,
    pub date_received: DateTime<Utc>,
}

impl MessageMetadata {
    pub fn is_starred(&self) -> bool {
        self.has_label(STARRED_LABEL)
    }

    pub fn is_important(&self) -> bool {
        self.has_label(IMPORTANT_LABEL)
    }

    pub fn in_inbox(&self) -> bool {
        self.has_label(INBOX_LABEL)
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.date_received)
    }
}

/// Allow-listed list/bulk markers pulled from headers
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListHeaders {
    /// List-Unsubscribe or List-Id present
    pub has_unsubscribe: bool,
    /// Precedence: bulk | list | junk
    pub is_bulk: bool,
    /// Auto-Submitted other than "no"
    pub is_auto_generated: bool,
}

/// Provider inbox category, mapped from CATEGORY_* labels
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageCategory {
    Primary,
    Promotions,
    Social,
    Updates,
    Forums,
    Unknown,
}

impl MessageCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageCategory::Primary => "primary",
            MessageCategory::Promotions => "promotions",
            MessageCategory::Social => "social",
            MessageCategory::Updates => "updates",
            MessageCategory::Forums => "forums",
            MessageCategory::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    Keep,
    Archive,
    Trash,
    Review,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Keep => "keep",
            Disposition::Archive => "archive",
            Disposition::Trash => "trash",
            Disposition::Review => "review",
        }
    }

    /// Dispositions that change mailbox state when executed
    pub fn is_mutating(&self) -> bool {
        matches!(self, Disposition::Archive | Disposition::Trash)
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Disposition {
    type Err = TriageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "keep" => Ok(Disposition::Keep),
            "archive" => Ok(Disposition::Archive),
            "trash" => Ok(Disposition::Trash),
            "review" | "needs-review" | "needs_review" => Ok(Disposition::Review),
            other => Err(TriageError::InvalidMessageFormat(format!(
                "unknown disposition '{}'",
                other
            ))),
        }
    }
}

/// Which component produced a result
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ClassifierTier {
    Rules,
    Assisted,
    Combined,
    Safety,
}

impl ClassifierTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClassifierTier::Rules => "rules",
            ClassifierTier::Assisted => "assisted",
            ClassifierTier::Combined => "combined",
            ClassifierTier::Safety => "safety",
        }
    }
}

impl FromStr for ClassifierTier {
    type Err = TriageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rules" => Ok(ClassifierTier::Rules),
            "assisted" => Ok(ClassifierTier::Assisted),
            "combined" => Ok(ClassifierTier::Combined),
            "safety" => Ok(ClassifierTier::Safety),
            other => Err(TriageError::InvalidMessageFormat(format!(
                "unknown classifier tier '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassificationSignal {
    pub name: String,
    pub contribution: f64,
    pub reason: String,
}

impl ClassificationSignal {
    pub fn new(name: impl Into<String>, contribution: f64, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            contribution,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassificationResult {
    pub disposition: Disposition,
    pub confidence: f64,
    pub signals: Vec<ClassificationSignal>,
    pub reason: String,
    pub tier: ClassifierTier,
}

impl ClassificationResult {
    /// Result decided by a safety rail
    pub fn forced(disposition: Disposition, confidence: f64, signal: ClassificationSignal) -> Self {
        Self {
            disposition,
            confidence,
            reason: signal.reason.clone(),
            signals: vec![signal],
            tier: ClassifierTier::Safety,
        }
    }

    /// Copy of this result moved to `disposition`, with the override recorded as a signal
    pub fn overridden(&self, disposition: Disposition, signal: ClassificationSignal) -> Self {
        let mut signals = self.signals.clone();
        let reason = format!("{} (was {}: {})", signal.reason, self.disposition, self.reason);
        signals.push(signal);
        Self {
            disposition,
            confidence: self.confidence,
            signals,
            reason,
            tier: self.tier,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Classification is logged only
    Sandbox,
    /// Dispositions are applied to the mailbox
    Action,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Sandbox => "sandbox",
            ExecutionMode::Action => "action",
        }
    }
}

impl FromStr for ExecutionMode {
    type Err = TriageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sandbox" => Ok(ExecutionMode::Sandbox),
            "action" => Ok(ExecutionMode::Action),
            other => Err(TriageError::InvalidMessageFormat(format!(
                "unknown execution mode '{}'",
                other
            ))),
        }
    }
}

/// Append-only audit ledger entry, one per processed message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionRecord {
    pub id: String,
    pub mailbox_id: String,
    pub message_id: String,
    pub thread_id: String,
    pub sender_email: String,
    pub subject: String,
    pub disposition: Disposition,
    pub confidence: f64,
    pub reason: String,
    pub signals: Vec<ClassificationSignal>,
    pub tier: ClassifierTier,
    pub mode: ExecutionMode,
    pub pre_action_labels: Vec<String>,
    pub applied_label: Option<String>,
    pub created_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
    pub execution_error: Option<String>,
    pub undone_at: Option<DateTime<Utc>>,
    pub undo_deadline: DateTime<Utc>,
}

impl ActionRecord {
    /// Whether a remote transition was applied that undo can reverse
    pub fn is_reversible(&self) -> bool {
        self.executed_at.is_some() && self.disposition.is_mutating()
    }

    pub fn is_undone(&self) -> bool {
        self.undone_at.is_some()
    }
}

/// Document subtype applied as a label after archive
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DocumentType {
    Receipt,
    Invoice,
    Shipping,
    Booking,
    Financial,
    Newsletter,
    Research,
}

impl DocumentType {
    pub const ALL: [DocumentType; 7] = [
        DocumentType::Receipt,
        DocumentType::Invoice,
        DocumentType::Shipping,
        DocumentType::Booking,
        DocumentType::Financial,
        DocumentType::Newsletter,
        DocumentType::Research,
    ];

    /// Label leaf name under the configured prefix
    pub fn label_name(&self) -> &'static str {
        match self {
            DocumentType::Receipt => "Receipts",
            DocumentType::Invoice => "Invoices",
            DocumentType::Shipping => "Shipping",
            DocumentType::Booking => "Bookings",
            DocumentType::Financial => "Financial",
            DocumentType::Newsletter => "Newsletters",
            DocumentType::Research => "Research",
        }
    }
}

/// Connected account
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Mailbox {
    pub id: String,
    pub email: String,
    pub credential_ref: String,
    pub last_sync_token: Option<String>,
    pub active: bool,
    pub settings: MailboxSettings,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MailboxSettings {
    #[serde(default)]
    pub action_mode: bool,
    #[serde(default = "default_true")]
    pub auto_label: bool,
    #[serde(default)]
    pub thresholds: Option<ClassificationThresholds>,
    #[serde(default)]
    pub backlog: BacklogSettings,
}

impl Default for MailboxSettings {
    fn default() -> Self {
        Self {
            action_mode: false,
            auto_label: true,
            thresholds: None,
            backlog: BacklogSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BacklogSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_backlog_age_days")]
    pub age_days: u32,
    #[serde(default = "default_backlog_batch_size")]
    pub batch_size: u32,
}

impl Default for BacklogSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            age_days: default_backlog_age_days(),
            batch_size: default_backlog_batch_size(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_backlog_age_days() -> u32 {
    30
}

fn default_backlog_batch_size() -> u32 {
    100
}

/// Persisted counters for a backlog run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BacklogProgress {
    pub mailbox_id: String,
    pub processed: u64,
    pub total: Option<u64>,
    pub next_page_token: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished: bool,
}

impl BacklogProgress {
    pub fn new(mailbox_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            mailbox_id: mailbox_id.to_string(),
            processed: 0,
            total: None,
            next_page_token: None,
            started_at: now,
            updated_at: now,
            finished: false,
        }
    }

    /// Percentage complete, when the total is known
    pub fn percent(&self) -> Option<f64> {
        match self.total {
            Some(0) => Some(100.0),
            Some(total) => Some((self.processed as f64 / total as f64 * 100.0).min(100.0)),
            None => None,
        }
    }
}
