//! Per-message processing
//!
//! One call classifies a message, applies the disposition when the mailbox is
//! in action mode, labels archived documents, and appends the ledger record.
//! The ledger's unique `(mailbox, message)` row and the processing claim keep
//! duplicate jobs from acting twice.

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::classifier::{Classifier, EscalationPolicy, RuleClassifier, TieredClassifier};
use crate::client::{ClientFactory, MailboxClient};
use crate::collaborators::{
    notify_detached, NotificationDispatcher, NotificationKind, SettingsProvider,
};
use crate::config::{ClassificationThresholds, Config};
use crate::contacts::ContactsProvider;
use crate::error::{Result, TriageError};
use crate::executor::{ActionExecutor, ExecutionOutcome};
use crate::labeler::DocumentTypeLabeler;
use crate::models::{
    ActionRecord, ClassificationResult, Disposition, ExecutionMode, Mailbox, MailboxSettings,
    MessageMetadata,
};
use crate::safety::{SafetyContext, SafetyRails};
use crate::store::{self, Database};

/// How long a processing claim blocks other workers
const CLAIM_LEASE_MINUTES: i64 = 10;

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    Recorded(Box<ActionRecord>),
    /// The ledger already has this message
    AlreadyProcessed,
    /// Another worker holds the claim
    InFlight,
    /// The message no longer exists remotely
    Vanished,
}

impl ProcessOutcome {
    pub fn record(&self) -> Option<&ActionRecord> {
        match self {
            ProcessOutcome::Recorded(record) => Some(record),
            _ => None,
        }
    }
}

pub struct Pipeline {
    db: Database,
    clients: Arc<dyn ClientFactory>,
    settings: Arc<dyn SettingsProvider>,
    contacts: Arc<dyn ContactsProvider>,
    notifier: Arc<dyn NotificationDispatcher>,
    assisted: Option<Arc<dyn Classifier>>,
    default_thresholds: ClassificationThresholds,
    policy: EscalationPolicy,
    safety: SafetyRails,
    executor: ActionExecutor,
    labeler: DocumentTypeLabeler,
    undo_window: Duration,
}

impl Pipeline {
    pub fn new(
        db: Database,
        config: &Config,
        clients: Arc<dyn ClientFactory>,
        settings: Arc<dyn SettingsProvider>,
        contacts: Arc<dyn ContactsProvider>,
        notifier: Arc<dyn NotificationDispatcher>,
    ) -> Self {
        Self {
            executor: ActionExecutor::new(db.clone()),
            db,
            clients,
            settings,
            contacts,
            notifier,
            assisted: None,
            default_thresholds: config.classification.thresholds,
            policy: EscalationPolicy::from_config(&config.classification),
            safety: SafetyRails::new(&config.safety),
            labeler: DocumentTypeLabeler::from_config(&config.execution),
            undo_window: config.undo_window(),
        }
    }

    /// Enable Tier-2 escalation
    pub fn with_assisted(mut self, assisted: Arc<dyn Classifier>) -> Self {
        self.assisted = Some(assisted);
        self
    }

    pub fn clients(&self) -> &Arc<dyn ClientFactory> {
        &self.clients
    }

    async fn safety_context(&self, message: &MessageMetadata) -> Result<SafetyContext> {
        Ok(SafetyContext {
            is_contact: self.contacts.is_known_contact(&message.sender_email).await?,
            open_rate: self.contacts.sender_open_rate(&message.sender_email).await?,
        })
    }

    /// Safety rails around the tiered classifier
    pub async fn classify(
        &self,
        message: &MessageMetadata,
        settings: &MailboxSettings,
        now: DateTime<Utc>,
    ) -> Result<ClassificationResult> {
        let ctx = self.safety_context(message).await?;
        if let Some(forced) = self.safety.pre_check(message, &ctx) {
            debug!(message_id = %message.id, reason = %forced.reason, "Safety rail decided");
            return Ok(forced);
        }

        let thresholds = settings.thresholds.unwrap_or(self.default_thresholds);
        let tiered = TieredClassifier::new(
            RuleClassifier::new(thresholds),
            self.assisted.clone(),
            self.policy,
        );
        let scored = tiered.classify(message).await?;
        Ok(self.safety.post_check(message, &ctx, scored, now))
    }

    pub async fn process_message(
        &self,
        mailbox: &Mailbox,
        message_id: &str,
    ) -> Result<ProcessOutcome> {
        let client = self.clients.client_for(mailbox).await?;
        self.process_with(client.as_ref(), mailbox, message_id).await
    }

    /// Same as [`process_message`](Self::process_message) with a client already in hand
    pub async fn process_with(
        &self,
        client: &dyn MailboxClient,
        mailbox: &Mailbox,
        message_id: &str,
    ) -> Result<ProcessOutcome> {
        if self.on_ledger(&mailbox.id, message_id).await? {
            return Ok(ProcessOutcome::AlreadyProcessed);
        }

        let now = Utc::now();
        let lease = Duration::minutes(CLAIM_LEASE_MINUTES);
        if !store::ledger::claim(&self.db, &mailbox.id, message_id, now, lease).await? {
            debug!(mailbox_id = %mailbox.id, message_id, "Claim held by another worker");
            return Ok(ProcessOutcome::InFlight);
        }

        let outcome = self.process_claimed(client, mailbox, message_id, now).await;
        if let Err(e) = store::ledger::release_claim(&self.db, &mailbox.id, message_id).await {
            warn!(mailbox_id = %mailbox.id, message_id, "Could not release claim: {}", e);
        }
        outcome
    }

    async fn on_ledger(&self, mailbox_id: &str, message_id: &str) -> Result<bool> {
        let found = store::ledger::find_by_message(&self.db, mailbox_id, message_id)
            .await?
            .is_some();
        if found {
            debug!(mailbox_id, message_id, "Already on the ledger");
        }
        Ok(found)
    }

    async fn process_claimed(
        &self,
        client: &dyn MailboxClient,
        mailbox: &Mailbox,
        message_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ProcessOutcome> {
        // A duplicate may have recorded and released between the first lookup and our claim
        if self.on_ledger(&mailbox.id, message_id).await? {
            return Ok(ProcessOutcome::AlreadyProcessed);
        }

        let settings = self.settings.settings_for(mailbox).await?;

        let message = match client.get_metadata(message_id).await {
            Ok(message) => message,
            Err(TriageError::MessageNotFound(_)) => {
                debug!(mailbox_id = %mailbox.id, message_id, "Message gone before processing");
                return Ok(ProcessOutcome::Vanished);
            }
            Err(e) => return Err(e),
        };

        let result = self.classify(&message, &settings, now).await?;
        self.act(client, mailbox, &settings, &message, result, now)
            .await
    }

    async fn act(
        &self,
        client: &dyn MailboxClient,
        mailbox: &Mailbox,
        settings: &MailboxSettings,
        message: &MessageMetadata,
        result: ClassificationResult,
        now: DateTime<Utc>,
    ) -> Result<ProcessOutcome> {
        let mode = if settings.action_mode {
            ExecutionMode::Action
        } else {
            ExecutionMode::Sandbox
        };

        let outcome = self
            .executor
            .execute(client, message, result.disposition, mode)
            .await?;

        // The archive already happened, so the record is written even when
        // labeling must stop the job
        let mut deferred = None;
        let applied_label = if result.disposition == Disposition::Archive
            && outcome.succeeded()
            && settings.auto_label
        {
            match self.labeler.label(client, &mailbox.id, message).await {
                Ok(label) => label,
                Err(e) => {
                    warn!(
                        mailbox_id = %mailbox.id,
                        message_id = %message.id,
                        "Labeling failed: {}",
                        e
                    );
                    if e.must_propagate() {
                        deferred = Some(e);
                    }
                    None
                }
            }
        } else {
            None
        };

        let record = self.build_record(mailbox, message, result, mode, outcome, applied_label, now);
        let appended = store::ledger::append(&self.db, &record).await?;
        if let Some(e) = deferred {
            return Err(e);
        }
        if !appended {
            return Ok(ProcessOutcome::AlreadyProcessed);
        }

        if let Some(error) = record.execution_error.as_deref() {
            notify_detached(
                &self.notifier,
                &mailbox.id,
                NotificationKind::ActionFailed,
                json!({
                    "record_id": record.id,
                    "message_id": record.message_id,
                    "disposition": record.disposition.as_str(),
                    "error": error,
                }),
            );
        }

        info!(
            mailbox_id = %mailbox.id,
            message_id = %record.message_id,
            disposition = %record.disposition,
            confidence = record.confidence,
            tier = ?record.tier,
            mode = mode.as_str(),
            executed = record.executed_at.is_some(),
            "Message processed"
        );
        Ok(ProcessOutcome::Recorded(Box::new(record)))
    }

    #[allow(clippy::too_many_arguments)]
    fn build_record(
        &self,
        mailbox: &Mailbox,
        message: &MessageMetadata,
        result: ClassificationResult,
        mode: ExecutionMode,
        outcome: ExecutionOutcome,
        applied_label: Option<String>,
        now: DateTime<Utc>,
    ) -> ActionRecord {
        let executed_at = outcome.executed_at;
        ActionRecord {
            id: Uuid::new_v4().to_string(),
            mailbox_id: mailbox.id.clone(),
            message_id: message.id.clone(),
            thread_id: message.thread_id.clone(),
            sender_email: message.sender_email.clone(),
            subject: message.subject.clone(),
            disposition: result.disposition,
            confidence: result.confidence,
            reason: result.reason,
            signals: result.signals,
            tier: result.tier,
            mode,
            pre_action_labels: outcome.pre_action_labels,
            applied_label,
            created_at: now,
            executed_at,
            execution_error: outcome.error,
            undone_at: None,
            undo_deadline: executed_at.unwrap_or(now) + self.undo_window,
        }
    }

    /// Undo a ledger record through its mailbox's client
    pub async fn undo(&self, record_id: &str, now: DateTime<Utc>) -> Result<ActionRecord> {
        let record = store::ledger::find(&self.db, record_id)
            .await?
            .ok_or_else(|| TriageError::RecordNotFound(record_id.to_string()))?;
        let mailbox = store::mailboxes::require(&self.db, &record.mailbox_id).await?;
        let client = self.clients.client_for(&mailbox).await?;
        self.executor.undo(client.as_ref(), record_id, now).await
    }
}
