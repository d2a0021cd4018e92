//! Applies dispositions to the mailbox and reverses them on request

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::client::MailboxClient;
use crate::error::{Result, TriageError};
use crate::models::{ActionRecord, Disposition, ExecutionMode, MessageMetadata};
use crate::store::{self, Database};

/// System labels that cannot be set through a label modify call
const UNRESTORABLE_LABELS: &[&str] = &["TRASH", "SPAM", "DRAFT", "SENT", "CHAT"];

/// What happened when a disposition was applied
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionOutcome {
    /// Labels on the message right before the action
    pub pre_action_labels: Vec<String>,
    pub executed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl ExecutionOutcome {
    pub fn succeeded(&self) -> bool {
        self.executed_at.is_some()
    }
}

/// Errors that go back to the worker instead of onto the ledger
fn hand_to_worker(error: &TriageError) -> bool {
    error.must_propagate() || matches!(error, TriageError::RateLimitExceeded { .. })
}

#[derive(Debug, Clone)]
pub struct ActionExecutor {
    db: Database,
}

impl ActionExecutor {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Apply `disposition` in action mode; sandbox mode and keep/review make no remote call
    pub async fn execute(
        &self,
        client: &dyn MailboxClient,
        message: &MessageMetadata,
        disposition: Disposition,
        mode: ExecutionMode,
    ) -> Result<ExecutionOutcome> {
        if mode == ExecutionMode::Sandbox || !disposition.is_mutating() {
            debug!(
                message_id = %message.id,
                %disposition,
                mode = mode.as_str(),
                "No remote action"
            );
            return Ok(ExecutionOutcome {
                pre_action_labels: message.labels.clone(),
                ..Default::default()
            });
        }

        let pre_action_labels = match client.get_label_ids(&message.id).await {
            Ok(labels) => labels,
            Err(e) if hand_to_worker(&e) => return Err(e),
            Err(e) => {
                warn!(message_id = %message.id, "Could not read labels before action: {}", e);
                return Ok(ExecutionOutcome {
                    pre_action_labels: message.labels.clone(),
                    executed_at: None,
                    error: Some(e.to_string()),
                });
            }
        };

        let result = match disposition {
            Disposition::Archive => client.archive(&message.id).await,
            Disposition::Trash => client.trash(&message.id).await,
            Disposition::Keep | Disposition::Review => Ok(()),
        };

        match result {
            Ok(()) => {
                info!(message_id = %message.id, %disposition, "Action executed");
                Ok(ExecutionOutcome {
                    pre_action_labels,
                    executed_at: Some(Utc::now()),
                    error: None,
                })
            }
            Err(e) if hand_to_worker(&e) => Err(e),
            Err(e) => {
                warn!(message_id = %message.id, %disposition, "Action failed: {}", e);
                Ok(ExecutionOutcome {
                    pre_action_labels,
                    executed_at: None,
                    error: Some(e.to_string()),
                })
            }
        }
    }

    /// Reverse an executed action and restore its pre-action labels
    pub async fn undo(
        &self,
        client: &dyn MailboxClient,
        record_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ActionRecord> {
        let mut record = store::ledger::find(&self.db, record_id)
            .await?
            .ok_or_else(|| TriageError::RecordNotFound(record_id.to_string()))?;

        if !record.is_reversible() {
            return Err(TriageError::NothingToUndo(record_id.to_string()));
        }
        if record.is_undone() {
            return Err(TriageError::AlreadyUndone(record_id.to_string()));
        }
        if now > record.undo_deadline {
            return Err(TriageError::UndoExpired {
                record_id: record_id.to_string(),
                deadline: record.undo_deadline,
            });
        }

        match record.disposition {
            Disposition::Trash => client.untrash(&record.message_id).await?,
            Disposition::Archive => client.unarchive(&record.message_id).await?,
            Disposition::Keep | Disposition::Review => {}
        }

        let current = client.get_label_ids(&record.message_id).await?;
        let (add, remove) = label_diff(&record.pre_action_labels, &current);
        if !add.is_empty() || !remove.is_empty() {
            debug!(
                record_id,
                add = ?add,
                remove = ?remove,
                "Restoring pre-action labels"
            );
            client
                .modify_labels(&record.message_id, &add, &remove)
                .await?;
        }

        store::ledger::mark_undone(&self.db, record_id, now).await?;
        record.undone_at = Some(now);

        info!(
            record_id,
            message_id = %record.message_id,
            disposition = %record.disposition,
            "Action undone"
        );
        Ok(record)
    }
}

/// Labels to add and remove so `current` becomes `target`, skipping system labels
pub fn label_diff(target: &[String], current: &[String]) -> (Vec<String>, Vec<String>) {
    let restorable = |label: &&String| !UNRESTORABLE_LABELS.contains(&label.as_str());
    let target_set: HashSet<&String> = target.iter().filter(restorable).collect();
    let current_set: HashSet<&String> = current.iter().filter(restorable).collect();

    let add = target
        .iter()
        .filter(restorable)
        .filter(|l| !current_set.contains(l))
        .cloned()
        .collect();
    let remove = current
        .iter()
        .filter(restorable)
        .filter(|l| !target_set.contains(l))
        .cloned()
        .collect();
    (add, remove)
}
