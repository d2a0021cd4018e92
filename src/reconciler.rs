//! Change-feed reconciliation
//!
//! Turns a mailbox's history cursor into durable Process jobs. Jobs are
//! written before the cursor moves, so a crash between the two replays the
//! same changes instead of losing them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::client::MailboxClient;
use crate::error::{Result, TriageError};
use crate::models::Mailbox;
use crate::queue::{Job, WorkQueue};
use crate::store::{self, Database};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Fetching,
    Applying,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// First sync: cursor stored, nothing enqueued
    Initialized { cursor: String },
    Synced {
        cursor: String,
        enqueued: usize,
        already_processed: usize,
    },
    /// The stored cursor was too old and was replaced
    Reset { cursor: String },
    /// Another reconcile for this mailbox was already running
    Coalesced,
}

type PhaseMap = Arc<Mutex<HashMap<String, SyncPhase>>>;

/// Resets the mailbox to Idle when a reconcile ends, however it ends
struct PhaseGuard {
    phases: PhaseMap,
    mailbox_id: String,
}

impl PhaseGuard {
    fn set(&self, phase: SyncPhase) {
        lock(&self.phases).insert(self.mailbox_id.clone(), phase);
    }
}

impl Drop for PhaseGuard {
    fn drop(&mut self) {
        lock(&self.phases).remove(&self.mailbox_id);
    }
}

fn lock(phases: &PhaseMap) -> MutexGuard<'_, HashMap<String, SyncPhase>> {
    phases.lock().unwrap_or_else(|p| p.into_inner())
}

#[derive(Clone)]
pub struct Reconciler {
    db: Database,
    queue: WorkQueue,
    phases: PhaseMap,
}

impl Reconciler {
    pub fn new(db: Database, queue: WorkQueue) -> Self {
        Self {
            db,
            queue,
            phases: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn phase(&self, mailbox_id: &str) -> SyncPhase {
        lock(&self.phases)
            .get(mailbox_id)
            .copied()
            .unwrap_or(SyncPhase::Idle)
    }

    fn begin(&self, mailbox_id: &str) -> Option<PhaseGuard> {
        let mut phases = lock(&self.phases);
        if phases.contains_key(mailbox_id) {
            return None;
        }
        phases.insert(mailbox_id.to_string(), SyncPhase::Fetching);
        Some(PhaseGuard {
            phases: Arc::clone(&self.phases),
            mailbox_id: mailbox_id.to_string(),
        })
    }

    pub async fn reconcile(
        &self,
        client: &dyn MailboxClient,
        mailbox: &Mailbox,
    ) -> Result<ReconcileOutcome> {
        let Some(guard) = self.begin(&mailbox.id) else {
            debug!(mailbox_id = %mailbox.id, "Reconcile already in progress, coalescing");
            return Ok(ReconcileOutcome::Coalesced);
        };

        // The caller's copy may predate the last advance
        let fresh = store::mailboxes::require(&self.db, &mailbox.id).await?;

        let Some(cursor) = fresh.last_sync_token else {
            let batch = client.list_changes(None).await?;
            store::mailboxes::advance_cursor(&self.db, &mailbox.id, &batch.cursor).await?;
            info!(mailbox_id = %mailbox.id, cursor = %batch.cursor, "Change cursor initialized");
            return Ok(ReconcileOutcome::Initialized {
                cursor: batch.cursor,
            });
        };

        let batch = match client.list_changes(Some(&cursor)).await {
            Ok(batch) => batch,
            Err(TriageError::CursorExpired(_)) => {
                let current = client.list_changes(None).await?;
                store::mailboxes::advance_cursor(&self.db, &mailbox.id, &current.cursor).await?;
                warn!(
                    mailbox_id = %mailbox.id,
                    stale = %cursor,
                    cursor = %current.cursor,
                    "Change cursor expired; reset to current position"
                );
                return Ok(ReconcileOutcome::Reset {
                    cursor: current.cursor,
                });
            }
            Err(e) => return Err(e),
        };

        guard.set(SyncPhase::Applying);

        let known =
            store::ledger::known_message_ids(&self.db, &mailbox.id, &batch.message_ids).await?;
        let jobs: Vec<Job> = batch
            .message_ids
            .iter()
            .filter(|id| !known.contains(id))
            .map(|id| Job::Process {
                mailbox_id: mailbox.id.clone(),
                message_id: id.clone(),
            })
            .collect();

        let enqueued = self.queue.enqueue_many(jobs).await?;
        store::mailboxes::advance_cursor(&self.db, &mailbox.id, &batch.cursor).await?;

        info!(
            mailbox_id = %mailbox.id,
            changes = batch.message_ids.len(),
            enqueued,
            already_processed = known.len(),
            cursor = %batch.cursor,
            "Change feed reconciled"
        );

        Ok(ReconcileOutcome::Synced {
            cursor: batch.cursor,
            enqueued,
            already_processed: known.len(),
        })
    }

    /// Queue a Reconcile for every active mailbox
    pub async fn schedule_all(&self) -> Result<usize> {
        let mailboxes = store::mailboxes::list(&self.db, true).await?;
        let jobs = mailboxes
            .into_iter()
            .map(|m| Job::Reconcile { mailbox_id: m.id })
            .collect();
        self.queue.enqueue_many(jobs).await
    }

    /// Schedule reconciles every `interval` until `shutdown` flips to true
    pub async fn poll_loop(
        &self,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.schedule_all().await {
                        Ok(count) => debug!(count, "Poll tick scheduled reconciles"),
                        Err(e) => warn!("Poll tick failed: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Poll loop stopping");
                        return Ok(());
                    }
                }
            }
        }
    }
}
