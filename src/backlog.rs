//! Paged reprocessing of old inbox messages
//!
//! Each page is one queued job. Progress lives in SQLite so a run survives
//! restarts, pauses and requeues.

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::collaborators::{
    notify_detached, NotificationDispatcher, NotificationKind, SettingsProvider,
};
use crate::error::{Result, TriageError};
use crate::models::{BacklogProgress, BacklogSettings, Mailbox};
use crate::pause::PauseRegistry;
use crate::pipeline::{Pipeline, ProcessOutcome};
use crate::queue::{Job, WorkQueue};
use crate::store::{self, Database};

/// Search query for inbox messages older than `age_days`
pub fn backlog_query(age_days: u32) -> String {
    format!("in:inbox older_than:{}d", age_days)
}

/// Result of one backlog page
#[derive(Debug, Clone, PartialEq)]
pub struct PageOutcome {
    pub visited: usize,
    pub progress: BacklogProgress,
}

pub struct BacklogProcessor {
    db: Database,
    queue: WorkQueue,
    pipeline: Arc<Pipeline>,
    settings: Arc<dyn SettingsProvider>,
    pauses: PauseRegistry,
    notifier: Arc<dyn NotificationDispatcher>,
}

impl BacklogProcessor {
    pub fn new(
        db: Database,
        queue: WorkQueue,
        pipeline: Arc<Pipeline>,
        settings: Arc<dyn SettingsProvider>,
        pauses: PauseRegistry,
        notifier: Arc<dyn NotificationDispatcher>,
    ) -> Self {
        Self {
            db,
            queue,
            pipeline,
            settings,
            pauses,
            notifier,
        }
    }

    /// Reset progress and queue the first page
    pub async fn start(&self, mailbox: &Mailbox) -> Result<BacklogProgress> {
        let progress = BacklogProgress::new(&mailbox.id, Utc::now());
        store::backlog::save(&self.db, &progress).await?;

        let queued = self
            .queue
            .enqueue(Job::Backlog {
                mailbox_id: mailbox.id.clone(),
                page_token: None,
            })
            .await?;
        if !queued {
            debug!(mailbox_id = %mailbox.id, "Backlog page already queued");
        }

        info!(mailbox_id = %mailbox.id, "Backlog run started");
        Ok(progress)
    }

    pub async fn progress(&self, mailbox_id: &str) -> Result<Option<BacklogProgress>> {
        store::backlog::load(&self.db, mailbox_id).await
    }

    /// Process one page and queue the next
    ///
    /// A pause part-way through saves progress and returns `MailboxPaused`;
    /// the page is redone later and the ledger skips what was finished.
    pub async fn run_page(
        &self,
        mailbox: &Mailbox,
        page_token: Option<&str>,
    ) -> Result<PageOutcome> {
        self.pauses.ensure_running(&mailbox.id).await?;

        let settings: BacklogSettings = self.settings.settings_for(mailbox).await?.backlog;
        let mut progress = self
            .progress(&mailbox.id)
            .await?
            .unwrap_or_else(|| BacklogProgress::new(&mailbox.id, Utc::now()));

        let client = self.pipeline.clients().client_for(mailbox).await?;
        let page = client
            .list_backlog_page(
                &backlog_query(settings.age_days),
                page_token,
                settings.batch_size.max(1),
            )
            .await?;

        if progress.total.is_none() {
            progress.total = page.estimated_total;
        }
        progress.next_page_token = page_token.map(str::to_string);

        let mut visited = 0;
        for message_id in &page.ids {
            if self.pauses.is_paused(&mailbox.id).await? {
                self.save(&mut progress).await?;
                info!(mailbox_id = %mailbox.id, visited, "Backlog paused mid-page");
                return Err(TriageError::MailboxPaused(mailbox.id.clone()));
            }

            match self
                .pipeline
                .process_with(client.as_ref(), mailbox, message_id)
                .await
            {
                Ok(ProcessOutcome::AlreadyProcessed) => {}
                Ok(_) => progress.processed += 1,
                Err(e) if e.must_propagate() || e.is_transient() => {
                    self.save(&mut progress).await?;
                    return Err(e);
                }
                Err(e) => {
                    warn!(mailbox_id = %mailbox.id, %message_id, "Backlog message skipped: {}", e);
                    progress.processed += 1;
                }
            }
            visited += 1;
        }

        match page.next_page_token {
            Some(next) => {
                progress.next_page_token = Some(next.clone());
                self.save(&mut progress).await?;
                self.queue
                    .enqueue(Job::Backlog {
                        mailbox_id: mailbox.id.clone(),
                        page_token: Some(next),
                    })
                    .await?;
                debug!(
                    mailbox_id = %mailbox.id,
                    processed = progress.processed,
                    total = ?progress.total,
                    "Backlog page done"
                );
            }
            None => {
                progress.next_page_token = None;
                progress.finished = true;
                self.save(&mut progress).await?;
                notify_detached(
                    &self.notifier,
                    &mailbox.id,
                    NotificationKind::BacklogComplete,
                    json!({
                        "processed": progress.processed,
                        "total": progress.total,
                    }),
                );
                info!(
                    mailbox_id = %mailbox.id,
                    processed = progress.processed,
                    "Backlog run finished"
                );
            }
        }

        Ok(PageOutcome { visited, progress })
    }

    async fn save(&self, progress: &mut BacklogProgress) -> Result<()> {
        progress.updated_at = Utc::now();
        store::backlog::save(&self.db, progress).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backlog_query() {
        assert_eq!(backlog_query(30), "in:inbox older_than:30d");
    }
}
