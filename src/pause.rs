//! Emergency-stop flags, per mailbox and global
//!
//! Flags live in the database, so `inbox-triage pause` from one process stops
//! a running `watch` in another. `halt` is process-local and is what shutdown
//! uses; it is never persisted.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{Result, TriageError};
use crate::store::{pauses, Database};

pub use crate::store::pauses::GLOBAL_SCOPE;

/// Shared pause registry; clones see the same flags
#[derive(Debug, Clone)]
pub struct PauseRegistry {
    db: Database,
    halted: Arc<AtomicBool>,
}

impl PauseRegistry {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            halted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn pause(&self, mailbox_id: &str) -> Result<()> {
        if pauses::set(&self.db, mailbox_id, Utc::now()).await? {
            warn!(mailbox_id, "Mailbox paused");
        }
        Ok(())
    }

    pub async fn resume(&self, mailbox_id: &str) -> Result<()> {
        if pauses::clear(&self.db, mailbox_id).await? {
            info!(mailbox_id, "Mailbox resumed");
        }
        Ok(())
    }

    /// Stop every mailbox
    pub async fn pause_all(&self) -> Result<()> {
        if pauses::set(&self.db, GLOBAL_SCOPE, Utc::now()).await? {
            warn!("All mailboxes paused");
        }
        Ok(())
    }

    pub async fn resume_all(&self) -> Result<()> {
        let cleared = pauses::clear_all(&self.db).await?;
        self.halted.store(false, Ordering::SeqCst);
        info!(cleared, "All mailboxes resumed");
        Ok(())
    }

    /// Stop remote calls from this process only
    pub fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
        info!("Remote calls halted for shutdown");
    }

    pub async fn is_paused(&self, mailbox_id: &str) -> Result<bool> {
        if self.halted.load(Ordering::SeqCst) {
            return Ok(true);
        }
        pauses::is_paused(&self.db, mailbox_id).await
    }

    /// Fail with `MailboxPaused` when the mailbox may not touch the remote API
    pub async fn ensure_running(&self, mailbox_id: &str) -> Result<()> {
        if self.is_paused(mailbox_id).await? {
            return Err(TriageError::MailboxPaused(mailbox_id.to_string()));
        }
        Ok(())
    }

    /// Every active pause that started at least `threshold` before `now`
    ///
    /// A global pause is reported under the key `"*"`.
    pub async fn paused_longer_than(
        &self,
        threshold: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<(String, DateTime<Utc>)>> {
        pauses::started_before(&self.db, cutoff(threshold, now)).await
    }

    /// Like [`paused_longer_than`](Self::paused_longer_than), but each pause
    /// episode is returned only once
    pub async fn take_overdue(
        &self,
        threshold: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<(String, DateTime<Utc>)>> {
        pauses::take_unalerted(&self.db, cutoff(threshold, now)).await
    }
}

fn cutoff(threshold: Duration, now: DateTime<Utc>) -> DateTime<Utc> {
    let threshold =
        chrono::Duration::from_std(threshold).unwrap_or_else(|_| chrono::Duration::days(36_500));
    now - threshold
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn registry() -> PauseRegistry {
        PauseRegistry::new(Database::open_in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let pauses = registry().await;
        assert!(pauses.ensure_running("mb").await.is_ok());

        pauses.pause("mb").await.unwrap();
        assert!(pauses.is_paused("mb").await.unwrap());
        assert!(!pauses.is_paused("other").await.unwrap());
        assert!(matches!(
            pauses.ensure_running("mb").await,
            Err(TriageError::MailboxPaused(_))
        ));

        pauses.resume("mb").await.unwrap();
        assert!(!pauses.is_paused("mb").await.unwrap());
    }

    #[tokio::test]
    async fn test_global_pause_covers_every_mailbox() {
        let pauses = registry().await;
        pauses.pause_all().await.unwrap();
        assert!(pauses.is_paused("a").await.unwrap());
        assert!(pauses.is_paused("b").await.unwrap());

        pauses.resume_all().await.unwrap();
        assert!(!pauses.is_paused("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_registries_on_one_database_share_flags() {
        let db = Database::open_in_memory().await.unwrap();
        let pauses = PauseRegistry::new(db.clone());
        let other = PauseRegistry::new(db);

        pauses.pause("mb").await.unwrap();
        assert!(other.is_paused("mb").await.unwrap());

        other.resume("mb").await.unwrap();
        assert!(!pauses.is_paused("mb").await.unwrap());
    }

    #[tokio::test]
    async fn test_halt_is_process_local() {
        let db = Database::open_in_memory().await.unwrap();
        let pauses = PauseRegistry::new(db.clone());
        let other = PauseRegistry::new(db);

        pauses.halt();
        assert!(pauses.is_paused("mb").await.unwrap());
        assert!(pauses.clone().is_paused("mb").await.unwrap());
        assert!(!other.is_paused("mb").await.unwrap());
    }

    #[tokio::test]
    async fn test_take_overdue_reports_once() {
        let pauses = registry().await;
        pauses.pause("mb").await.unwrap();
        let later = Utc::now() + chrono::Duration::hours(2);

        let first = pauses
            .take_overdue(Duration::from_secs(3600), later)
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].0, "mb");

        let second = pauses
            .take_overdue(Duration::from_secs(3600), later)
            .await
            .unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_paused_longer_than_is_repeatable() {
        let pauses = registry().await;
        pauses.pause("mb").await.unwrap();
        pauses.pause_all().await.unwrap();
        let later = Utc::now() + chrono::Duration::hours(2);

        let first = pauses
            .paused_longer_than(Duration::from_secs(3600), later)
            .await
            .unwrap();
        let second = pauses
            .paused_longer_than(Duration::from_secs(3600), later)
            .await
            .unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first, second);
        assert!(first.iter().any(|(id, _)| id == GLOBAL_SCOPE));
    }

    #[tokio::test]
    async fn test_take_overdue_ignores_short_pauses() {
        let pauses = registry().await;
        pauses.pause("mb").await.unwrap();
        let overdue = pauses
            .take_overdue(Duration::from_secs(3600), Utc::now())
            .await
            .unwrap();
        assert!(overdue.is_empty());
    }
}
