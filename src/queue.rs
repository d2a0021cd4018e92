//! Typed jobs over the durable SQLite queue.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, TriageError};
use crate::store::queue::{self as rows, FailedJob, NewJob};
use crate::store::Database;

/// One unit of work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Job {
    /// Pull the change feed for a mailbox
    Reconcile { mailbox_id: String },
    /// Classify (and maybe act on) one message
    Process {
        mailbox_id: String,
        message_id: String,
    },
    /// One page of the backlog run
    Backlog {
        mailbox_id: String,
        page_token: Option<String>,
    },
}

impl Job {
    pub fn mailbox_id(&self) -> &str {
        match self {
            Job::Reconcile { mailbox_id }
            | Job::Process { mailbox_id, .. }
            | Job::Backlog { mailbox_id, .. } => mailbox_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Job::Reconcile { .. } => "reconcile",
            Job::Process { .. } => "process",
            Job::Backlog { .. } => "backlog",
        }
    }

    /// Pending jobs with the same key collapse into one
    pub fn dedupe_key(&self) -> Option<String> {
        match self {
            Job::Reconcile { mailbox_id } => Some(format!("reconcile:{}", mailbox_id)),
            Job::Process {
                mailbox_id,
                message_id,
            } => Some(format!("process:{}:{}", mailbox_id, message_id)),
            Job::Backlog { mailbox_id, .. } => Some(format!("backlog:{}", mailbox_id)),
        }
    }

    fn to_row(&self, not_before: DateTime<Utc>) -> Result<NewJob> {
        Ok(NewJob {
            mailbox_id: self.mailbox_id().to_string(),
            kind: self.kind().to_string(),
            payload: serde_json::to_string(self)?,
            dedupe_key: self.dedupe_key(),
            not_before,
        })
    }
}

/// A job claimed by a worker
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: i64,
    pub job: Job,
    /// Attempts including this one
    pub attempts: u32,
}

/// Durable queue handle
#[derive(Debug, Clone)]
pub struct WorkQueue {
    db: Database,
    lease: Duration,
}

impl WorkQueue {
    pub fn new(db: Database, lease: Duration) -> Self {
        Self { db, lease }
    }

    pub async fn enqueue(&self, job: Job) -> Result<bool> {
        Ok(self.enqueue_many(vec![job]).await? == 1)
    }

    /// Enqueue to run no earlier than `not_before`
    pub async fn enqueue_at(&self, job: Job, not_before: DateTime<Utc>) -> Result<bool> {
        let row = job.to_row(not_before)?;
        Ok(rows::enqueue_many(&self.db, vec![row]).await? == 1)
    }

    /// All jobs land in one transaction
    pub async fn enqueue_many(&self, jobs: Vec<Job>) -> Result<usize> {
        let now = Utc::now();
        let rows = jobs
            .iter()
            .map(|job| job.to_row(now))
            .collect::<Result<Vec<_>>>()?;
        let inserted = rows::enqueue_many(&self.db, rows).await?;
        debug!(requested = jobs.len(), inserted, "Enqueued jobs");
        Ok(inserted)
    }

    pub async fn claim(&self, now: DateTime<Utc>) -> Result<Option<ClaimedJob>> {
        let Some(row) = rows::claim(&self.db, now, self.lease).await? else {
            return Ok(None);
        };

        match serde_json::from_str::<Job>(&row.payload) {
            Ok(job) => Ok(Some(ClaimedJob {
                id: row.id,
                job,
                attempts: row.attempts,
            })),
            Err(e) => {
                // An unreadable payload can never succeed
                let message = format!("unreadable {} payload: {}", row.kind, e);
                rows::fail(&self.db, row.id, now, &message).await?;
                Err(TriageError::StateError(message))
            }
        }
    }

    pub async fn complete(&self, id: i64) -> Result<()> {
        rows::complete(&self.db, id).await
    }

    pub async fn requeue(
        &self,
        id: i64,
        delay: std::time::Duration,
        error: Option<String>,
    ) -> Result<()> {
        let delay = Duration::from_std(delay).unwrap_or_else(|_| Duration::hours(1));
        rows::requeue(&self.db, id, Utc::now() + delay, error).await
    }

    pub async fn fail(&self, id: i64, error: &str) -> Result<()> {
        rows::fail(&self.db, id, Utc::now(), error).await
    }

    /// Put a mailbox's failed jobs back in line, for use after re-authorization
    pub async fn revive_failed(&self, mailbox_id: &str) -> Result<usize> {
        rows::revive_failed(&self.db, mailbox_id, Utc::now()).await
    }

    pub async fn pending_count(&self, mailbox_id: Option<&str>) -> Result<u64> {
        rows::pending_count(&self.db, mailbox_id).await
    }

    pub async fn failed(&self, mailbox_id: &str) -> Result<Vec<FailedJob>> {
        rows::list_failed(&self.db, mailbox_id).await
    }
}
