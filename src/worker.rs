//! Queue workers
//!
//! A fixed pool of tokio tasks claims jobs from the durable queue. What happens
//! to a job after an error depends only on the error class, see
//! [`FailureAction::for_error`].

use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::backlog::BacklogProcessor;
use crate::client::RetryPolicy;
use crate::collaborators::{
    notify_detached, AlertSink, NotificationDispatcher, NotificationKind, Severity,
};
use crate::config::Config;
use crate::error::{Result, TriageError};
use crate::pause::PauseRegistry;
use crate::pipeline::Pipeline;
use crate::queue::{ClaimedJob, Job, WorkQueue};
use crate::reconciler::Reconciler;
use crate::store::{self, Database};

/// Requeue delay for jobs of a paused mailbox
const PAUSED_REQUEUE_DELAY: Duration = Duration::from_secs(60);

/// Sleep between claims when the queue is empty
const IDLE_POLL: Duration = Duration::from_millis(500);

/// What to do with a job whose run failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureAction {
    Requeue(Duration),
    Fail,
    /// Deactivate the mailbox, tell the user, then fail the job
    Reauthorize,
    /// Critical alert, then fail the job
    Escalate,
}

impl FailureAction {
    /// `attempts` counts the run that just failed
    pub fn for_error(
        error: &TriageError,
        attempts: u32,
        max_attempts: u32,
        retry: &RetryPolicy,
    ) -> Self {
        match error {
            TriageError::CredentialExpired(_) => FailureAction::Reauthorize,
            TriageError::PolicyViolation(_) => FailureAction::Escalate,
            TriageError::MailboxPaused(_) => FailureAction::Requeue(PAUSED_REQUEUE_DELAY),
            TriageError::RateLimitExceeded { .. } | TriageError::QuotaWait { .. } => {
                let delay = error.retry_delay().unwrap_or_else(|| retry.backoff(attempts));
                FailureAction::Requeue(delay)
            }
            e if e.is_transient() && attempts < max_attempts => {
                FailureAction::Requeue(retry.backoff(attempts))
            }
            _ => FailureAction::Fail,
        }
    }
}

/// Counts events in a sliding window
#[derive(Debug)]
pub struct FailureBurst {
    window: chrono::Duration,
    threshold: usize,
    events: Mutex<VecDeque<DateTime<Utc>>>,
}

impl FailureBurst {
    pub fn new(threshold: usize, window: Duration) -> Self {
        Self {
            window: chrono::Duration::from_std(window)
                .unwrap_or_else(|_| chrono::Duration::hours(1)),
            threshold: threshold.max(1),
            events: Mutex::new(VecDeque::new()),
        }
    }

    /// Record one event; true when the window now holds at least `threshold`
    pub fn record(&self, now: DateTime<Utc>) -> bool {
        let mut events = self.events.lock().unwrap_or_else(|p| p.into_inner());
        events.push_back(now);
        while events
            .front()
            .is_some_and(|first| now.signed_duration_since(*first) > self.window)
        {
            events.pop_front();
        }
        events.len() >= self.threshold
    }
}

/// Everything a worker needs to run jobs
pub struct WorkerPool {
    db: Database,
    queue: WorkQueue,
    pipeline: Arc<Pipeline>,
    reconciler: Reconciler,
    backlog: Arc<BacklogProcessor>,
    pauses: PauseRegistry,
    notifier: Arc<dyn NotificationDispatcher>,
    alerts: Arc<dyn AlertSink>,
    retry: RetryPolicy,
    max_job_attempts: u32,
    workers: usize,
    credential_failures: FailureBurst,
}

impl WorkerPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &Config,
        db: Database,
        queue: WorkQueue,
        pipeline: Arc<Pipeline>,
        reconciler: Reconciler,
        backlog: Arc<BacklogProcessor>,
        pauses: PauseRegistry,
        notifier: Arc<dyn NotificationDispatcher>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            db,
            queue,
            pipeline,
            reconciler,
            backlog,
            pauses,
            notifier,
            alerts,
            retry: RetryPolicy::from_config(&config.sync),
            max_job_attempts: config.sync.max_job_attempts.max(1),
            workers: config.execution.workers.max(1),
            credential_failures: FailureBurst::new(
                config.alerts.credential_failure_burst,
                Duration::from_secs(config.alerts.credential_failure_window_secs),
            ),
        }
    }

    async fn run_job(&self, job: &Job) -> Result<()> {
        let mailbox = store::mailboxes::require(&self.db, job.mailbox_id()).await?;
        if !mailbox.active {
            debug!(
                mailbox_id = %mailbox.id,
                kind = job.kind(),
                "Dropping job for inactive mailbox"
            );
            return Ok(());
        }
        self.pauses.ensure_running(&mailbox.id).await?;

        match job {
            Job::Reconcile { .. } => {
                let client = self.pipeline.clients().client_for(&mailbox).await?;
                self.reconciler.reconcile(client.as_ref(), &mailbox).await?;
            }
            Job::Process { message_id, .. } => {
                self.pipeline.process_message(&mailbox, message_id).await?;
            }
            Job::Backlog { page_token, .. } => {
                self.backlog.run_page(&mailbox, page_token.as_deref()).await?;
            }
        }
        Ok(())
    }

    /// Run one claimed job and settle it on the queue
    pub async fn execute(&self, claimed: ClaimedJob) -> Result<()> {
        let ClaimedJob { id, job, attempts } = claimed;

        let error = match self.run_job(&job).await {
            Ok(()) => return self.queue.complete(id).await,
            Err(e) => e,
        };

        let action = FailureAction::for_error(&error, attempts, self.max_job_attempts, &self.retry);
        match action {
            FailureAction::Requeue(delay) => {
                debug!(
                    job_id = id,
                    kind = job.kind(),
                    attempts,
                    ?delay,
                    "Requeueing job: {}",
                    error
                );
                self.queue.requeue(id, delay, Some(error.to_string())).await
            }
            FailureAction::Fail => {
                warn!(job_id = id, kind = job.kind(), attempts, "Job failed: {}", error);
                self.queue.fail(id, &error.to_string()).await
            }
            FailureAction::Reauthorize => {
                self.on_credential_expired(job.mailbox_id(), &error).await?;
                self.queue.fail(id, &error.to_string()).await
            }
            FailureAction::Escalate => {
                error!(job_id = id, kind = job.kind(), "Policy violation: {}", error);
                if let Err(e) = self
                    .alerts
                    .raise_alert("Policy violation", &error.to_string(), Severity::Critical)
                    .await
                {
                    warn!("Alert delivery failed: {}", e);
                }
                self.queue.fail(id, &error.to_string()).await
            }
        }
    }

    async fn on_credential_expired(&self, mailbox_id: &str, error: &TriageError) -> Result<()> {
        store::mailboxes::set_active(&self.db, mailbox_id, false).await?;
        warn!(mailbox_id, "Mailbox deactivated: {}", error);

        notify_detached(
            &self.notifier,
            mailbox_id,
            NotificationKind::CredentialExpired,
            json!({ "mailbox_id": mailbox_id, "error": error.to_string() }),
        );

        if self.credential_failures.record(Utc::now()) {
            let message = format!(
                "Credential failures reached the alert threshold; latest mailbox {}",
                mailbox_id
            );
            if let Err(e) = self
                .alerts
                .raise_alert("Mass credential failures", &message, Severity::Critical)
                .await
            {
                warn!("Alert delivery failed: {}", e);
            }
        }
        Ok(())
    }

    /// Claim and run jobs until none is ready; returns how many ran
    pub async fn drain(&self) -> Result<usize> {
        let mut ran = 0;
        while let Some(claimed) = self.claim_next().await? {
            self.execute(claimed).await?;
            ran += 1;
        }
        Ok(ran)
    }

    async fn claim_next(&self) -> Result<Option<ClaimedJob>> {
        loop {
            match self.queue.claim(Utc::now()).await {
                Ok(claimed) => return Ok(claimed),
                // Unreadable payloads are already failed on the queue
                Err(TriageError::StateError(message)) => warn!("Skipping job: {}", message),
                Err(e) => return Err(e),
            }
        }
    }

    async fn worker_loop(self: Arc<Self>, worker: usize, mut shutdown: watch::Receiver<bool>) {
        debug!(worker, "Worker started");
        while !*shutdown.borrow() {
            match self.claim_next().await {
                Ok(Some(claimed)) => {
                    if let Err(e) = self.execute(claimed).await {
                        error!(worker, "Could not settle job: {}", e);
                    }
                }
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(IDLE_POLL) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(e) => {
                    error!(worker, "Queue claim failed: {}", e);
                    tokio::time::sleep(IDLE_POLL).await;
                }
            }
        }
        debug!(worker, "Worker stopped");
    }

    /// Run the pool until `shutdown` flips to true; jobs in flight finish first
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let mut tasks = JoinSet::new();
        for worker in 0..self.workers {
            tasks.spawn(Arc::clone(&self).worker_loop(worker, shutdown.clone()));
        }
        info!(workers = self.workers, "Worker pool running");

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Worker task ended abnormally: {}", e);
            }
        }
        info!("Worker pool drained");
    }
}

/// Alert once per pause episode that outlives `threshold`
pub async fn pause_watchdog(
    pauses: PauseRegistry,
    alerts: Arc<dyn AlertSink>,
    threshold: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let period = (threshold / 4).clamp(Duration::from_secs(1), Duration::from_secs(60));
    let mut ticker = tokio::time::interval(period);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let overdue = match pauses.take_overdue(threshold, Utc::now()).await {
                    Ok(overdue) => overdue,
                    Err(e) => {
                        warn!("Could not read pause flags: {}", e);
                        continue;
                    }
                };
                for (mailbox_id, since) in overdue {
                    let message = format!("Mailbox {} has been paused since {}", mailbox_id, since);
                    let raised = alerts
                        .raise_alert("Long pause", &message, Severity::Warning)
                        .await;
                    if let Err(e) = raised {
                        warn!("Alert delivery failed: {}", e);
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            call_timeout: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_pause_requeues() {
        let action = FailureAction::for_error(
            &TriageError::MailboxPaused("mb".to_string()),
            9,
            5,
            &policy(),
        );
        assert_eq!(action, FailureAction::Requeue(PAUSED_REQUEUE_DELAY));
    }

    #[test]
    fn test_rate_limit_uses_hint() {
        let action = FailureAction::for_error(
            &TriageError::RateLimitExceeded {
                retry_after: Some(42),
            },
            1,
            5,
            &policy(),
        );
        assert_eq!(action, FailureAction::Requeue(Duration::from_secs(42)));

        let wait = Duration::from_millis(1500);
        let action = FailureAction::for_error(
            &TriageError::QuotaWait {
                mailbox_id: "mb".to_string(),
                wait,
            },
            1,
            5,
            &policy(),
        );
        assert_eq!(action, FailureAction::Requeue(wait));
    }

    #[test]
    fn test_transient_backs_off_then_fails() {
        let error = TriageError::ServerError {
            status: 503,
            message: "unavailable".to_string(),
        };
        assert_eq!(
            FailureAction::for_error(&error, 1, 5, &policy()),
            FailureAction::Requeue(Duration::from_millis(500))
        );
        assert_eq!(
            FailureAction::for_error(&error, 3, 5, &policy()),
            FailureAction::Requeue(Duration::from_secs(2))
        );
        assert_eq!(FailureAction::for_error(&error, 5, 5, &policy()), FailureAction::Fail);
    }

    #[test]
    fn test_credential_and_policy_errors() {
        assert_eq!(
            FailureAction::for_error(&TriageError::CredentialExpired("x".into()), 1, 5, &policy()),
            FailureAction::Reauthorize
        );
        assert_eq!(
            FailureAction::for_error(&TriageError::PolicyViolation("x".into()), 1, 5, &policy()),
            FailureAction::Escalate
        );
        assert_eq!(
            FailureAction::for_error(&TriageError::BadRequest("x".into()), 1, 5, &policy()),
            FailureAction::Fail
        );
    }

    #[test]
    fn test_failure_burst_window() {
        let burst = FailureBurst::new(3, Duration::from_secs(600));
        let start = Utc::now();
        assert!(!burst.record(start));
        assert!(!burst.record(start + chrono::Duration::minutes(1)));
        assert!(burst.record(start + chrono::Duration::minutes(2)));

        // The first two fall out of the window
        assert!(!burst.record(start + chrono::Duration::minutes(12)));
    }

    struct CountingAlerts(Mutex<Vec<String>>);

    #[async_trait]
    impl AlertSink for CountingAlerts {
        async fn raise_alert(
            &self,
            title: &str,
            _message: &str,
            _severity: Severity,
        ) -> Result<()> {
            self.0.lock().unwrap().push(title.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_pause_watchdog_alerts_once() {
        let pauses = PauseRegistry::new(Database::open_in_memory().await.unwrap());
        pauses.pause("mb").await.unwrap();
        let alerts = Arc::new(CountingAlerts(Mutex::new(Vec::new())));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(pause_watchdog(
            pauses.clone(),
            alerts.clone(),
            Duration::from_millis(1),
            rx,
        ));
        tokio::time::sleep(Duration::from_millis(2500)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(alerts.0.lock().unwrap().as_slice(), ["Long pause"]);
    }
}
