//! Command-line interface

use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::{self, OAuthCredentialProvider};
use crate::backlog::BacklogProcessor;
use crate::client::{GmailClientFactory, RetryPolicy};
use crate::collaborators::{
    AlertSink, NotificationDispatcher, SettingsProvider, StoredSettings, TracingAlertSink,
    TracingNotifier,
};
use crate::config::{ClassificationThresholds, Config};
use crate::contacts::{CachedContacts, ContactList, ContactsProvider};
use crate::error::{Result, TriageError};
use crate::models::{BacklogSettings, Mailbox, MailboxSettings};
use crate::pause::PauseRegistry;
use crate::pipeline::Pipeline;
use crate::queue::{Job, WorkQueue};
use crate::rate_limiter::RateLimiter;
use crate::reconciler::Reconciler;
use crate::store::{self, Database};
use crate::webhook::{PushAck, PushHandler};
use crate::worker::{pause_watchdog, WorkerPool};

/// How long a claimed queue job stays invisible to other workers
const JOB_LEASE_MINUTES: i64 = 10;

const CONTACTS_CACHE_CAPACITY: usize = 4096;

#[derive(Parser, Debug)]
#[command(name = "inbox-triage")]
#[command(version)]
#[command(about = "Classify and tidy Gmail inboxes with full undo", long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,

    /// Verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Generate example configuration file
    InitConfig {
        /// Path to create config file
        #[arg(short, long, default_value = "config.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(long)]
        force: bool,
    },

    /// Authorize a Gmail account and register it as a mailbox
    Auth {
        /// Mailbox id to use (defaults to the existing id for the account, or a new one)
        #[arg(long)]
        id: Option<String>,

        /// Discard any cached token first
        #[arg(long)]
        force: bool,
    },

    /// List registered mailboxes
    Mailboxes,

    /// Resume processing for a mailbox and requeue its failed jobs
    Activate { mailbox: String },

    /// Stop processing a mailbox
    Deactivate { mailbox: String },

    /// Emergency stop: no remote calls until resumed, including from a running `watch`
    Pause {
        /// Only this mailbox (id or address); every mailbox when omitted
        mailbox: Option<String>,
    },

    /// Lift an emergency stop
    Resume {
        /// Only this mailbox (id or address); every pause when omitted
        mailbox: Option<String>,
    },

    /// Show or change a mailbox's settings
    Settings {
        mailbox: String,

        /// Apply dispositions instead of only recording them
        #[arg(long)]
        action_mode: Option<bool>,

        #[arg(long)]
        auto_label: Option<bool>,

        #[arg(long)]
        trash_threshold: Option<f64>,

        #[arg(long)]
        archive_threshold: Option<f64>,

        #[arg(long)]
        review_threshold: Option<f64>,

        #[arg(long)]
        backlog_age_days: Option<u32>,

        #[arg(long)]
        backlog_batch_size: Option<u32>,
    },

    /// Reconcile mailboxes once and work the queue until it is empty
    Sync {
        /// Only this mailbox (id or address)
        mailbox: Option<String>,
    },

    /// Run workers, polling and the pause watchdog until Ctrl-C
    Watch,

    /// Start a backlog run over old inbox messages
    Backlog {
        mailbox: String,

        /// Only queue the first page; `sync` or `watch` works it later
        #[arg(long)]
        queue_only: bool,
    },

    /// Feed a push notification body (file or stdin) to the push handler
    Push {
        /// File with the JSON body; stdin when omitted
        file: Option<PathBuf>,
    },

    /// Undo an action by ledger record id
    Undo { record_id: String },

    /// Recent ledger records for a mailbox
    History {
        mailbox: String,

        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Ledger totals, queue depth and backlog progress
    Status {
        /// Only this mailbox (id or address)
        mailbox: Option<String>,
    },
}

/// Truncate a string to max_len characters, adding "..." if truncated
fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max_len.saturating_sub(3)).collect::<String>())
    }
}

/// Progress reporter using indicatif
pub struct ProgressReporter {
    multi: MultiProgress,
    spinner_style: ProgressStyle,
}

impl ProgressReporter {
    pub fn with_multi_progress(multi: MultiProgress) -> Self {
        let spinner_style = ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed:>6}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ ");

        Self {
            multi,
            spinner_style,
        }
    }

    pub fn multi_progress(&self) -> &MultiProgress {
        &self.multi
    }

    pub fn add_spinner(&self, msg: &str) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new_spinner());
        pb.set_style(self.spinner_style.clone());
        pb.set_message(msg.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }

    /// Finish a spinner and clear it from the multi-progress display
    pub fn finish_spinner(&self, pb: &ProgressBar, msg: &str) {
        pb.finish_and_clear();
        let _ = self.multi.println(format!("  ✓ {}", msg));
    }
}

/// Every long-lived component, wired from the config
pub struct Runtime {
    pub config: Arc<Config>,
    pub db: Database,
    pub queue: WorkQueue,
    pub pauses: PauseRegistry,
    pub pipeline: Arc<Pipeline>,
    pub reconciler: Reconciler,
    pub backlog: Arc<BacklogProcessor>,
    pub workers: Arc<WorkerPool>,
    pub alerts: Arc<dyn AlertSink>,
}

impl Runtime {
    pub async fn build(config: Config) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        if let Some(parent) = config.storage.database_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let db = Database::open(&config.storage.database_path).await?;
        let queue = WorkQueue::new(db.clone(), chrono::Duration::minutes(JOB_LEASE_MINUTES));
        let pauses = PauseRegistry::new(db.clone());
        let limiter = RateLimiter::from_config(&config.rate_limit);

        let credentials = Arc::new(OAuthCredentialProvider::new(
            &config.storage.credentials_path,
            &config.storage.token_dir,
        ));
        let clients = Arc::new(GmailClientFactory::new(
            credentials,
            limiter,
            pauses.clone(),
            RetryPolicy::from_config(&config.sync),
        ));

        let settings: Arc<dyn SettingsProvider> =
            Arc::new(StoredSettings::new(db.clone(), Arc::clone(&config)));
        let contacts = load_contacts(&config).await?;
        let notifier: Arc<dyn NotificationDispatcher> = Arc::new(TracingNotifier);
        let alerts: Arc<dyn AlertSink> = Arc::new(TracingAlertSink);

        let mut pipeline = Pipeline::new(
            db.clone(),
            &config,
            clients,
            Arc::clone(&settings),
            contacts,
            Arc::clone(&notifier),
        );
        if let Some(assisted) = build_assisted(&config, &db).await? {
            pipeline = pipeline.with_assisted(assisted);
        }
        let pipeline = Arc::new(pipeline);

        let reconciler = Reconciler::new(db.clone(), queue.clone());
        let backlog = Arc::new(BacklogProcessor::new(
            db.clone(),
            queue.clone(),
            Arc::clone(&pipeline),
            settings,
            pauses.clone(),
            Arc::clone(&notifier),
        ));
        let workers = Arc::new(WorkerPool::new(
            &config,
            db.clone(),
            queue.clone(),
            Arc::clone(&pipeline),
            reconciler.clone(),
            Arc::clone(&backlog),
            pauses.clone(),
            notifier,
            Arc::clone(&alerts),
        ));

        Ok(Self {
            config,
            db,
            queue,
            pauses,
            pipeline,
            reconciler,
            backlog,
            workers,
            alerts,
        })
    }
}

async fn load_contacts(config: &Config) -> Result<Arc<dyn ContactsProvider>> {
    let list = match &config.safety.contacts_file {
        Some(path) => ContactList::load(path).await?,
        None => ContactList::new(),
    };
    info!(contacts = list.len(), "Contacts loaded");
    Ok(Arc::new(CachedContacts::new(
        Arc::new(list),
        CONTACTS_CACHE_CAPACITY,
        Duration::from_secs(config.safety.contacts_ttl_hours * 3600),
    )))
}

#[cfg(feature = "ml")]
async fn build_assisted(
    config: &Config,
    db: &Database,
) -> Result<Option<Arc<dyn crate::classifier::Classifier>>> {
    if !config.assisted.enabled {
        return Ok(None);
    }

    let ttl = chrono::Duration::days(i64::from(config.assisted.cache_ttl_days));
    let purged = store::cache::purge_expired(db, ttl, Utc::now()).await?;
    if purged > 0 {
        info!(purged, "Expired assisted verdicts removed");
    }

    use crate::assisted::{AssistedClassifier, OpenAiModel};

    let model = OpenAiModel::from_config(&config.assisted)?;
    Ok(Some(Arc::new(AssistedClassifier::new(
        Arc::new(model),
        db.clone(),
        &config.assisted,
    ))))
}

#[cfg(not(feature = "ml"))]
async fn build_assisted(
    config: &Config,
    _db: &Database,
) -> Result<Option<Arc<dyn crate::classifier::Classifier>>> {
    if config.assisted.enabled {
        warn!("Assisted classification is enabled but this build has no model backend");
    }
    Ok(None)
}

/// Look a mailbox up by id, then by address
pub async fn resolve_mailbox(db: &Database, key: &str) -> Result<Mailbox> {
    if let Some(mailbox) = store::mailboxes::get(db, key).await? {
        return Ok(mailbox);
    }
    store::mailboxes::get_by_email(db, key)
        .await?
        .ok_or_else(|| TriageError::MailboxNotFound(key.to_string()))
}

/// Settings for a newly registered mailbox
pub fn initial_settings(config: &Config) -> MailboxSettings {
    MailboxSettings {
        action_mode: config.execution.action_mode,
        auto_label: config.execution.auto_label,
        thresholds: None,
        backlog: BacklogSettings {
            enabled: false,
            age_days: config.backlog.age_days,
            batch_size: config.backlog.batch_size,
        },
    }
}

pub async fn init_config(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        return Err(TriageError::ConfigError(format!(
            "Configuration file already exists at {:?}. Use --force to overwrite.",
            output
        )));
    }
    Config::create_example(output).await?;

    println!("Created example configuration file at: {:?}", output);
    println!("\nKey settings to review:");
    println!("  - execution.action_mode: apply dispositions (false = sandbox)");
    println!("  - classification.thresholds: trash / archive / review cut-offs");
    println!("  - assisted.enabled: escalate uncertain calls to a language model");
    println!("  - safety.contacts_file: senders that are always kept");
    Ok(())
}

/// Browser consent, then register or refresh the mailbox
pub async fn authorize(config: &Config, id: Option<String>, force: bool) -> Result<Mailbox> {
    tokio::fs::create_dir_all(&config.storage.token_dir).await?;
    if let Some(parent) = config.storage.database_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let db = Database::open(&config.storage.database_path).await?;

    let pending = config
        .storage
        .token_dir
        .join(format!("pending-{}.json", Uuid::new_v4()));
    let hub = auth::authorize_interactive(&config.storage.credentials_path, &pending).await?;

    let (_, profile) = hub
        .users()
        .get_profile("me")
        .add_scope(auth::REQUIRED_SCOPES[0])
        .doit()
        .await?;
    let email = profile.email_address.ok_or_else(|| {
        TriageError::AuthError("authorized account has no email address".to_string())
    })?;

    let existing = store::mailboxes::get_by_email(&db, &email).await?;
    let mailbox_id = id
        .or_else(|| existing.as_ref().map(|m| m.id.clone()))
        .unwrap_or_else(|| Uuid::new_v4().simple().to_string());

    let token = auth::token_path(&config.storage.token_dir, &mailbox_id);
    if force && token.exists() {
        tokio::fs::remove_file(&token).await?;
        info!("Removed existing token cache");
    }
    tokio::fs::rename(&pending, &token).await?;
    auth::secure_token_file(&token).await?;

    let mailbox = match existing {
        Some(mut mailbox) if mailbox.id == mailbox_id => {
            mailbox.active = true;
            mailbox
        }
        _ => Mailbox {
            id: mailbox_id.clone(),
            email: email.clone(),
            credential_ref: token.display().to_string(),
            last_sync_token: None,
            active: true,
            settings: initial_settings(config),
            created_at: Utc::now(),
        },
    };
    let mailbox = store::mailboxes::upsert(&db, &mailbox).await?;
    store::mailboxes::set_active(&db, &mailbox.id, true).await?;

    let queue = WorkQueue::new(db, chrono::Duration::minutes(JOB_LEASE_MINUTES));
    let revived = queue.revive_failed(&mailbox.id).await?;
    if revived > 0 {
        info!(mailbox_id = %mailbox.id, revived, "Failed jobs requeued after re-authorization");
    }

    println!("Authorized {} as mailbox {}", email, mailbox.id);
    println!("Token cached at: {:?}", token);
    Ok(mailbox)
}

pub async fn list_mailboxes(db: &Database) -> Result<()> {
    let mailboxes = store::mailboxes::list(db, false).await?;
    if mailboxes.is_empty() {
        println!("No mailboxes registered. Run: inbox-triage auth");
        return Ok(());
    }

    println!("{:<34} {:<32} {:<8} {:<8} CURSOR", "ID", "EMAIL", "ACTIVE", "MODE");
    for mailbox in mailboxes {
        println!(
            "{:<34} {:<32} {:<8} {:<8} {}",
            mailbox.id,
            truncate_string(&mailbox.email, 32),
            if mailbox.active { "yes" } else { "no" },
            if mailbox.settings.action_mode { "action" } else { "sandbox" },
            mailbox.last_sync_token.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

pub async fn set_active(db: &Database, key: &str, active: bool) -> Result<()> {
    let mailbox = resolve_mailbox(db, key).await?;
    store::mailboxes::set_active(db, &mailbox.id, active).await?;

    if active {
        let queue = WorkQueue::new(db.clone(), chrono::Duration::minutes(JOB_LEASE_MINUTES));
        let revived = queue.revive_failed(&mailbox.id).await?;
        println!("Mailbox {} activated ({} failed jobs requeued)", mailbox.id, revived);
    } else {
        println!("Mailbox {} deactivated", mailbox.id);
    }
    Ok(())
}

/// Set or lift the emergency stop for one mailbox, or for all when `key` is `None`
pub async fn set_paused(db: &Database, key: Option<&str>, paused: bool) -> Result<()> {
    let pauses = PauseRegistry::new(db.clone());
    match key {
        Some(key) => {
            let mailbox = resolve_mailbox(db, key).await?;
            if paused {
                pauses.pause(&mailbox.id).await?;
                println!("Mailbox {} paused", mailbox.id);
            } else {
                pauses.resume(&mailbox.id).await?;
                println!("Mailbox {} resumed", mailbox.id);
            }
        }
        None if paused => {
            pauses.pause_all().await?;
            println!("All mailboxes paused");
        }
        None => {
            pauses.resume_all().await?;
            println!("All pauses lifted");
        }
    }
    Ok(())
}

/// Requested settings changes; `None` leaves a field alone
#[derive(Debug, Default, Clone)]
pub struct SettingsUpdate {
    pub action_mode: Option<bool>,
    pub auto_label: Option<bool>,
    pub trash_threshold: Option<f64>,
    pub archive_threshold: Option<f64>,
    pub review_threshold: Option<f64>,
    pub backlog_age_days: Option<u32>,
    pub backlog_batch_size: Option<u32>,
}

impl SettingsUpdate {
    fn is_empty(&self) -> bool {
        self.action_mode.is_none()
            && self.auto_label.is_none()
            && self.trash_threshold.is_none()
            && self.archive_threshold.is_none()
            && self.review_threshold.is_none()
            && self.backlog_age_days.is_none()
            && self.backlog_batch_size.is_none()
    }

    /// Apply to `settings`, validating any threshold change
    pub fn apply(
        &self,
        settings: &mut MailboxSettings,
        defaults: ClassificationThresholds,
    ) -> Result<()> {
        if let Some(action_mode) = self.action_mode {
            settings.action_mode = action_mode;
        }
        if let Some(auto_label) = self.auto_label {
            settings.auto_label = auto_label;
        }
        if self.trash_threshold.is_some()
            || self.archive_threshold.is_some()
            || self.review_threshold.is_some()
        {
            let mut thresholds = settings.thresholds.unwrap_or(defaults);
            thresholds.trash = self.trash_threshold.unwrap_or(thresholds.trash);
            thresholds.archive = self.archive_threshold.unwrap_or(thresholds.archive);
            thresholds.review = self.review_threshold.unwrap_or(thresholds.review);
            thresholds.validate()?;
            settings.thresholds = Some(thresholds);
        }
        if let Some(age_days) = self.backlog_age_days {
            settings.backlog.age_days = age_days;
        }
        if let Some(batch_size) = self.backlog_batch_size {
            settings.backlog.batch_size = batch_size.max(1);
        }
        Ok(())
    }
}

pub async fn update_settings(
    config: &Config,
    db: &Database,
    key: &str,
    update: SettingsUpdate,
) -> Result<()> {
    let mut mailbox = resolve_mailbox(db, key).await?;
    if !update.is_empty() {
        update.apply(&mut mailbox.settings, config.classification.thresholds)?;
        store::mailboxes::update_settings(db, &mailbox.id, &mailbox.settings).await?;
        info!(mailbox_id = %mailbox.id, "Settings updated");
    }

    let effective = StoredSettings::new(db.clone(), Arc::new(config.clone()))
        .merge(mailbox.settings.clone());
    println!("Stored settings for {}:", mailbox.id);
    println!("{}", serde_json::to_string_pretty(&mailbox.settings)?);
    println!("Effective (merged with config):");
    println!("{}", serde_json::to_string_pretty(&effective)?);
    Ok(())
}

/// Reconcile once and drain the queue
pub async fn sync_once(
    runtime: &Runtime,
    key: Option<&str>,
    reporter: &ProgressReporter,
) -> Result<usize> {
    let scheduled = match key {
        Some(key) => {
            let mailbox = resolve_mailbox(&runtime.db, key).await?;
            usize::from(
                runtime
                    .queue
                    .enqueue(Job::Reconcile {
                        mailbox_id: mailbox.id,
                    })
                    .await?,
            )
        }
        None => runtime.reconciler.schedule_all().await?,
    };

    let spinner = reporter.add_spinner(&format!("Working the queue ({} reconciles)...", scheduled));
    let ran = runtime.workers.drain().await?;
    reporter.finish_spinner(&spinner, &format!("{} jobs run", ran));

    let pending = runtime.queue.pending_count(None).await?;
    if pending > 0 {
        let _ = reporter
            .multi_progress()
            .println(format!("{} jobs are waiting on a backoff delay", pending));
    }
    Ok(ran)
}

/// Workers, poll loop and watchdog until Ctrl-C
pub async fn run_watch(runtime: &Runtime) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let pool = tokio::spawn(Arc::clone(&runtime.workers).run(shutdown_rx.clone()));
    let poll = tokio::spawn({
        let reconciler = runtime.reconciler.clone();
        let interval = runtime.config.poll_interval();
        let rx = shutdown_rx.clone();
        async move { reconciler.poll_loop(interval, rx).await }
    });
    let watchdog = tokio::spawn(pause_watchdog(
        runtime.pauses.clone(),
        Arc::clone(&runtime.alerts),
        Duration::from_secs(runtime.config.alerts.pause_alert_after_secs),
        shutdown_rx,
    ));

    info!("Watching; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    // Nothing new reaches the remote API while in-flight jobs finish
    runtime.pauses.halt();
    let _ = shutdown_tx.send(true);

    if let Err(e) = pool.await {
        warn!("Worker pool task failed: {}", e);
    }
    match poll.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Poll loop ended with error: {}", e),
        Err(e) => warn!("Poll loop task failed: {}", e),
    }
    if let Err(e) = watchdog.await {
        warn!("Pause watchdog task failed: {}", e);
    }
    info!("Shutdown complete");
    Ok(())
}

pub async fn start_backlog(
    runtime: &Runtime,
    key: &str,
    queue_only: bool,
    reporter: &ProgressReporter,
) -> Result<()> {
    let mailbox = resolve_mailbox(&runtime.db, key).await?;
    runtime.backlog.start(&mailbox).await?;
    if queue_only {
        println!("Backlog run queued for {}", mailbox.id);
        return Ok(());
    }

    let spinner = reporter.add_spinner("Processing backlog...");
    runtime.workers.drain().await?;
    spinner.finish_and_clear();

    match runtime.backlog.progress(&mailbox.id).await? {
        Some(progress) => {
            let percent = progress
                .percent()
                .map(|p| format!("{:.1}%", p))
                .unwrap_or_else(|| "unknown".to_string());
            println!(
                "Backlog for {}: {} processed ({}), {}",
                mailbox.id,
                progress.processed,
                percent,
                if progress.finished { "finished" } else { "in progress" }
            );
        }
        None => println!("No backlog progress recorded for {}", mailbox.id),
    }
    Ok(())
}

pub async fn push(db: &Database, file: Option<&Path>) -> Result<PushAck> {
    let body = match file {
        Some(path) => tokio::fs::read(path).await?,
        None => {
            let mut body = Vec::new();
            tokio::io::stdin().read_to_end(&mut body).await?;
            body
        }
    };

    let queue = WorkQueue::new(db.clone(), chrono::Duration::minutes(JOB_LEASE_MINUTES));
    let ack = PushHandler::new(db.clone(), queue).handle(&body).await?;
    match &ack {
        PushAck::Enqueued { mailbox_id } => println!("Reconcile queued for {}", mailbox_id),
        PushAck::Ignored { reason } => println!("Ignored: {}", reason),
    }
    Ok(ack)
}

pub async fn undo(runtime: &Runtime, record_id: &str) -> Result<()> {
    let record = runtime.pipeline.undo(record_id, Utc::now()).await?;
    println!(
        "Undid {} of message {} ({})",
        record.disposition, record.message_id, record.subject
    );
    Ok(())
}

pub async fn history(db: &Database, key: &str, limit: usize) -> Result<()> {
    let mailbox = resolve_mailbox(db, key).await?;
    let records = store::ledger::recent(db, &mailbox.id, limit).await?;
    if records.is_empty() {
        println!("No records for {}", mailbox.id);
        return Ok(());
    }

    println!(
        "{:<36} {:<16} {:<8} {:<5} {:<9} {:<28} SUBJECT",
        "RECORD", "WHEN", "ACTION", "CONF", "STATE", "SENDER"
    );
    for record in records {
        let state = if record.is_undone() {
            "undone"
        } else if record.execution_error.is_some() {
            "failed"
        } else if record.executed_at.is_some() {
            "executed"
        } else {
            "recorded"
        };
        println!(
            "{:<36} {:<16} {:<8} {:<5.2} {:<9} {:<28} {}",
            record.id,
            record.created_at.format("%Y-%m-%d %H:%M"),
            record.disposition,
            record.confidence,
            state,
            truncate_string(&record.sender_email, 28),
            truncate_string(&record.subject, 50),
        );
    }
    Ok(())
}

pub async fn status(db: &Database, key: Option<&str>) -> Result<()> {
    let mailboxes = match key {
        Some(key) => vec![resolve_mailbox(db, key).await?],
        None => store::mailboxes::list(db, false).await?,
    };
    let queue = WorkQueue::new(db.clone(), chrono::Duration::minutes(JOB_LEASE_MINUTES));
    let pauses = PauseRegistry::new(db.clone());

    println!("========================================");
    println!("Queue: {} jobs pending", queue.pending_count(None).await?);
    for mailbox in mailboxes {
        println!("========================================");
        println!(
            "{} <{}> {}{}",
            mailbox.id,
            mailbox.email,
            if mailbox.active { "active" } else { "INACTIVE" },
            if pauses.is_paused(&mailbox.id).await? { ", PAUSED" } else { "" }
        );
        println!("Cursor: {}", mailbox.last_sync_token.as_deref().unwrap_or("-"));
        println!("Pending jobs: {}", queue.pending_count(Some(&mailbox.id)).await?);

        let failed = queue.failed(&mailbox.id).await?;
        if !failed.is_empty() {
            println!("Failed jobs: {}", failed.len());
        }

        let summary = store::ledger::summary(db, &mailbox.id).await?;
        for (disposition, total, executed, undone) in summary {
            println!(
                "  {:<8} {:>6} recorded {:>6} executed {:>6} undone",
                disposition, total, executed, undone
            );
        }

        if let Some(progress) = store::backlog::load(db, &mailbox.id).await? {
            println!(
                "Backlog: {} processed{}{}",
                progress.processed,
                progress
                    .percent()
                    .map(|p| format!(" ({:.1}%)", p))
                    .unwrap_or_default(),
                if progress.finished { ", finished" } else { "" }
            );
        }
    }
    println!("========================================");
    Ok(())
}
