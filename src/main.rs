use anyhow::Result;
use clap::Parser;
use inbox_triage::cli::{self, Cli, Commands, LogFormat, ProgressReporter, Runtime, SettingsUpdate};
use inbox_triage::config::Config;
use inbox_triage::error::TriageError;
use inbox_triage::store::Database;
use indicatif::MultiProgress;
use std::io::Write;
use std::process;
use std::sync::Arc;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// A writer that prints through MultiProgress to avoid progress bar conflicts
#[derive(Clone)]
struct MultiProgressWriter {
    multi: Arc<MultiProgress>,
    buffer: Arc<std::sync::Mutex<Vec<u8>>>,
}

impl MultiProgressWriter {
    fn new(multi: Arc<MultiProgress>) -> Self {
        Self {
            multi,
            buffer: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }
}

impl Write for MultiProgressWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut buffer = self.buffer.lock().unwrap_or_else(|p| p.into_inner());
        buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut buffer = self.buffer.lock().unwrap_or_else(|p| p.into_inner());
        if !buffer.is_empty() {
            let msg = String::from_utf8_lossy(&buffer);
            let msg = msg.trim_end_matches('\n');
            if !msg.is_empty() {
                let _ = self.multi.println(msg);
            }
            buffer.clear();
        }
        Ok(())
    }
}

impl Drop for MultiProgressWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

#[derive(Clone)]
struct MultiProgressMakeWriter {
    multi: Arc<MultiProgress>,
}

impl<'a> MakeWriter<'a> for MultiProgressMakeWriter {
    type Writer = MultiProgressWriter;

    fn make_writer(&'a self) -> Self::Writer {
        MultiProgressWriter::new(Arc::clone(&self.multi))
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        display_error(&e);
        process::exit(1);
    }
}

fn init_tracing(cli: &Cli, multi: &Arc<MultiProgress>) {
    let default = if cli.verbose {
        "inbox_triage=debug,info"
    } else {
        "inbox_triage=info,warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let make_writer = MultiProgressMakeWriter {
        multi: Arc::clone(multi),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    match cli.log_format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn load_config(cli: &Cli) -> Result<Config> {
    let config = if cli.config.exists() {
        Config::load(&cli.config).await?
    } else {
        tracing::warn!("No config at {:?}; using defaults", cli.config);
        Config::default()
    };
    Ok(config)
}

async fn open_database(config: &Config) -> Result<Database> {
    if let Some(parent) = config.storage.database_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(Database::open(&config.storage.database_path).await?)
}

async fn run() -> Result<()> {
    // Several dependencies pull in rustls; pick one crypto provider up front
    #[cfg(not(windows))]
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    #[cfg(windows)]
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    let cli = Cli::parse();
    let multi = Arc::new(MultiProgress::new());
    init_tracing(&cli, &multi);
    let reporter = ProgressReporter::with_multi_progress((*multi).clone());

    match &cli.command {
        Commands::InitConfig { output, force } => {
            cli::init_config(output, *force).await?;
        }

        Commands::Auth { id, force } => {
            let config = load_config(&cli).await?;
            cli::authorize(&config, id.clone(), *force).await?;
        }

        Commands::Mailboxes => {
            let config = load_config(&cli).await?;
            cli::list_mailboxes(&open_database(&config).await?).await?;
        }

        Commands::Activate { mailbox } => {
            let config = load_config(&cli).await?;
            cli::set_active(&open_database(&config).await?, mailbox, true).await?;
        }

        Commands::Deactivate { mailbox } => {
            let config = load_config(&cli).await?;
            cli::set_active(&open_database(&config).await?, mailbox, false).await?;
        }

        Commands::Pause { mailbox } => {
            let config = load_config(&cli).await?;
            cli::set_paused(&open_database(&config).await?, mailbox.as_deref(), true).await?;
        }

        Commands::Resume { mailbox } => {
            let config = load_config(&cli).await?;
            cli::set_paused(&open_database(&config).await?, mailbox.as_deref(), false).await?;
        }

        Commands::Settings {
            mailbox,
            action_mode,
            auto_label,
            trash_threshold,
            archive_threshold,
            review_threshold,
            backlog_age_days,
            backlog_batch_size,
        } => {
            let config = load_config(&cli).await?;
            let db = open_database(&config).await?;
            let update = SettingsUpdate {
                action_mode: *action_mode,
                auto_label: *auto_label,
                trash_threshold: *trash_threshold,
                archive_threshold: *archive_threshold,
                review_threshold: *review_threshold,
                backlog_age_days: *backlog_age_days,
                backlog_batch_size: *backlog_batch_size,
            };
            cli::update_settings(&config, &db, mailbox, update).await?;
        }

        Commands::Sync { mailbox } => {
            let runtime = Runtime::build(load_config(&cli).await?).await?;
            cli::sync_once(&runtime, mailbox.as_deref(), &reporter).await?;
        }

        Commands::Watch => {
            let runtime = Runtime::build(load_config(&cli).await?).await?;
            cli::run_watch(&runtime).await?;
        }

        Commands::Backlog {
            mailbox,
            queue_only,
        } => {
            let runtime = Runtime::build(load_config(&cli).await?).await?;
            cli::start_backlog(&runtime, mailbox, *queue_only, &reporter).await?;
        }

        Commands::Push { file } => {
            let config = load_config(&cli).await?;
            cli::push(&open_database(&config).await?, file.as_deref()).await?;
        }

        Commands::Undo { record_id } => {
            let runtime = Runtime::build(load_config(&cli).await?).await?;
            cli::undo(&runtime, record_id).await?;
        }

        Commands::History { mailbox, limit } => {
            let config = load_config(&cli).await?;
            cli::history(&open_database(&config).await?, mailbox, *limit).await?;
        }

        Commands::Status { mailbox } => {
            let config = load_config(&cli).await?;
            cli::status(&open_database(&config).await?, mailbox.as_deref()).await?;
        }
    }

    Ok(())
}

/// Display error with context
fn display_error(error: &anyhow::Error) {
    eprintln!("Error: {}", error);

    let mut cause = error.source();
    while let Some(e) = cause {
        eprintln!("  Caused by: {}", e);
        cause = e.source();
    }

    if let Some(triage_err) = error.downcast_ref::<TriageError>() {
        match triage_err {
            TriageError::AuthError(_) | TriageError::CredentialExpired(_) => {
                eprintln!("\nHint: Re-authorize the account.");
                eprintln!("      Try running: inbox-triage auth --force");
            }
            TriageError::ConfigError(_) => {
                eprintln!("\nHint: Check your configuration file for errors.");
                eprintln!("      Run: inbox-triage init-config --force");
            }
            TriageError::UndoExpired { .. } => {
                eprintln!("\nHint: Actions can only be undone inside the undo window.");
                eprintln!("      The message is still in Trash or All Mail in Gmail.");
            }
            TriageError::MailboxNotFound(_) => {
                eprintln!("\nHint: List registered mailboxes with: inbox-triage mailboxes");
            }
            _ => {}
        }
    }
}
