//! Gmail inbox triage
//!
//! Watches a mailbox's change feed, classifies each new message as keep,
//! archive, trash or review, and applies the decision when the mailbox is in
//! action mode. Every decision lands on an append-only ledger, and every
//! applied action can be undone inside the undo window.
//!
//! # Overview
//!
//! - **Ingestion**: push notifications and polling feed a per-mailbox change cursor
//! - **Classification**: weighted rules first, an optional language model for
//!   uncertain calls, and safety rails that neither tier can outvote
//! - **Execution**: archive and trash only (nothing is ever permanently deleted),
//!   with pre-action labels captured for undo
//! - **Labeling**: archived receipts, invoices, bookings and similar get a label
//! - **Backlog**: paged, throttled reprocessing of old inbox messages
//!
//! # Example Usage
//!
//! ```no_run
//! use inbox_triage::{cli::Runtime, config::Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml".as_ref()).await?;
//!     let runtime = Runtime::build(config).await?;
//!
//!     // Queue a reconcile for every active mailbox and work the queue dry
//!     runtime.reconciler.schedule_all().await?;
//!     runtime.workers.drain().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Module Organization
//!
//! - [`rate_limiter`] / [`pause`] - per-mailbox quota window and emergency stop
//! - [`client`] - gated Gmail client with retry and backoff
//! - [`reconciler`] - change cursor to queued jobs
//! - [`extractor`] - metadata-only message parsing
//! - [`safety`], [`classifier`], [`assisted`] - the decision
//! - [`executor`], [`labeler`] - applying it, and undo
//! - [`pipeline`] - one message end to end
//! - [`backlog`] - historical reprocessing
//! - [`store`], [`queue`] - SQLite ledger, cursors and durable jobs
//! - [`worker`], [`webhook`], [`cli`] - running it

pub mod assisted;
pub mod auth;
pub mod backlog;
pub mod classifier;
pub mod cli;
pub mod client;
pub mod collaborators;
pub mod config;
pub mod contacts;
pub mod error;
pub mod executor;
pub mod extractor;
pub mod labeler;
pub mod models;
pub mod pause;
pub mod pipeline;
pub mod queue;
pub mod rate_limiter;
pub mod reconciler;
pub mod safety;
pub mod store;
pub mod webhook;
pub mod worker;

pub use error::{Result, TriageError};

pub use models::{
    ActionRecord, ClassificationResult, ClassificationSignal, Disposition, Mailbox,
    MessageMetadata,
};

pub use classifier::{Classifier, RuleClassifier, TieredClassifier};
pub use client::{ClientFactory, MailboxClient};
pub use config::Config;
pub use pipeline::{Pipeline, ProcessOutcome};
pub use queue::{Job, WorkQueue};
pub use rate_limiter::{RateLimiter, Reservation};
