//! Interfaces to services outside the pipeline, with simple default implementations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::models::{Mailbox, MailboxSettings};
use crate::store::{self, Database};

/// Supplies a currently valid access token for a mailbox
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Returns `CredentialExpired` when the mailbox must be re-authorized
    async fn get_valid_credential(&self, mailbox_id: &str) -> Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    CredentialExpired,
    BacklogComplete,
    ActionFailed,
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NotificationKind::CredentialExpired => "credential_expired",
            NotificationKind::BacklogComplete => "backlog_complete",
            NotificationKind::ActionFailed => "action_failed",
        };
        f.write_str(name)
    }
}

/// User-facing notifications
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn send_notification(
        &self,
        user_id: &str,
        kind: NotificationKind,
        data: serde_json::Value,
    ) -> Result<()>;
}

/// Fire-and-forget delivery; failures are logged and dropped
pub fn notify_detached(
    dispatcher: &Arc<dyn NotificationDispatcher>,
    user_id: &str,
    kind: NotificationKind,
    data: serde_json::Value,
) {
    let dispatcher = Arc::clone(dispatcher);
    let user_id = user_id.to_string();
    tokio::spawn(async move {
        if let Err(e) = dispatcher.send_notification(&user_id, kind, data).await {
            warn!(user_id = %user_id, %kind, "Notification failed: {}", e);
        }
    });
}

/// Writes notifications to the log
#[derive(Debug, Default, Clone)]
pub struct TracingNotifier;

#[async_trait]
impl NotificationDispatcher for TracingNotifier {
    async fn send_notification(
        &self,
        user_id: &str,
        kind: NotificationKind,
        data: serde_json::Value,
    ) -> Result<()> {
        info!(user_id, %kind, data = %data, "Notification");
        Ok(())
    }
}

/// Per-mailbox settings, read fresh every cycle
#[async_trait]
pub trait SettingsProvider: Send + Sync {
    async fn settings_for(&self, mailbox: &Mailbox) -> Result<MailboxSettings>;
}

/// Settings stored on the mailbox row, merged over the config file
///
/// Action mode is on when either the mailbox or the config enables it. Auto-label
/// needs both. Missing thresholds fall back to the configured ones.
#[derive(Debug, Clone)]
pub struct StoredSettings {
    db: Database,
    config: Arc<Config>,
}

impl StoredSettings {
    pub fn new(db: Database, config: Arc<Config>) -> Self {
        Self { db, config }
    }

    pub fn merge(&self, stored: MailboxSettings) -> MailboxSettings {
        MailboxSettings {
            action_mode: stored.action_mode || self.config.execution.action_mode,
            auto_label: stored.auto_label && self.config.execution.auto_label,
            thresholds: Some(
                stored
                    .thresholds
                    .unwrap_or(self.config.classification.thresholds),
            ),
            backlog: stored.backlog,
        }
    }
}

#[async_trait]
impl SettingsProvider for StoredSettings {
    async fn settings_for(&self, mailbox: &Mailbox) -> Result<MailboxSettings> {
        let fresh = store::mailboxes::require(&self.db, &mailbox.id).await?;
        Ok(self.merge(fresh.settings))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Operator alerts
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn raise_alert(&self, title: &str, message: &str, severity: Severity) -> Result<()>;
}

#[derive(Debug, Default, Clone)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn raise_alert(&self, title: &str, message: &str, severity: Severity) -> Result<()> {
        match severity {
            Severity::Info => info!(alert = title, "{}", message),
            Severity::Warning => warn!(alert = title, "{}", message),
            Severity::Critical => error!(alert = title, "{}", message),
        }
        Ok(())
    }
}
