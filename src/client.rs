//! Gmail API client with quota gating and retry logic

use async_trait::async_trait;
use google_gmail1::api::{Label, ModifyMessageRequest};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::auth::{self, GmailHub};
use crate::collaborators::CredentialProvider;
use crate::config::SyncConfig;
use crate::error::{Result, TriageError};
use crate::extractor;
use crate::models::{Mailbox, MessageMetadata, INBOX_LABEL};
use crate::pause::PauseRegistry;
use crate::rate_limiter::{QuotaCost, RateLimiter};

const MODIFY_SCOPE: &str = "https://www.googleapis.com/auth/gmail.modify";
const LABELS_SCOPE: &str = "https://www.googleapis.com/auth/gmail.labels";

/// Headers requested with the metadata format. Nothing else is ever fetched.
pub const METADATA_HEADERS: &[&str] = &[
    "From",
    "Subject",
    "Date",
    "List-Unsubscribe",
    "List-Id",
    "Precedence",
    "Auto-Submitted",
];

/// Message formats this client may request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchFormat {
    /// Id, thread and label ids only
    Minimal,
    /// Allow-listed headers, labels and snippet
    Metadata,
}

impl FetchFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchFormat::Minimal => "minimal",
            FetchFormat::Metadata => "metadata",
        }
    }
}

/// Label info returned from Gmail API
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelInfo {
    pub id: String,
    pub name: String,
}

/// New message ids since a cursor, and the cursor to store afterwards
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeBatch {
    pub cursor: String,
    pub message_ids: Vec<String>,
}

/// One page of a message search
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessagePage {
    pub ids: Vec<String>,
    pub next_page_token: Option<String>,
    pub estimated_total: Option<u64>,
}

/// Mailbox operations the pipeline needs
///
/// There is intentionally no permanent delete. Trash is the strongest
/// transition and it is reversible.
#[async_trait]
pub trait MailboxClient: Send + Sync {
    /// Message ids added to the inbox since `cursor`
    ///
    /// Without a cursor, returns the current profile position and no ids.
    async fn list_changes(&self, cursor: Option<&str>) -> Result<ChangeBatch>;

    /// One page of a search query
    async fn list_backlog_page(
        &self,
        query: &str,
        page_token: Option<&str>,
        page_size: u32,
    ) -> Result<MessagePage>;

    async fn get_metadata(&self, message_id: &str) -> Result<MessageMetadata>;

    /// Current label ids of a message
    async fn get_label_ids(&self, message_id: &str) -> Result<Vec<String>>;

    /// Remove INBOX
    async fn archive(&self, message_id: &str) -> Result<()>;

    /// Add INBOX back
    async fn unarchive(&self, message_id: &str) -> Result<()>;

    async fn trash(&self, message_id: &str) -> Result<()>;

    async fn untrash(&self, message_id: &str) -> Result<()>;

    async fn list_labels(&self) -> Result<Vec<LabelInfo>>;

    /// Create a label, returning its id
    async fn create_label(&self, name: &str) -> Result<String>;

    async fn apply_label(&self, message_id: &str, label_id: &str) -> Result<()>;

    async fn modify_labels(&self, message_id: &str, add: &[String], remove: &[String])
        -> Result<()>;

    /// Id of the label named `name` (case-insensitive), creating it when missing
    async fn ensure_label(&self, name: &str) -> Result<String> {
        let labels = self.list_labels().await?;
        if let Some(found) = labels.iter().find(|l| l.name.eq_ignore_ascii_case(name)) {
            return Ok(found.id.clone());
        }

        match self.create_label(name).await {
            Ok(id) => Ok(id),
            Err(e) if e.must_propagate() || e.is_transient() => Err(e),
            Err(e) => {
                // Another worker may have created it in between
                let labels = self.list_labels().await?;
                labels
                    .into_iter()
                    .find(|l| l.name.eq_ignore_ascii_case(name))
                    .map(|l| l.id)
                    .ok_or(e)
            }
        }
    }
}

/// Builds clients per mailbox
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn client_for(&self, mailbox: &Mailbox) -> Result<Arc<dyn MailboxClient>>;
}

/// Retry schedule for remote calls
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound for a single call
    pub call_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_secs(config.max_delay_secs),
            call_timeout: Duration::from_secs(30),
        }
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        std::cmp::min(self.base_delay.saturating_mul(factor), self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

/// Check if an error is worth another attempt inside the client
///
/// `QuotaWait` is transient too but belongs to the worker, which requeues.
fn should_retry(error: &TriageError) -> bool {
    matches!(
        error,
        TriageError::ServerError { .. }
            | TriageError::RateLimitExceeded { .. }
            | TriageError::NetworkError(_)
    )
}

/// Execute an async operation with exponential backoff retry
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempts = 0;

    loop {
        attempts += 1;
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if should_retry(&e) && attempts < policy.max_attempts => {
                let delay = match e.retry_delay() {
                    // A server hint longer than our cap goes back to the worker
                    Some(hint) if hint > policy.max_delay => return Err(e),
                    Some(hint) => hint,
                    None => policy.backoff(attempts),
                };
                warn!(
                    "{} failed (attempt {}/{}): {}. Retrying in {:?}...",
                    operation_name, attempts, policy.max_attempts, e, delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// The only path to the Gmail hub
///
/// Every attempt checks the pause flag and reserves quota before the call is made.
struct Gate<H = GmailHub> {
    hub: Arc<H>,
    mailbox_id: String,
    limiter: RateLimiter,
    pauses: PauseRegistry,
    policy: RetryPolicy,
}

impl<H> Gate<H> {
    async fn run<T, F, Fut>(&self, operation: &str, cost: QuotaCost, mut call: F) -> Result<T>
    where
        F: FnMut(Arc<H>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        with_retry(&self.policy, operation, || {
            let request = call(Arc::clone(&self.hub));
            async move {
                self.pauses.ensure_running(&self.mailbox_id).await?;
                self.limiter.acquire(&self.mailbox_id, cost).await?;
                match tokio::time::timeout(self.policy.call_timeout, request).await {
                    Ok(result) => result,
                    Err(_) => Err(TriageError::NetworkError(format!(
                        "{} timed out after {:?}",
                        operation, self.policy.call_timeout
                    ))),
                }
            }
        })
        .await
    }
}

/// Production client for one mailbox
pub struct GmailMailboxClient {
    gate: Gate,
}

impl GmailMailboxClient {
    pub fn new(
        hub: GmailHub,
        mailbox_id: &str,
        limiter: RateLimiter,
        pauses: PauseRegistry,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            gate: Gate {
                hub: Arc::new(hub),
                mailbox_id: mailbox_id.to_string(),
                limiter,
                pauses,
                policy,
            },
        }
    }

    async fn current_history_id(&self) -> Result<String> {
        let profile = self
            .gate
            .run("get_profile", QuotaCost::Custom(1), |hub| async move {
                let (_, profile) = hub
                    .users()
                    .get_profile("me")
                    .add_scope(MODIFY_SCOPE)
                    .doit()
                    .await?;
                Ok(profile)
            })
            .await?;

        profile
            .history_id
            .map(|id| id.to_string())
            .ok_or_else(|| TriageError::ApiError("Profile has no history id".to_string()))
    }

    async fn modify(
        &self,
        operation: &str,
        message_id: &str,
        add: &[String],
        remove: &[String],
    ) -> Result<()> {
        let request = ModifyMessageRequest {
            add_label_ids: (!add.is_empty()).then(|| add.to_vec()),
            remove_label_ids: (!remove.is_empty()).then(|| remove.to_vec()),
        };

        self.gate
            .run(operation, QuotaCost::Write, |hub| {
                let request = request.clone();
                async move {
                    hub.users()
                        .messages_modify(request, "me", message_id)
                        .add_scope(MODIFY_SCOPE)
                        .doit()
                        .await?;
                    Ok(())
                }
            })
            .await
    }
}

#[async_trait]
impl MailboxClient for GmailMailboxClient {
    async fn list_changes(&self, cursor: Option<&str>) -> Result<ChangeBatch> {
        let Some(cursor) = cursor else {
            return Ok(ChangeBatch {
                cursor: self.current_history_id().await?,
                message_ids: Vec::new(),
            });
        };

        let start: u64 = cursor
            .parse()
            .map_err(|_| TriageError::CursorExpired(format!("unreadable cursor '{}'", cursor)))?;

        let mut message_ids = Vec::new();
        let mut latest = cursor.to_string();
        let mut page_token: Option<String> = None;

        loop {
            let token = page_token.clone();
            let response = self
                .gate
                .run("history_list", QuotaCost::Read, |hub| {
                    let token = token.clone();
                    async move {
                        let mut call = hub
                            .users()
                            .history_list("me")
                            .start_history_id(start)
                            .label_id(INBOX_LABEL)
                            .add_history_types("messageAdded");
                        if let Some(token) = token.as_deref() {
                            call = call.page_token(token);
                        }
                        match call.add_scope(MODIFY_SCOPE).doit().await {
                            Ok((_, response)) => Ok(response),
                            Err(e) => match TriageError::from(e) {
                                TriageError::MessageNotFound(_) => {
                                    Err(TriageError::CursorExpired(start.to_string()))
                                }
                                other => Err(other),
                            },
                        }
                    }
                })
                .await?;

            for history in response.history.unwrap_or_default() {
                for added in history.messages_added.unwrap_or_default() {
                    if let Some(id) = added.message.and_then(|m| m.id) {
                        if !message_ids.contains(&id) {
                            message_ids.push(id);
                        }
                    }
                }
            }

            if let Some(history_id) = response.history_id {
                latest = history_id.to_string();
            }

            page_token = response.next_page_token;
            if page_token.is_none() {
                break;
            }
        }

        debug!(count = message_ids.len(), cursor = %latest, "Fetched change feed");
        Ok(ChangeBatch {
            cursor: latest,
            message_ids,
        })
    }

    async fn list_backlog_page(
        &self,
        query: &str,
        page_token: Option<&str>,
        page_size: u32,
    ) -> Result<MessagePage> {
        let response = self
            .gate
            .run("messages_list", QuotaCost::Read, |hub| async move {
                let mut call = hub
                    .users()
                    .messages_list("me")
                    .q(query)
                    .max_results(page_size);
                if let Some(token) = page_token {
                    call = call.page_token(token);
                }
                let (_, response) = call.add_scope(MODIFY_SCOPE).doit().await?;
                Ok(response)
            })
            .await?;

        Ok(MessagePage {
            ids: response
                .messages
                .unwrap_or_default()
                .into_iter()
                .filter_map(|m| m.id)
                .collect(),
            next_page_token: response.next_page_token,
            estimated_total: response.result_size_estimate.map(u64::from),
        })
    }

    async fn get_metadata(&self, message_id: &str) -> Result<MessageMetadata> {
        let message = self
            .gate
            .run("messages_get", QuotaCost::Read, |hub| async move {
                let mut call = hub
                    .users()
                    .messages_get("me", message_id)
                    .format(FetchFormat::Metadata.as_str());
                for header in METADATA_HEADERS {
                    call = call.add_metadata_headers(header);
                }
                let (_, message) = call.add_scope(MODIFY_SCOPE).doit().await?;
                Ok(message)
            })
            .await?;

        extractor::extract(message)
    }

    async fn get_label_ids(&self, message_id: &str) -> Result<Vec<String>> {
        let message = self
            .gate
            .run("messages_get", QuotaCost::Read, |hub| async move {
                let (_, message) = hub
                    .users()
                    .messages_get("me", message_id)
                    .format(FetchFormat::Minimal.as_str())
                    .add_scope(MODIFY_SCOPE)
                    .doit()
                    .await?;
                Ok(message)
            })
            .await?;

        Ok(message.label_ids.unwrap_or_default())
    }

    async fn archive(&self, message_id: &str) -> Result<()> {
        self.modify("archive", message_id, &[], &[INBOX_LABEL.to_string()])
            .await
    }

    async fn unarchive(&self, message_id: &str) -> Result<()> {
        self.modify("unarchive", message_id, &[INBOX_LABEL.to_string()], &[])
            .await
    }

    async fn trash(&self, message_id: &str) -> Result<()> {
        self.gate
            .run("messages_trash", QuotaCost::Write, |hub| async move {
                hub.users()
                    .messages_trash("me", message_id)
                    .add_scope(MODIFY_SCOPE)
                    .doit()
                    .await?;
                Ok(())
            })
            .await
    }

    async fn untrash(&self, message_id: &str) -> Result<()> {
        self.gate
            .run("messages_untrash", QuotaCost::Write, |hub| async move {
                hub.users()
                    .messages_untrash("me", message_id)
                    .add_scope(MODIFY_SCOPE)
                    .doit()
                    .await?;
                Ok(())
            })
            .await
    }

    async fn list_labels(&self) -> Result<Vec<LabelInfo>> {
        let response = self
            .gate
            .run("labels_list", QuotaCost::Custom(1), |hub| async move {
                let (_, response) = hub
                    .users()
                    .labels_list("me")
                    .add_scope(LABELS_SCOPE)
                    .doit()
                    .await?;
                Ok(response)
            })
            .await?;

        Ok(response
            .labels
            .unwrap_or_default()
            .into_iter()
            .filter_map(|label| match (label.id, label.name) {
                (Some(id), Some(name)) => Some(LabelInfo { id, name }),
                _ => None,
            })
            .collect())
    }

    async fn create_label(&self, name: &str) -> Result<String> {
        let created = self
            .gate
            .run("labels_create", QuotaCost::Write, |hub| async move {
                let label = Label {
                    name: Some(name.to_string()),
                    message_list_visibility: Some("show".to_string()),
                    label_list_visibility: Some("labelShow".to_string()),
                    ..Default::default()
                };
                let (_, created) = hub
                    .users()
                    .labels_create(label, "me")
                    .add_scope(LABELS_SCOPE)
                    .doit()
                    .await?;
                Ok(created)
            })
            .await?;

        info!(label = name, "Created label");
        created
            .id
            .ok_or_else(|| TriageError::LabelError("Created label has no ID".to_string()))
    }

    async fn apply_label(&self, message_id: &str, label_id: &str) -> Result<()> {
        self.modify("apply_label", message_id, &[label_id.to_string()], &[])
            .await
    }

    async fn modify_labels(
        &self,
        message_id: &str,
        add: &[String],
        remove: &[String],
    ) -> Result<()> {
        if add.is_empty() && remove.is_empty() {
            return Ok(());
        }
        self.modify("modify_labels", message_id, add, remove).await
    }
}

/// Hands out one gated Gmail client per mailbox, sharing limiter and pause flags
pub struct GmailClientFactory {
    credentials: Arc<dyn CredentialProvider>,
    limiter: RateLimiter,
    pauses: PauseRegistry,
    policy: RetryPolicy,
    clients: Mutex<HashMap<String, Arc<dyn MailboxClient>>>,
}

impl GmailClientFactory {
    pub fn new(
        credentials: Arc<dyn CredentialProvider>,
        limiter: RateLimiter,
        pauses: PauseRegistry,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            credentials,
            limiter,
            pauses,
            policy,
            clients: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ClientFactory for GmailClientFactory {
    async fn client_for(&self, mailbox: &Mailbox) -> Result<Arc<dyn MailboxClient>> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&mailbox.id) {
            return Ok(Arc::clone(client));
        }

        let token_source =
            auth::MailboxTokenSource::new(Arc::clone(&self.credentials), &mailbox.id);
        let hub = auth::build_hub(token_source)?;
        let client: Arc<dyn MailboxClient> = Arc::new(GmailMailboxClient::new(
            hub,
            &mailbox.id,
            self.limiter.clone(),
            self.pauses.clone(),
            self.policy.clone(),
        ));
        clients.insert(mailbox.id.clone(), Arc::clone(&client));
        Ok(client)
    }
}
