//! Common test utilities and fixtures
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration, Utc};
use inbox_triage::classifier::Classifier;
use inbox_triage::client::{ChangeBatch, ClientFactory, LabelInfo, MailboxClient, MessagePage};
use inbox_triage::collaborators::{NotificationDispatcher, NotificationKind, StoredSettings};
use inbox_triage::config::Config;
use inbox_triage::contacts::ContactsProvider;
use inbox_triage::error::{Result, TriageError};
use inbox_triage::models::{ListHeaders, Mailbox, MailboxSettings, MessageCategory, MessageMetadata};
use inbox_triage::pipeline::Pipeline;
use inbox_triage::queue::WorkQueue;
use inbox_triage::store::{self, Database};
use mockall::mock;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

pub const MAILBOX_ID: &str = "mb-test";

/// Create a test message with default values
pub fn create_test_message(id: &str, sender: &str, subject: &str) -> MessageMetadata {
    let domain = sender
        .split('@')
        .nth(1)
        .unwrap_or("example.com")
        .to_string();

    MessageMetadata {
        id: id.to_string(),
        thread_id: format!("thread_{}", id),
        sender_email: sender.to_string(),
        sender_domain: domain,
        sender_name: "Test Sender".to_string(),
        subject: subject.to_string(),
        snippet: "Hello there".to_string(),
        labels: vec!["INBOX".to_string(), "UNREAD".to_string()],
        category: MessageCategory::Primary,
        headers: ListHeaders::default(),
        date_received: Utc::now() - Duration::days(10),
    }
}

/// Promotions + unsubscribe from an unknown sender; scores 1.0
pub fn create_promo_message(id: &str) -> MessageMetadata {
    let mut message =
        create_test_message(id, "deals@shopmart-mail.com", "Big savings this weekend");
    message.category = MessageCategory::Promotions;
    message.labels.push("CATEGORY_PROMOTIONS".to_string());
    message.headers.has_unsubscribe = true;
    message
}

/// Updates + unsubscribe; scores 0.55, an archive
pub fn create_update_message(id: &str) -> MessageMetadata {
    let mut message = create_test_message(id, "team@productco.com", "What changed in the product");
    message.category = MessageCategory::Updates;
    message.labels.push("CATEGORY_UPDATES".to_string());
    message.headers.has_unsubscribe = true;
    message
}

/// An archive that the labeler files under Newsletters
pub fn create_newsletter_message(id: &str) -> MessageMetadata {
    let mut message = create_update_message(id);
    message.subject = "Weekly digest from the engineering blog".to_string();
    message.snippet = "Read more about our new build system".to_string();
    message
}

pub fn create_mailbox(action_mode: bool) -> Mailbox {
    Mailbox {
        id: MAILBOX_ID.to_string(),
        email: "owner@example.com".to_string(),
        credential_ref: "tokens/mb-test.json".to_string(),
        last_sync_token: None,
        active: true,
        settings: MailboxSettings {
            action_mode,
            ..Default::default()
        },
        created_at: Utc::now(),
    }
}

mock! {
    pub MailboxClient {}

    #[async_trait]
    impl MailboxClient for MailboxClient {
        async fn list_changes<'s, 'a>(&'s self, cursor: Option<&'a str>) -> Result<ChangeBatch>;
        async fn list_backlog_page<'s, 'q, 'a>(
            &'s self,
            query: &'q str,
            page_token: Option<&'a str>,
            page_size: u32,
        ) -> Result<MessagePage>;
        async fn get_metadata(&self, message_id: &str) -> Result<MessageMetadata>;
        async fn get_label_ids(&self, message_id: &str) -> Result<Vec<String>>;
        async fn archive(&self, message_id: &str) -> Result<()>;
        async fn unarchive(&self, message_id: &str) -> Result<()>;
        async fn trash(&self, message_id: &str) -> Result<()>;
        async fn untrash(&self, message_id: &str) -> Result<()>;
        async fn list_labels(&self) -> Result<Vec<LabelInfo>>;
        async fn create_label(&self, name: &str) -> Result<String>;
        async fn apply_label(&self, message_id: &str, label_id: &str) -> Result<()>;
        async fn modify_labels(
            &self,
            message_id: &str,
            add: &[String],
            remove: &[String],
        ) -> Result<()>;
    }
}

#[derive(Default)]
struct MailboxState {
    messages: BTreeMap<String, MessageMetadata>,
    /// (history id, message id), oldest first
    changes: Vec<(u64, String)>,
    history_id: u64,
    labels: Vec<LabelInfo>,
    calls: Vec<String>,
}

/// A mailbox held in memory, with Gmail's label semantics for the calls we use
#[derive(Default)]
pub struct InMemoryMailbox {
    state: Mutex<MailboxState>,
    /// (entered, release) for the next metadata fetch
    metadata_hold: Mutex<Option<(Arc<Notify>, Arc<Notify>)>>,
}

impl InMemoryMailbox {
    pub fn new() -> Self {
        let mailbox = Self::default();
        mailbox.state.lock().unwrap().history_id = 100;
        mailbox
    }

    /// Deliver a message; it shows up in the change feed
    pub fn deliver(&self, message: MessageMetadata) {
        let mut state = self.state.lock().unwrap();
        state.history_id += 1;
        let history_id = state.history_id;
        state.changes.push((history_id, message.id.clone()));
        state.messages.insert(message.id.clone(), message);
    }

    /// Park the next `get_metadata` call: `entered` fires once it is parked,
    /// and it continues after `release` is notified
    pub fn hold_next_metadata(&self) -> (Arc<Notify>, Arc<Notify>) {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        *self.metadata_hold.lock().unwrap() = Some((Arc::clone(&entered), Arc::clone(&release)));
        (entered, release)
    }

    pub fn labels_of(&self, message_id: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut labels = state
            .messages
            .get(message_id)
            .map(|m| m.labels.clone())
            .unwrap_or_default();
        labels.sort();
        labels
    }

    /// Remote calls of one kind, e.g. "trash"
    pub fn calls(&self, kind: &str) -> usize {
        let state = self.state.lock().unwrap();
        state
            .calls
            .iter()
            .filter(|c| c.split(':').next() == Some(kind))
            .count()
    }

    pub fn mutating_calls(&self) -> usize {
        ["archive", "trash", "unarchive", "untrash", "apply_label", "modify_labels"]
            .iter()
            .map(|kind| self.calls(kind))
            .sum()
    }

    pub fn label_names(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.labels.iter().map(|l| l.name.clone()).collect()
    }

    fn edit<F>(&self, call: &str, message_id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut Vec<String>),
    {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("{}:{}", call, message_id));
        let message = state
            .messages
            .get_mut(message_id)
            .ok_or_else(|| TriageError::MessageNotFound(message_id.to_string()))?;
        f(&mut message.labels);
        Ok(())
    }
}

fn add_label(labels: &mut Vec<String>, label: &str) {
    if !labels.iter().any(|l| l == label) {
        labels.push(label.to_string());
    }
}

fn remove_label(labels: &mut Vec<String>, label: &str) {
    labels.retain(|l| l != label);
}

#[async_trait]
impl MailboxClient for InMemoryMailbox {
    async fn list_changes<'s, 'a>(&'s self, cursor: Option<&'a str>) -> Result<ChangeBatch> {
        let state = self.state.lock().unwrap();
        let current = state.history_id.to_string();
        let Some(cursor) = cursor else {
            return Ok(ChangeBatch {
                cursor: current,
                message_ids: Vec::new(),
            });
        };

        let since: u64 = cursor
            .parse()
            .map_err(|_| TriageError::BadRequest(format!("bad cursor {}", cursor)))?;
        let mut seen = HashSet::new();
        let message_ids = state
            .changes
            .iter()
            .filter(|(id, _)| *id > since)
            .filter(|(_, message_id)| seen.insert(message_id.clone()))
            .map(|(_, message_id)| message_id.clone())
            .collect();
        Ok(ChangeBatch {
            cursor: current,
            message_ids,
        })
    }

    async fn list_backlog_page<'s, 'q, 'a>(
        &'s self,
        _query: &'q str,
        page_token: Option<&'a str>,
        page_size: u32,
    ) -> Result<MessagePage> {
        // The query is not evaluated and pages walk every delivered message, so
        // offsets stay valid while earlier pages are archived or trashed
        let state = self.state.lock().unwrap();
        let inbox: Vec<String> = state.messages.keys().cloned().collect();
        let offset: usize = page_token.and_then(|t| t.parse().ok()).unwrap_or(0);
        let end = (offset + page_size as usize).min(inbox.len());
        Ok(MessagePage {
            ids: inbox[offset.min(end)..end].to_vec(),
            next_page_token: (end < inbox.len()).then(|| end.to_string()),
            estimated_total: Some(inbox.len() as u64),
        })
    }

    async fn get_metadata(&self, message_id: &str) -> Result<MessageMetadata> {
        let hold = self.metadata_hold.lock().unwrap().take();
        if let Some((entered, release)) = hold {
            entered.notify_one();
            release.notified().await;
        }

        let state = self.state.lock().unwrap();
        state
            .messages
            .get(message_id)
            .cloned()
            .ok_or_else(|| TriageError::MessageNotFound(message_id.to_string()))
    }

    async fn get_label_ids(&self, message_id: &str) -> Result<Vec<String>> {
        self.get_metadata(message_id).await.map(|m| m.labels)
    }

    async fn archive(&self, message_id: &str) -> Result<()> {
        self.edit("archive", message_id, |labels| remove_label(labels, "INBOX"))
    }

    async fn unarchive(&self, message_id: &str) -> Result<()> {
        self.edit("unarchive", message_id, |labels| add_label(labels, "INBOX"))
    }

    async fn trash(&self, message_id: &str) -> Result<()> {
        self.edit("trash", message_id, |labels| {
            remove_label(labels, "INBOX");
            remove_label(labels, "UNREAD");
            add_label(labels, "TRASH");
        })
    }

    async fn untrash(&self, message_id: &str) -> Result<()> {
        self.edit("untrash", message_id, |labels| remove_label(labels, "TRASH"))
    }

    async fn list_labels(&self) -> Result<Vec<LabelInfo>> {
        Ok(self.state.lock().unwrap().labels.clone())
    }

    async fn create_label(&self, name: &str) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        if state.labels.iter().any(|l| l.name.eq_ignore_ascii_case(name)) {
            return Err(TriageError::LabelError(format!("{} already exists", name)));
        }
        let id = format!("Label_{}", state.labels.len() + 1);
        state.labels.push(LabelInfo {
            id: id.clone(),
            name: name.to_string(),
        });
        Ok(id)
    }

    async fn apply_label(&self, message_id: &str, label_id: &str) -> Result<()> {
        self.edit("apply_label", message_id, |labels| add_label(labels, label_id))
    }

    async fn modify_labels(
        &self,
        message_id: &str,
        add: &[String],
        remove: &[String],
    ) -> Result<()> {
        self.edit("modify_labels", message_id, |labels| {
            for label in add {
                add_label(labels, label);
            }
            for label in remove {
                remove_label(labels, label);
            }
        })
    }
}

/// Hands the same client to every mailbox
pub struct FixedFactory(pub Arc<dyn MailboxClient>);

#[async_trait]
impl ClientFactory for FixedFactory {
    async fn client_for(&self, _mailbox: &Mailbox) -> Result<Arc<dyn MailboxClient>> {
        Ok(Arc::clone(&self.0))
    }
}

#[derive(Default)]
pub struct StaticContacts {
    pub known: HashSet<String>,
}

#[async_trait]
impl ContactsProvider for StaticContacts {
    async fn is_known_contact(&self, address: &str) -> Result<bool> {
        Ok(self.known.contains(&address.to_lowercase()))
    }

    async fn sender_open_rate(&self, _address: &str) -> Result<Option<f64>> {
        Ok(None)
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<(String, NotificationKind)>>,
}

impl RecordingNotifier {
    pub fn kinds(&self) -> Vec<NotificationKind> {
        self.sent.lock().unwrap().iter().map(|(_, k)| *k).collect()
    }
}

#[async_trait]
impl NotificationDispatcher for RecordingNotifier {
    async fn send_notification(
        &self,
        user_id: &str,
        kind: NotificationKind,
        _data: serde_json::Value,
    ) -> Result<()> {
        self.sent.lock().unwrap().push((user_id.to_string(), kind));
        Ok(())
    }
}

/// A database, one registered mailbox and a pipeline wired to `client`
pub struct Harness {
    pub db: Database,
    pub config: Arc<Config>,
    pub mailbox: Mailbox,
    pub queue: WorkQueue,
    pub notifier: Arc<RecordingNotifier>,
    pub pipeline: Arc<Pipeline>,
}

pub async fn harness(client: Arc<dyn MailboxClient>, action_mode: bool) -> Harness {
    harness_with(client, action_mode, StaticContacts::default(), Config::default(), None).await
}

pub async fn harness_with(
    client: Arc<dyn MailboxClient>,
    action_mode: bool,
    contacts: StaticContacts,
    config: Config,
    assisted: Option<Arc<dyn Classifier>>,
) -> Harness {
    let db = Database::open_in_memory().await.unwrap();
    let mailbox = store::mailboxes::upsert(&db, &create_mailbox(action_mode))
        .await
        .unwrap();
    let config = Arc::new(config);
    let notifier = Arc::new(RecordingNotifier::default());

    let mut pipeline = Pipeline::new(
        db.clone(),
        &config,
        Arc::new(FixedFactory(client)),
        Arc::new(StoredSettings::new(db.clone(), Arc::clone(&config))),
        Arc::new(contacts),
        notifier.clone(),
    );
    if let Some(assisted) = assisted {
        pipeline = pipeline.with_assisted(assisted);
    }

    Harness {
        queue: WorkQueue::new(db.clone(), chrono::Duration::minutes(10)),
        db,
        config,
        mailbox,
        notifier,
        pipeline: Arc::new(pipeline),
    }
}
