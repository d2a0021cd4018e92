//! Push notification intake
//!
//! A push only says "something changed". It never carries message ids, so the
//! handler queues a Reconcile for the mailbox and the change feed does the rest.

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine as _;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::models::Mailbox;
use crate::queue::{Job, WorkQueue};
use crate::store::{self, Database};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushAck {
    Enqueued { mailbox_id: String },
    Ignored { reason: String },
}

/// Pub/Sub push envelope
#[derive(Debug, Deserialize)]
struct Envelope {
    message: EnvelopeMessage,
}

#[derive(Debug, Deserialize)]
struct EnvelopeMessage {
    data: String,
}

/// Decoded Gmail watch payload
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailNotification {
    email_address: String,
    #[serde(default)]
    history_id: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DirectNotification {
    mailbox_identifier: String,
    #[serde(default)]
    change_cursor: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Payload {
    PubSub(Envelope),
    Direct(DirectNotification),
}

fn decode_data(data: &str) -> Option<Vec<u8>> {
    STANDARD
        .decode(data.trim())
        .or_else(|_| URL_SAFE.decode(data.trim()))
        .ok()
}

/// Mailbox identifier named by a push body, if it is readable
fn identify(body: &[u8]) -> std::result::Result<String, String> {
    let payload: Payload =
        serde_json::from_slice(body).map_err(|e| format!("unreadable push body: {}", e))?;

    match payload {
        Payload::Direct(direct) => {
            debug!(cursor = ?direct.change_cursor, "Direct push");
            Ok(direct.mailbox_identifier)
        }
        Payload::PubSub(envelope) => {
            let data = decode_data(&envelope.message.data)
                .ok_or_else(|| "push data is not base64".to_string())?;
            let notification: GmailNotification = serde_json::from_slice(&data)
                .map_err(|e| format!("unreadable push data: {}", e))?;
            debug!(history_id = ?notification.history_id, "Pub/Sub push");
            Ok(notification.email_address)
        }
    }
}

#[derive(Debug, Clone)]
pub struct PushHandler {
    db: Database,
    queue: WorkQueue,
}

impl PushHandler {
    pub fn new(db: Database, queue: WorkQueue) -> Self {
        Self { db, queue }
    }

    async fn resolve(&self, identifier: &str) -> Result<Option<Mailbox>> {
        if let Some(mailbox) = store::mailboxes::get(&self.db, identifier).await? {
            return Ok(Some(mailbox));
        }
        store::mailboxes::get_by_email(&self.db, identifier).await
    }

    /// Acknowledge a push; only storage failures are errors
    pub async fn handle(&self, body: &[u8]) -> Result<PushAck> {
        let identifier = match identify(body) {
            Ok(identifier) => identifier,
            Err(reason) => {
                warn!("Ignoring push: {}", reason);
                return Ok(PushAck::Ignored { reason });
            }
        };

        let Some(mailbox) = self.resolve(&identifier).await? else {
            warn!(identifier = %identifier, "Ignoring push for unknown mailbox");
            return Ok(PushAck::Ignored {
                reason: format!("unknown mailbox {}", identifier),
            });
        };
        if !mailbox.active {
            debug!(mailbox_id = %mailbox.id, "Ignoring push for inactive mailbox");
            return Ok(PushAck::Ignored {
                reason: format!("mailbox {} is inactive", mailbox.id),
            });
        }

        let fresh = self
            .queue
            .enqueue(Job::Reconcile {
                mailbox_id: mailbox.id.clone(),
            })
            .await?;
        info!(mailbox_id = %mailbox.id, coalesced = !fresh, "Push accepted");

        Ok(PushAck::Enqueued {
            mailbox_id: mailbox.id,
        })
    }
}
