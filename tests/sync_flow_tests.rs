//! Push, reconcile, queue and workers wired together over one mailbox

mod common;

use common::*;
use inbox_triage::backlog::BacklogProcessor;
use inbox_triage::collaborators::{NotificationKind, StoredSettings, TracingAlertSink};
use inbox_triage::models::{BacklogSettings, MailboxSettings};
use inbox_triage::pause::PauseRegistry;
use inbox_triage::reconciler::Reconciler;
use inbox_triage::store;
use inbox_triage::webhook::{PushAck, PushHandler};
use inbox_triage::worker::WorkerPool;
use inbox_triage::Job;
use std::sync::Arc;

struct Flow {
    h: Harness,
    pauses: PauseRegistry,
    reconciler: Reconciler,
    backlog: Arc<BacklogProcessor>,
    workers: WorkerPool,
}

fn flow(h: Harness) -> Flow {
    let pauses = PauseRegistry::new(h.db.clone());
    let settings = Arc::new(StoredSettings::new(h.db.clone(), Arc::clone(&h.config)));
    let reconciler = Reconciler::new(h.db.clone(), h.queue.clone());
    let backlog = Arc::new(BacklogProcessor::new(
        h.db.clone(),
        h.queue.clone(),
        Arc::clone(&h.pipeline),
        settings,
        pauses.clone(),
        h.notifier.clone(),
    ));
    let workers = WorkerPool::new(
        &h.config,
        h.db.clone(),
        h.queue.clone(),
        Arc::clone(&h.pipeline),
        reconciler.clone(),
        Arc::clone(&backlog),
        pauses.clone(),
        h.notifier.clone(),
        Arc::new(TracingAlertSink),
    );
    Flow {
        h,
        pauses,
        reconciler,
        backlog,
        workers,
    }
}

#[tokio::test]
async fn test_new_mail_flows_from_change_feed_to_ledger() {
    let mailbox = Arc::new(InMemoryMailbox::new());
    let f = flow(harness(mailbox.clone(), true).await);

    // First pass only records the cursor
    assert_eq!(f.reconciler.schedule_all().await.unwrap(), 1);
    assert_eq!(f.workers.drain().await.unwrap(), 1);
    let cursor = store::mailboxes::require(&f.h.db, MAILBOX_ID)
        .await
        .unwrap()
        .last_sync_token;
    assert!(cursor.is_some());

    mailbox.deliver(create_promo_message("m1"));
    mailbox.deliver(create_update_message("m2"));

    f.reconciler.schedule_all().await.unwrap();
    // One reconcile plus one job per new message
    assert_eq!(f.workers.drain().await.unwrap(), 3);

    assert!(mailbox.labels_of("m1").contains(&"TRASH".to_string()));
    assert!(!mailbox.labels_of("m2").contains(&"INBOX".to_string()));
    assert_eq!(
        store::ledger::recent(&f.h.db, MAILBOX_ID, 10).await.unwrap().len(),
        2
    );
    assert_eq!(f.h.queue.pending_count(None).await.unwrap(), 0);

    let advanced = store::mailboxes::require(&f.h.db, MAILBOX_ID)
        .await
        .unwrap()
        .last_sync_token;
    assert_ne!(advanced, cursor);
}

#[tokio::test]
async fn test_push_notification_triggers_processing() {
    let mailbox = Arc::new(InMemoryMailbox::new());
    let f = flow(harness(mailbox.clone(), true).await);
    f.reconciler.schedule_all().await.unwrap();
    f.workers.drain().await.unwrap();

    mailbox.deliver(create_promo_message("m1"));

    let handler = PushHandler::new(f.h.db.clone(), f.h.queue.clone());
    let body = serde_json::json!({ "mailboxIdentifier": MAILBOX_ID, "changeCursor": "999" });
    let ack = handler
        .handle(body.to_string().as_bytes())
        .await
        .unwrap();
    assert_eq!(
        ack,
        PushAck::Enqueued {
            mailbox_id: MAILBOX_ID.to_string()
        }
    );

    assert_eq!(f.workers.drain().await.unwrap(), 2);
    assert_eq!(mailbox.calls("trash"), 1);
}

#[tokio::test]
async fn test_reprocessing_the_feed_does_not_repeat_actions() {
    let mailbox = Arc::new(InMemoryMailbox::new());
    let f = flow(harness(mailbox.clone(), true).await);
    f.reconciler.schedule_all().await.unwrap();
    f.workers.drain().await.unwrap();

    mailbox.deliver(create_promo_message("m1"));
    f.reconciler.schedule_all().await.unwrap();
    f.workers.drain().await.unwrap();

    // A duplicate job for the same message is absorbed by the ledger
    f.h.queue
        .enqueue(Job::Process {
            mailbox_id: MAILBOX_ID.to_string(),
            message_id: "m1".to_string(),
        })
        .await
        .unwrap();
    f.workers.drain().await.unwrap();

    assert_eq!(mailbox.calls("trash"), 1);
}

#[tokio::test]
async fn test_paused_mailbox_keeps_its_jobs() {
    let mailbox = Arc::new(InMemoryMailbox::new());
    let f = flow(harness(mailbox.clone(), true).await);
    mailbox.deliver(create_promo_message("m1"));

    // Set through its own registry, as `inbox-triage pause` in another process would
    PauseRegistry::new(f.h.db.clone())
        .pause(MAILBOX_ID)
        .await
        .unwrap();
    assert!(f.pauses.is_paused(MAILBOX_ID).await.unwrap());

    f.h.queue
        .enqueue(Job::Process {
            mailbox_id: MAILBOX_ID.to_string(),
            message_id: "m1".to_string(),
        })
        .await
        .unwrap();

    assert_eq!(f.workers.drain().await.unwrap(), 1);
    assert_eq!(mailbox.mutating_calls(), 0);
    // Requeued for later, not failed
    assert_eq!(f.h.queue.pending_count(Some(MAILBOX_ID)).await.unwrap(), 1);
    assert!(f.h.queue.failed(MAILBOX_ID).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_backlog_pages_through_inbox() {
    let mailbox = Arc::new(InMemoryMailbox::new());
    let h = harness(mailbox.clone(), true).await;
    let settings = MailboxSettings {
        action_mode: true,
        backlog: BacklogSettings {
            enabled: true,
            batch_size: 2,
            ..Default::default()
        },
        ..Default::default()
    };
    store::mailboxes::update_settings(&h.db, MAILBOX_ID, &settings)
        .await
        .unwrap();
    for i in 0..5 {
        mailbox.deliver(create_promo_message(&format!("old{}", i)));
    }
    let f = flow(h);
    let row = store::mailboxes::require(&f.h.db, MAILBOX_ID).await.unwrap();

    f.backlog.start(&row).await.unwrap();
    // Pages of 2, 2 and 1
    assert_eq!(f.workers.drain().await.unwrap(), 3);

    let progress = f.backlog.progress(MAILBOX_ID).await.unwrap().unwrap();
    assert!(progress.finished);
    assert_eq!(progress.processed, 5);
    assert_eq!(progress.total, Some(5));
    assert_eq!(progress.percent(), Some(100.0));
    assert_eq!(mailbox.calls("trash"), 5);

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(f.h.notifier.kinds().contains(&NotificationKind::BacklogComplete));
}

#[tokio::test]
async fn test_expired_credential_deactivates_mailbox() {
    let mut client = MockMailboxClient::new();
    client.expect_get_metadata().times(1).returning(|_| {
        Err(inbox_triage::TriageError::CredentialExpired(
            "token revoked".to_string(),
        ))
    });
    let f = flow(harness(Arc::new(client), true).await);

    for message_id in ["m1", "m2"] {
        f.h.queue
            .enqueue(Job::Process {
                mailbox_id: MAILBOX_ID.to_string(),
                message_id: message_id.to_string(),
            })
            .await
            .unwrap();
    }
    assert_eq!(f.workers.drain().await.unwrap(), 2);

    let row = store::mailboxes::require(&f.h.db, MAILBOX_ID).await.unwrap();
    assert!(!row.active);
    // The second job is dropped once the mailbox is inactive
    assert_eq!(f.h.queue.failed(MAILBOX_ID).await.unwrap().len(), 1);
    assert_eq!(f.h.queue.pending_count(Some(MAILBOX_ID)).await.unwrap(), 0);

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(f.h.notifier.kinds(), vec![NotificationKind::CredentialExpired]);
}
