//! SQL schema definitions as const strings.

pub const CREATE_MAILBOXES: &str = r#"
CREATE TABLE IF NOT EXISTS mailboxes (
    id TEXT PRIMARY KEY,
    email TEXT NOT NULL UNIQUE,
    credential_ref TEXT NOT NULL,
    last_sync_token TEXT,
    active INTEGER NOT NULL DEFAULT 1,
    settings_json TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
)
"#;

/// Audit ledger. One row per processed message, never deleted.
pub const CREATE_ACTION_RECORDS: &str = r#"
CREATE TABLE IF NOT EXISTS action_records (
    id TEXT PRIMARY KEY,
    mailbox_id TEXT NOT NULL REFERENCES mailboxes(id),
    message_id TEXT NOT NULL,
    thread_id TEXT NOT NULL,
    sender_email TEXT NOT NULL,
    subject TEXT NOT NULL,
    disposition TEXT NOT NULL,
    confidence REAL NOT NULL,
    reason TEXT NOT NULL,
    signals_json TEXT NOT NULL,
    tier TEXT NOT NULL,
    mode TEXT NOT NULL,
    pre_action_labels_json TEXT NOT NULL,
    applied_label TEXT,
    created_at INTEGER NOT NULL,
    executed_at INTEGER,
    execution_error TEXT,
    undone_at INTEGER,
    undo_deadline INTEGER NOT NULL,
    UNIQUE (mailbox_id, message_id)
);
CREATE INDEX IF NOT EXISTS idx_action_records_mailbox_created
    ON action_records(mailbox_id, created_at);
"#;

pub const CREATE_LEDGER_GUARDS: &str = r#"
CREATE TRIGGER IF NOT EXISTS action_records_no_delete
BEFORE DELETE ON action_records
BEGIN
    SELECT RAISE(ABORT, 'action_records is append-only');
END;

CREATE TRIGGER IF NOT EXISTS action_records_undo_only
BEFORE UPDATE ON action_records
WHEN OLD.undone_at IS NOT NULL
    OR NEW.undone_at IS NULL
    OR NEW.id IS NOT OLD.id
    OR NEW.mailbox_id IS NOT OLD.mailbox_id
    OR NEW.message_id IS NOT OLD.message_id
    OR NEW.thread_id IS NOT OLD.thread_id
    OR NEW.sender_email IS NOT OLD.sender_email
    OR NEW.subject IS NOT OLD.subject
    OR NEW.disposition IS NOT OLD.disposition
    OR NEW.confidence IS NOT OLD.confidence
    OR NEW.reason IS NOT OLD.reason
    OR NEW.signals_json IS NOT OLD.signals_json
    OR NEW.tier IS NOT OLD.tier
    OR NEW.mode IS NOT OLD.mode
    OR NEW.pre_action_labels_json IS NOT OLD.pre_action_labels_json
    OR NEW.applied_label IS NOT OLD.applied_label
    OR NEW.created_at IS NOT OLD.created_at
    OR NEW.executed_at IS NOT OLD.executed_at
    OR NEW.execution_error IS NOT OLD.execution_error
    OR NEW.undo_deadline IS NOT OLD.undo_deadline
BEGIN
    SELECT RAISE(ABORT, 'action_records only permits setting undone_at once');
END;
"#;

/// Taken before any remote action so concurrent duplicates cannot both act
pub const CREATE_PROCESSING_CLAIMS: &str = r#"
CREATE TABLE IF NOT EXISTS processing_claims (
    mailbox_id TEXT NOT NULL,
    message_id TEXT NOT NULL,
    claimed_at INTEGER NOT NULL,
    PRIMARY KEY (mailbox_id, message_id)
)
"#;

pub const CREATE_WORK_QUEUE: &str = r#"
CREATE TABLE IF NOT EXISTS work_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    mailbox_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    dedupe_key TEXT,
    not_before INTEGER NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    claimed_at INTEGER,
    failed_at INTEGER,
    last_error TEXT,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_work_queue_ready
    ON work_queue(failed_at, claimed_at, not_before);
CREATE UNIQUE INDEX IF NOT EXISTS idx_work_queue_pending_dedupe
    ON work_queue(dedupe_key)
    WHERE dedupe_key IS NOT NULL AND claimed_at IS NULL AND failed_at IS NULL;
"#;

pub const CREATE_ASSISTED_CACHE: &str = r#"
CREATE TABLE IF NOT EXISTS assisted_cache (
    sender_domain TEXT NOT NULL,
    subject_hash TEXT NOT NULL,
    disposition TEXT NOT NULL,
    confidence REAL NOT NULL,
    reason TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (sender_domain, subject_hash)
)
"#;

pub const CREATE_BACKLOG_PROGRESS: &str = r#"
CREATE TABLE IF NOT EXISTS backlog_progress (
    mailbox_id TEXT PRIMARY KEY,
    processed INTEGER NOT NULL DEFAULT 0,
    total INTEGER,
    next_page_token TEXT,
    started_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    finished INTEGER NOT NULL DEFAULT 0
)
"#;

/// Emergency stops, shared by every process on the database
pub const CREATE_PAUSES: &str = r#"
CREATE TABLE IF NOT EXISTS pauses (
    scope TEXT PRIMARY KEY,
    paused_at INTEGER NOT NULL,
    alerted INTEGER NOT NULL DEFAULT 0
)
"#;

/// Returns all migrations in order.
pub fn all_migrations() -> Vec<&'static str> {
    vec![
        CREATE_MAILBOXES,
        CREATE_ACTION_RECORDS,
        CREATE_LEDGER_GUARDS,
        CREATE_PROCESSING_CLAIMS,
        CREATE_WORK_QUEUE,
        CREATE_ASSISTED_CACHE,
        CREATE_BACKLOG_PROGRESS,
        CREATE_PAUSES,
    ]
}
