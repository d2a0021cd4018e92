//! Append-only action ledger.
//!
//! Rows are inserted once and the only write after that is the conditional
//! `undone_at` stamp in [`mark_undone`]. The schema triggers reject anything else.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension, Row};

use crate::error::{Result, TriageError};
use crate::models::ActionRecord;
use crate::store::{from_millis, json_column, parsed_column, to_millis, Database};

const RECORD_COLUMNS: &str = r#"
    id, mailbox_id, message_id, thread_id, sender_email, subject,
    disposition, confidence, reason, signals_json, tier, mode,
    pre_action_labels_json, applied_label, created_at, executed_at,
    execution_error, undone_at, undo_deadline
"#;

/// Appends a record; returns false when `(mailbox_id, message_id)` already has one
pub async fn append(db: &Database, record: &ActionRecord) -> Result<bool> {
    let record = record.clone();

    db.with_conn(move |conn| {
        let signals = serde_json::to_string(&record.signals)?;
        let labels = serde_json::to_string(&record.pre_action_labels)?;

        let inserted = conn.execute(
            r#"
            INSERT OR IGNORE INTO action_records (
                id, mailbox_id, message_id, thread_id, sender_email, subject,
                disposition, confidence, reason, signals_json, tier, mode,
                pre_action_labels_json, applied_label, created_at, executed_at,
                execution_error, undone_at, undo_deadline
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19
            )
            "#,
            params![
                record.id,
                record.mailbox_id,
                record.message_id,
                record.thread_id,
                record.sender_email,
                record.subject,
                record.disposition.as_str(),
                record.confidence,
                record.reason,
                signals,
                record.tier.as_str(),
                record.mode.as_str(),
                labels,
                record.applied_label,
                to_millis(record.created_at),
                record.executed_at.map(to_millis),
                record.execution_error,
                record.undone_at.map(to_millis),
                to_millis(record.undo_deadline),
            ],
        )?;

        Ok(inserted == 1)
    })
    .await
}

pub async fn find(db: &Database, record_id: &str) -> Result<Option<ActionRecord>> {
    let record_id = record_id.to_string();

    db.with_conn(move |conn| {
        let sql = format!("SELECT {} FROM action_records WHERE id = ?1", RECORD_COLUMNS);
        Ok(conn.query_row(&sql, [&record_id], row_to_record).optional()?)
    })
    .await
}

pub async fn find_by_message(
    db: &Database,
    mailbox_id: &str,
    message_id: &str,
) -> Result<Option<ActionRecord>> {
    let mailbox_id = mailbox_id.to_string();
    let message_id = message_id.to_string();

    db.with_conn(move |conn| {
        let sql = format!(
            "SELECT {} FROM action_records WHERE mailbox_id = ?1 AND message_id = ?2",
            RECORD_COLUMNS
        );
        Ok(conn
            .query_row(&sql, params![mailbox_id, message_id], row_to_record)
            .optional()?)
    })
    .await
}

/// Returns the subset of `message_ids` that already have a ledger row
pub async fn known_message_ids(
    db: &Database,
    mailbox_id: &str,
    message_ids: &[String],
) -> Result<Vec<String>> {
    let mailbox_id = mailbox_id.to_string();
    let message_ids = message_ids.to_vec();

    db.with_conn(move |conn| {
        let mut stmt = conn.prepare_cached(
            "SELECT 1 FROM action_records WHERE mailbox_id = ?1 AND message_id = ?2",
        )?;
        let mut known = Vec::new();
        for id in message_ids {
            if stmt.exists(params![mailbox_id, id])? {
                known.push(id);
            }
        }
        Ok(known)
    })
    .await
}

pub async fn recent(db: &Database, mailbox_id: &str, limit: usize) -> Result<Vec<ActionRecord>> {
    let mailbox_id = mailbox_id.to_string();

    db.with_conn(move |conn| {
        let sql = format!(
            "SELECT {} FROM action_records WHERE mailbox_id = ?1
             ORDER BY created_at DESC, rowid DESC LIMIT ?2",
            RECORD_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![mailbox_id, limit as i64], row_to_record)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    })
    .await
}

/// Per-disposition counts for a mailbox: (disposition, total, executed, undone)
pub async fn summary(db: &Database, mailbox_id: &str) -> Result<Vec<(String, i64, i64, i64)>> {
    let mailbox_id = mailbox_id.to_string();

    db.with_conn(move |conn| {
        let mut stmt = conn.prepare(
            r#"
            SELECT disposition,
                   COUNT(*),
                   COUNT(executed_at),
                   COUNT(undone_at)
            FROM action_records
            WHERE mailbox_id = ?1
            GROUP BY disposition
            ORDER BY disposition
            "#,
        )?;
        let rows = stmt.query_map([&mailbox_id], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    })
    .await
}

/// Stamp `undone_at` if the record is still undoable at `now`
///
/// A single conditional UPDATE, so two concurrent undo attempts cannot both
/// succeed. When nothing changes the row is re-read to report why.
pub async fn mark_undone(db: &Database, record_id: &str, now: DateTime<Utc>) -> Result<()> {
    let record_id = record_id.to_string();

    db.with_conn(move |conn| {
        let now_ms = to_millis(now);
        let changed = conn.execute(
            r#"
            UPDATE action_records
            SET undone_at = ?1
            WHERE id = ?2 AND undone_at IS NULL AND undo_deadline >= ?1
            "#,
            params![now_ms, record_id],
        )?;

        if changed == 1 {
            return Ok(());
        }

        let sql = format!("SELECT {} FROM action_records WHERE id = ?1", RECORD_COLUMNS);
        let record = conn
            .query_row(&sql, [&record_id], row_to_record)
            .optional()?
            .ok_or_else(|| TriageError::RecordNotFound(record_id.clone()))?;

        if record.undone_at.is_some() {
            Err(TriageError::AlreadyUndone(record_id))
        } else {
            Err(TriageError::UndoExpired {
                record_id,
                deadline: record.undo_deadline,
            })
        }
    })
    .await
}

/// Claim a message before acting on it. Returns false when another worker holds a live claim.
pub async fn claim(
    db: &Database,
    mailbox_id: &str,
    message_id: &str,
    now: DateTime<Utc>,
    lease: Duration,
) -> Result<bool> {
    let mailbox_id = mailbox_id.to_string();
    let message_id = message_id.to_string();

    db.with_conn(move |conn| {
        let changed = conn.execute(
            r#"
            INSERT INTO processing_claims (mailbox_id, message_id, claimed_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(mailbox_id, message_id) DO UPDATE SET claimed_at = excluded.claimed_at
            WHERE processing_claims.claimed_at < ?4
            "#,
            params![
                mailbox_id,
                message_id,
                to_millis(now),
                to_millis(now - lease)
            ],
        )?;
        Ok(changed == 1)
    })
    .await
}

pub async fn release_claim(db: &Database, mailbox_id: &str, message_id: &str) -> Result<()> {
    let mailbox_id = mailbox_id.to_string();
    let message_id = message_id.to_string();

    db.with_conn(move |conn| {
        conn.execute(
            "DELETE FROM processing_claims WHERE mailbox_id = ?1 AND message_id = ?2",
            params![mailbox_id, message_id],
        )?;
        Ok(())
    })
    .await
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<ActionRecord> {
    let disposition: String = row.get(6)?;
    let signals_json: String = row.get(9)?;
    let tier: String = row.get(10)?;
    let mode: String = row.get(11)?;
    let labels_json: String = row.get(12)?;

    Ok(ActionRecord {
        id: row.get(0)?,
        mailbox_id: row.get(1)?,
        message_id: row.get(2)?,
        thread_id: row.get(3)?,
        sender_email: row.get(4)?,
        subject: row.get(5)?,
        disposition: parsed_column(6, &disposition)?,
        confidence: row.get(7)?,
        reason: row.get(8)?,
        signals: json_column(9, &signals_json)?,
        tier: parsed_column(10, &tier)?,
        mode: parsed_column(11, &mode)?,
        pre_action_labels: json_column(12, &labels_json)?,
        applied_label: row.get(13)?,
        created_at: from_millis(row.get(14)?),
        executed_at: row.get::<_, Option<i64>>(15)?.map(from_millis),
        execution_error: row.get(16)?,
        undone_at: row.get::<_, Option<i64>>(17)?.map(from_millis),
        undo_deadline: from_millis(row.get(18)?),
    })
}
