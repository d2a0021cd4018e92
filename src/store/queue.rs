//! Durable work queue rows.
//!
//! A row is pending while `claimed_at` and `failed_at` are both NULL, or when its
//! claim lease has lapsed. Completed rows are deleted; failed rows stay until revived.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension, Row, Transaction};

use crate::error::Result;
use crate::store::{from_millis, to_millis, Database};

/// Row to insert
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub mailbox_id: String,
    pub kind: String,
    pub payload: String,
    pub dedupe_key: Option<String>,
    pub not_before: DateTime<Utc>,
}

/// Row handed to a worker
#[derive(Debug, Clone, PartialEq)]
pub struct JobRow {
    pub id: i64,
    pub mailbox_id: String,
    pub kind: String,
    pub payload: String,
    /// Attempts including the current one
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Failed row, for status output
#[derive(Debug, Clone, PartialEq)]
pub struct FailedJob {
    pub id: i64,
    pub mailbox_id: String,
    pub kind: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

fn insert_row(tx: &Transaction<'_>, job: &NewJob, now: DateTime<Utc>) -> Result<bool> {
    let inserted = tx.execute(
        r#"
        INSERT OR IGNORE INTO work_queue (
            mailbox_id, kind, payload, dedupe_key, not_before, attempts, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)
        "#,
        params![
            job.mailbox_id,
            job.kind,
            job.payload,
            job.dedupe_key,
            to_millis(job.not_before),
            to_millis(now),
        ],
    )?;
    Ok(inserted == 1)
}

/// Inserts all rows in one transaction; returns how many were new
///
/// A row whose `dedupe_key` matches a pending row is skipped.
pub async fn enqueue_many(db: &Database, jobs: Vec<NewJob>) -> Result<usize> {
    db.transaction(move |tx| {
        let now = Utc::now();
        let mut inserted = 0;
        for job in &jobs {
            if insert_row(tx, job, now)? {
                inserted += 1;
            }
        }
        Ok(inserted)
    })
    .await
}

/// Takes the oldest ready row and stamps its claim
pub async fn claim(db: &Database, now: DateTime<Utc>, lease: Duration) -> Result<Option<JobRow>> {
    db.transaction(move |tx| {
        let now_ms = to_millis(now);
        let stale_ms = to_millis(now - lease);

        let id: Option<i64> = tx
            .query_row(
                r#"
                SELECT id FROM work_queue
                WHERE failed_at IS NULL
                  AND (claimed_at IS NULL OR claimed_at < ?2)
                  AND not_before <= ?1
                ORDER BY not_before, id
                LIMIT 1
                "#,
                params![now_ms, stale_ms],
                |row| row.get(0),
            )
            .optional()?;

        let Some(id) = id else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE work_queue SET claimed_at = ?1, attempts = attempts + 1 WHERE id = ?2",
            params![now_ms, id],
        )?;

        Ok(Some(tx.query_row(
            r#"
            SELECT id, mailbox_id, kind, payload, attempts, last_error, created_at
            FROM work_queue WHERE id = ?1
            "#,
            [id],
            row_to_job,
        )?))
    })
    .await
}

pub async fn complete(db: &Database, id: i64) -> Result<()> {
    db.with_conn(move |conn| {
        conn.execute("DELETE FROM work_queue WHERE id = ?1", [id])?;
        Ok(())
    })
    .await
}

/// Releases a claimed row to run again at `not_before`
///
/// When an identical job is already pending the row is dropped instead.
pub async fn requeue(
    db: &Database,
    id: i64,
    not_before: DateTime<Utc>,
    error: Option<String>,
) -> Result<()> {
    db.transaction(move |tx| {
        let changed = tx.execute(
            r#"
            UPDATE OR IGNORE work_queue
            SET claimed_at = NULL, not_before = ?1, last_error = COALESCE(?2, last_error)
            WHERE id = ?3
            "#,
            params![to_millis(not_before), error, id],
        )?;
        if changed == 0 {
            tx.execute("DELETE FROM work_queue WHERE id = ?1", [id])?;
        }
        Ok(())
    })
    .await
}

pub async fn fail(db: &Database, id: i64, now: DateTime<Utc>, error: &str) -> Result<()> {
    let error = error.to_string();

    db.with_conn(move |conn| {
        conn.execute(
            r#"
            UPDATE work_queue
            SET failed_at = ?1, claimed_at = NULL, last_error = ?2
            WHERE id = ?3
            "#,
            params![to_millis(now), error, id],
        )?;
        Ok(())
    })
    .await
}

/// Moves a mailbox's failed rows back to pending; returns how many were revived
pub async fn revive_failed(db: &Database, mailbox_id: &str, now: DateTime<Utc>) -> Result<usize> {
    let mailbox_id = mailbox_id.to_string();

    db.with_conn(move |conn| {
        let revived = conn.execute(
            r#"
            UPDATE OR IGNORE work_queue
            SET failed_at = NULL, claimed_at = NULL, attempts = 0, not_before = ?1
            WHERE mailbox_id = ?2 AND failed_at IS NOT NULL
            "#,
            params![to_millis(now), mailbox_id],
        )?;
        Ok(revived)
    })
    .await
}

/// Rows not yet failed, optionally for one mailbox
pub async fn pending_count(db: &Database, mailbox_id: Option<&str>) -> Result<u64> {
    let mailbox_id = mailbox_id.map(str::to_string);

    db.with_conn(move |conn| {
        let count: i64 = match mailbox_id {
            Some(id) => conn.query_row(
                "SELECT COUNT(*) FROM work_queue WHERE failed_at IS NULL AND mailbox_id = ?1",
                [id],
                |row| row.get(0),
            )?,
            None => conn.query_row(
                "SELECT COUNT(*) FROM work_queue WHERE failed_at IS NULL",
                [],
                |row| row.get(0),
            )?,
        };
        Ok(count as u64)
    })
    .await
}

pub async fn list_failed(db: &Database, mailbox_id: &str) -> Result<Vec<FailedJob>> {
    let mailbox_id = mailbox_id.to_string();

    db.with_conn(move |conn| {
        let mut stmt = conn.prepare(
            r#"
            SELECT id, mailbox_id, kind, attempts, failed_at, last_error
            FROM work_queue
            WHERE mailbox_id = ?1 AND failed_at IS NOT NULL
            ORDER BY failed_at DESC
            "#,
        )?;
        let rows = stmt.query_map([&mailbox_id], |row| {
            Ok(FailedJob {
                id: row.get(0)?,
                mailbox_id: row.get(1)?,
                kind: row.get(2)?,
                attempts: row.get(3)?,
                failed_at: from_millis(row.get(4)?),
                last_error: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    })
    .await
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<JobRow> {
    Ok(JobRow {
        id: row.get(0)?,
        mailbox_id: row.get(1)?,
        kind: row.get(2)?,
        payload: row.get(3)?,
        attempts: row.get(4)?,
        last_error: row.get(5)?,
        created_at: from_millis(row.get(6)?),
    })
}
