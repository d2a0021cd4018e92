//! Assisted-classification cache keyed by sender domain and subject pattern hash.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};

use crate::error::Result;
use crate::models::Disposition;
use crate::store::{parsed_column, to_millis, Database};

#[derive(Debug, Clone, PartialEq)]
pub struct CachedVerdict {
    pub disposition: Disposition,
    pub confidence: f64,
    pub reason: String,
}

/// Returns the cached verdict unless it is older than `ttl`
pub async fn get(
    db: &Database,
    sender_domain: &str,
    subject_hash: &str,
    ttl: Duration,
    now: DateTime<Utc>,
) -> Result<Option<CachedVerdict>> {
    let sender_domain = sender_domain.to_string();
    let subject_hash = subject_hash.to_string();

    db.with_conn(move |conn| {
        Ok(conn
            .query_row(
                r#"
                SELECT disposition, confidence, reason FROM assisted_cache
                WHERE sender_domain = ?1 AND subject_hash = ?2 AND created_at >= ?3
                "#,
                params![sender_domain, subject_hash, to_millis(now - ttl)],
                |row| {
                    let disposition: String = row.get(0)?;
                    Ok(CachedVerdict {
                        disposition: parsed_column(0, &disposition)?,
                        confidence: row.get(1)?,
                        reason: row.get(2)?,
                    })
                },
            )
            .optional()?)
    })
    .await
}

pub async fn put(
    db: &Database,
    sender_domain: &str,
    subject_hash: &str,
    verdict: &CachedVerdict,
    now: DateTime<Utc>,
) -> Result<()> {
    let sender_domain = sender_domain.to_string();
    let subject_hash = subject_hash.to_string();
    let verdict = verdict.clone();

    db.with_conn(move |conn| {
        conn.execute(
            r#"
            INSERT INTO assisted_cache (
                sender_domain, subject_hash, disposition, confidence, reason, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(sender_domain, subject_hash) DO UPDATE SET
                disposition = excluded.disposition,
                confidence = excluded.confidence,
                reason = excluded.reason,
                created_at = excluded.created_at
            "#,
            params![
                sender_domain,
                subject_hash,
                verdict.disposition.as_str(),
                verdict.confidence,
                verdict.reason,
                to_millis(now),
            ],
        )?;
        Ok(())
    })
    .await
}

/// Drops entries older than `ttl`; returns how many were removed
pub async fn purge_expired(db: &Database, ttl: Duration, now: DateTime<Utc>) -> Result<usize> {
    db.with_conn(move |conn| {
        Ok(conn.execute(
            "DELETE FROM assisted_cache WHERE created_at < ?1",
            [to_millis(now - ttl)],
        )?)
    })
    .await
}
