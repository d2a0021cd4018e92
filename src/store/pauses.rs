//! Emergency-stop flags. One row per paused scope; `*` is the global stop.

use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::error::Result;
use crate::store::{from_millis, to_millis, Database};

pub const GLOBAL_SCOPE: &str = "*";

/// Set a pause. An existing pause keeps its original start time.
pub async fn set(db: &Database, scope: &str, now: DateTime<Utc>) -> Result<bool> {
    let scope = scope.to_string();

    db.with_conn(move |conn| {
        let changed = conn.execute(
            "INSERT OR IGNORE INTO pauses (scope, paused_at, alerted) VALUES (?1, ?2, 0)",
            params![scope, to_millis(now)],
        )?;
        Ok(changed == 1)
    })
    .await
}

pub async fn clear(db: &Database, scope: &str) -> Result<bool> {
    let scope = scope.to_string();

    db.with_conn(move |conn| {
        let changed = conn.execute("DELETE FROM pauses WHERE scope = ?1", [&scope])?;
        Ok(changed == 1)
    })
    .await
}

pub async fn clear_all(db: &Database) -> Result<usize> {
    db.with_conn(|conn| Ok(conn.execute("DELETE FROM pauses", [])?))
        .await
}

/// True when the mailbox or the global scope is paused
pub async fn is_paused(db: &Database, mailbox_id: &str) -> Result<bool> {
    let mailbox_id = mailbox_id.to_string();

    db.with_conn(move |conn| {
        Ok(conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM pauses WHERE scope IN (?1, ?2))",
            params![mailbox_id, GLOBAL_SCOPE],
            |row| row.get(0),
        )?)
    })
    .await
}

/// Every pause that started at or before `cutoff`, ordered by scope
pub async fn started_before(
    db: &Database,
    cutoff: DateTime<Utc>,
) -> Result<Vec<(String, DateTime<Utc>)>> {
    db.with_conn(move |conn| {
        let mut stmt = conn.prepare(
            "SELECT scope, paused_at FROM pauses WHERE paused_at <= ?1 ORDER BY scope",
        )?;
        let rows = stmt
            .query_map([to_millis(cutoff)], |row| {
                Ok((row.get::<_, String>(0)?, from_millis(row.get(1)?)))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    })
    .await
}

/// Pauses started at or before `cutoff` that have not alerted yet; marks them alerted
pub async fn take_unalerted(
    db: &Database,
    cutoff: DateTime<Utc>,
) -> Result<Vec<(String, DateTime<Utc>)>> {
    db.transaction(move |tx| {
        let overdue = {
            let mut stmt = tx.prepare(
                r#"
                SELECT scope, paused_at FROM pauses
                WHERE alerted = 0 AND paused_at <= ?1
                ORDER BY scope
                "#,
            )?;
            let rows = stmt
                .query_map([to_millis(cutoff)], |row| {
                    Ok((row.get::<_, String>(0)?, from_millis(row.get(1)?)))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        for (scope, _) in &overdue {
            tx.execute("UPDATE pauses SET alerted = 1 WHERE scope = ?1", [scope])?;
        }
        Ok(overdue)
    })
    .await
}
