//! Mailbox rows: identity, cursor, active flag and stored settings.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use crate::error::{Result, TriageError};
use crate::models::{Mailbox, MailboxSettings};
use crate::store::{from_millis, json_column, to_millis, Database};

const MAILBOX_COLUMNS: &str =
    "id, email, credential_ref, last_sync_token, active, settings_json, created_at";

/// Inserts a mailbox, or refreshes credential and reactivates it when the email already exists
pub async fn upsert(db: &Database, mailbox: &Mailbox) -> Result<Mailbox> {
    let mailbox = mailbox.clone();

    db.with_conn(move |conn| {
        let now = to_millis(Utc::now());
        let settings = serde_json::to_string(&mailbox.settings)?;

        conn.execute(
            r#"
            INSERT INTO mailboxes (
                id, email, credential_ref, last_sync_token, active,
                settings_json, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(email) DO UPDATE SET
                credential_ref = excluded.credential_ref,
                active = 1,
                updated_at = excluded.updated_at
            "#,
            params![
                mailbox.id,
                mailbox.email,
                mailbox.credential_ref,
                mailbox.last_sync_token,
                mailbox.active,
                settings,
                to_millis(mailbox.created_at),
                now,
            ],
        )?;

        let sql = format!("SELECT {} FROM mailboxes WHERE email = ?1", MAILBOX_COLUMNS);
        Ok(conn.query_row(&sql, [&mailbox.email], row_to_mailbox)?)
    })
    .await
}

pub async fn get(db: &Database, mailbox_id: &str) -> Result<Option<Mailbox>> {
    let mailbox_id = mailbox_id.to_string();

    db.with_conn(move |conn| {
        let sql = format!("SELECT {} FROM mailboxes WHERE id = ?1", MAILBOX_COLUMNS);
        Ok(conn.query_row(&sql, [&mailbox_id], row_to_mailbox).optional()?)
    })
    .await
}

/// Like [`get`] but missing rows are an error
pub async fn require(db: &Database, mailbox_id: &str) -> Result<Mailbox> {
    get(db, mailbox_id)
        .await?
        .ok_or_else(|| TriageError::MailboxNotFound(mailbox_id.to_string()))
}

pub async fn get_by_email(db: &Database, email: &str) -> Result<Option<Mailbox>> {
    let email = email.to_lowercase();

    db.with_conn(move |conn| {
        let sql = format!(
            "SELECT {} FROM mailboxes WHERE lower(email) = ?1",
            MAILBOX_COLUMNS
        );
        Ok(conn.query_row(&sql, [&email], row_to_mailbox).optional()?)
    })
    .await
}

pub async fn list(db: &Database, active_only: bool) -> Result<Vec<Mailbox>> {
    db.with_conn(move |conn| {
        let sql = if active_only {
            format!(
                "SELECT {} FROM mailboxes WHERE active = 1 ORDER BY created_at",
                MAILBOX_COLUMNS
            )
        } else {
            format!("SELECT {} FROM mailboxes ORDER BY created_at", MAILBOX_COLUMNS)
        };
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_mailbox)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    })
    .await
}

/// Move the change-feed cursor; only the reconciler calls this
pub async fn advance_cursor(db: &Database, mailbox_id: &str, cursor: &str) -> Result<()> {
    let mailbox_id = mailbox_id.to_string();
    let cursor = cursor.to_string();

    db.with_conn(move |conn| {
        let changed = conn.execute(
            "UPDATE mailboxes SET last_sync_token = ?1, updated_at = ?2 WHERE id = ?3",
            params![cursor, to_millis(Utc::now()), mailbox_id],
        )?;
        if changed == 0 {
            return Err(TriageError::MailboxNotFound(mailbox_id));
        }
        Ok(())
    })
    .await
}

pub async fn set_active(db: &Database, mailbox_id: &str, active: bool) -> Result<()> {
    let mailbox_id = mailbox_id.to_string();

    db.with_conn(move |conn| {
        let changed = conn.execute(
            "UPDATE mailboxes SET active = ?1, updated_at = ?2 WHERE id = ?3",
            params![active, to_millis(Utc::now()), mailbox_id],
        )?;
        if changed == 0 {
            return Err(TriageError::MailboxNotFound(mailbox_id));
        }
        Ok(())
    })
    .await
}

pub async fn update_settings(
    db: &Database,
    mailbox_id: &str,
    settings: &MailboxSettings,
) -> Result<()> {
    let mailbox_id = mailbox_id.to_string();
    let settings = serde_json::to_string(settings)?;

    db.with_conn(move |conn| {
        let changed = conn.execute(
            "UPDATE mailboxes SET settings_json = ?1, updated_at = ?2 WHERE id = ?3",
            params![settings, to_millis(Utc::now()), mailbox_id],
        )?;
        if changed == 0 {
            return Err(TriageError::MailboxNotFound(mailbox_id));
        }
        Ok(())
    })
    .await
}

fn row_to_mailbox(row: &Row<'_>) -> rusqlite::Result<Mailbox> {
    let settings_json: String = row.get(5)?;
    Ok(Mailbox {
        id: row.get(0)?,
        email: row.get(1)?,
        credential_ref: row.get(2)?,
        last_sync_token: row.get(3)?,
        active: row.get(4)?,
        settings: json_column(5, &settings_json)?,
        created_at: from_millis(row.get(6)?),
    })
}
