//! Backlog run progress, one row per mailbox.

use rusqlite::{params, OptionalExtension};

use crate::error::Result;
use crate::models::BacklogProgress;
use crate::store::{from_millis, to_millis, Database};

pub async fn load(db: &Database, mailbox_id: &str) -> Result<Option<BacklogProgress>> {
    let mailbox_id = mailbox_id.to_string();

    db.with_conn(move |conn| {
        Ok(conn
            .query_row(
                r#"
                SELECT mailbox_id, processed, total, next_page_token,
                       started_at, updated_at, finished
                FROM backlog_progress WHERE mailbox_id = ?1
                "#,
                [&mailbox_id],
                |row| {
                    Ok(BacklogProgress {
                        mailbox_id: row.get(0)?,
                        processed: row.get::<_, i64>(1)? as u64,
                        total: row.get::<_, Option<i64>>(2)?.map(|t| t as u64),
                        next_page_token: row.get(3)?,
                        started_at: from_millis(row.get(4)?),
                        updated_at: from_millis(row.get(5)?),
                        finished: row.get(6)?,
                    })
                },
            )
            .optional()?)
    })
    .await
}

/// Insert or replace the mailbox's progress row
pub async fn save(db: &Database, progress: &BacklogProgress) -> Result<()> {
    let progress = progress.clone();

    db.with_conn(move |conn| {
        conn.execute(
            r#"
            INSERT INTO backlog_progress (
                mailbox_id, processed, total, next_page_token,
                started_at, updated_at, finished
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(mailbox_id) DO UPDATE SET
                processed = excluded.processed,
                total = excluded.total,
                next_page_token = excluded.next_page_token,
                started_at = excluded.started_at,
                updated_at = excluded.updated_at,
                finished = excluded.finished
            "#,
            params![
                progress.mailbox_id,
                progress.processed as i64,
                progress.total.map(|t| t as i64),
                progress.next_page_token,
                to_millis(progress.started_at),
                to_millis(progress.updated_at),
                progress.finished,
            ],
        )?;
        Ok(())
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn save_and_load() {
        let db = Database::open_in_memory().await.unwrap();
        assert!(load(&db, "mb").await.unwrap().is_none());

        let mut progress = BacklogProgress::new("mb", Utc::now());
        progress.processed = 40;
        progress.total = Some(120);
        progress.next_page_token = Some("page-2".to_string());
        save(&db, &progress).await.unwrap();

        let loaded = load(&db, "mb").await.unwrap().unwrap();
        assert_eq!(loaded.processed, 40);
        assert_eq!(loaded.total, Some(120));
        assert_eq!(loaded.next_page_token.as_deref(), Some("page-2"));
        assert!(!loaded.finished);
    }

    #[tokio::test]
    async fn save_replaces_existing_row() {
        let db = Database::open_in_memory().await.unwrap();
        let mut progress = BacklogProgress::new("mb", Utc::now());
        save(&db, &progress).await.unwrap();

        progress.finished = true;
        progress.next_page_token = None;
        save(&db, &progress).await.unwrap();

        let loaded = load(&db, "mb").await.unwrap().unwrap();
        assert!(loaded.finished);
        assert!(loaded.next_page_token.is_none());
    }
}
