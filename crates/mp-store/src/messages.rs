//! Message repository.

use sqlx::{Row, SqlitePool};

use mp_common::Message;

use crate::mapping::{now_ts, parse_ts};
use crate::{Result, StoreError};

const COLUMNS: &str = "id, api_token_id, title, content, url, url_content, file_storage, \
                       view_token, created_at, updated_at";

/// Input for creating a message. At least one of title/content/url must be
/// non-empty; the caller (ingress) validates this before reaching the store.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub api_token_id: String,
    pub title: Option<String>,
    pub content: Option<String>,
    pub url: Option<String>,
}

/// One bucket of the daily message histogram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyCount {
    pub day: String,
    pub count: i64,
}

pub struct MessageRepository {
    pool: SqlitePool,
}

impl MessageRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, input: NewMessage) -> Result<Message> {
        let id = uuid::Uuid::new_v4().to_string();
        let view_token = uuid::Uuid::new_v4().to_string();
        let now = now_ts();

        sqlx::query(
            "INSERT INTO messages (id, api_token_id, title, content, url, view_token, \
             created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&input.api_token_id)
        .bind(&input.title)
        .bind(&input.content)
        .bind(&input.url)
        .bind(&view_token)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.get(&id)
            .await?
            .ok_or_else(|| StoreError::CorruptRow(format!("message {} missing after insert", id)))
    }

    pub async fn get(&self, id: &str) -> Result<Option<Message>> {
        let row = sqlx::query(&format!("SELECT {} FROM messages WHERE id = ?", COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(parse_row).transpose()
    }

    pub async fn find_by_view_token(&self, view_token: &str) -> Result<Option<Message>> {
        let row = sqlx::query(&format!("SELECT {} FROM messages WHERE view_token = ?", COLUMNS))
            .bind(view_token)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(parse_row).transpose()
    }

    /// Store the text fetched from the message's URL.
    pub async fn set_url_content(&self, id: &str, url_content: &str) -> Result<bool> {
        let result =
            sqlx::query("UPDATE messages SET url_content = ?, updated_at = ? WHERE id = ?")
                .bind(url_content)
                .bind(now_ts())
                .bind(id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn set_file_storage(&self, id: &str, path: &str) -> Result<bool> {
        let result =
            sqlx::query("UPDATE messages SET file_storage = ?, updated_at = ? WHERE id = ?")
                .bind(path)
                .bind(now_ts())
                .bind(id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Messages submitted under a credential, newest first.
    pub async fn list_by_credential(
        &self,
        api_token_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Message>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM messages WHERE api_token_id = ? \
             ORDER BY created_at DESC LIMIT ? OFFSET ?",
            COLUMNS
        ))
        .bind(api_token_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(parse_row).collect()
    }

    pub async fn count_by_credential(&self, api_token_id: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM messages WHERE api_token_id = ?")
            .bind(api_token_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n"))
    }

    pub async fn count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM messages")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n"))
    }

    /// Message counts per calendar day over the last `days` days.
    pub async fn daily_counts(&self, days: i64) -> Result<Vec<DailyCount>> {
        let rows = sqlx::query(
            "SELECT substr(created_at, 1, 10) AS day, COUNT(*) AS n FROM messages \
             WHERE created_at >= datetime('now', ?) \
             GROUP BY day ORDER BY day ASC",
        )
        .bind(format!("-{} days", days))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| DailyCount {
                day: row.get("day"),
                count: row.get::<i64, _>("n"),
            })
            .collect())
    }

    /// Delete a message; attempt rows cascade.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

fn parse_row(row: &sqlx::sqlite::SqliteRow) -> Result<Message> {
    Ok(Message {
        id: row.get("id"),
        api_token_id: row.get("api_token_id"),
        title: row.try_get("title").ok().flatten(),
        content: row.try_get("content").ok().flatten(),
        url: row.try_get("url").ok().flatten(),
        url_content: row.try_get("url_content").ok().flatten(),
        file_storage: row.try_get("file_storage").ok().flatten(),
        view_token: row.get("view_token"),
        created_at: parse_ts(row.get("created_at"))?,
        updated_at: parse_ts(row.get("updated_at"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::NewCredential;
    use crate::Store;

    async fn store_with_credential() -> (Store, String) {
        let store = Store::open_in_memory().await.unwrap();
        store.init_schema().await.unwrap();
        let cred = store
            .credentials()
            .create(NewCredential {
                name: "t".to_string(),
                token: "tok".to_string(),
                default_channels: vec![],
                default_ai: None,
                expires_at: None,
            })
            .await
            .unwrap();
        (store, cred.id)
    }

    #[tokio::test]
    async fn test_create_and_url_content() {
        let (store, cred_id) = store_with_credential().await;
        let repo = store.messages();

        let msg = repo
            .create(NewMessage {
                api_token_id: cred_id,
                title: Some("hi".to_string()),
                content: None,
                url: Some("http://example.com".to_string()),
            })
            .await
            .unwrap();

        assert!(msg.has_payload());
        assert!(!msg.view_token.is_empty());
        assert!(msg.url_content.is_none());

        assert!(repo.set_url_content(&msg.id, "fetched text").await.unwrap());
        let fetched = repo.get(&msg.id).await.unwrap().unwrap();
        assert_eq!(fetched.url_content.as_deref(), Some("fetched text"));

        let by_token = repo.find_by_view_token(&msg.view_token).await.unwrap().unwrap();
        assert_eq!(by_token.id, msg.id);

        assert!(repo.set_file_storage(&msg.id, "data/files/m1.txt").await.unwrap());
        let fetched = repo.get(&msg.id).await.unwrap().unwrap();
        assert_eq!(fetched.file_storage.as_deref(), Some("data/files/m1.txt"));
    }

    #[tokio::test]
    async fn test_pagination_and_counts() {
        let (store, cred_id) = store_with_credential().await;
        let repo = store.messages();

        for i in 0..5 {
            repo.create(NewMessage {
                api_token_id: cred_id.clone(),
                title: Some(format!("msg-{}", i)),
                content: None,
                url: None,
            })
            .await
            .unwrap();
        }

        assert_eq!(repo.count_by_credential(&cred_id).await.unwrap(), 5);
        let page = repo.list_by_credential(&cred_id, 2, 2).await.unwrap();
        assert_eq!(page.len(), 2);

        let histogram = repo.daily_counts(7).await.unwrap();
        assert_eq!(histogram.iter().map(|d| d.count).sum::<i64>(), 5);
    }

    #[tokio::test]
    async fn test_delete_cascades_from_credential() {
        let (store, cred_id) = store_with_credential().await;
        let repo = store.messages();
        let msg = repo
            .create(NewMessage {
                api_token_id: cred_id.clone(),
                title: Some("t".to_string()),
                content: None,
                url: None,
            })
            .await
            .unwrap();

        store.credentials().delete(&cred_id).await.unwrap();
        assert!(repo.get(&msg.id).await.unwrap().is_none());
    }
}
