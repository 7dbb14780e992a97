//! AI processing attempt repository.
//!
//! Same CAS discipline as the channel attempts: `compare_and_set_status` is
//! the only writer of `message_ai.status` after creation, and `success` rows
//! are terminal. At most one AI attempt exists per message.

use chrono::{DateTime, Duration, Utc};
use sqlx::{Row, SqlitePool};

use mp_common::{AiAttempt, AiAttemptStatus};

use crate::mapping::{now_ts, parse_opt_ts, parse_ts, to_ts};
use crate::{Result, StoreError};

const COLUMNS: &str = "id, message_id, ai_channel_id, prompt, result, status, error, \
                       processed_at, retry_count, created_at, updated_at";

/// Extra fields applied together with a status transition.
#[derive(Debug, Clone, Default)]
pub struct AiAttemptUpdate {
    /// `Some(None)` clears the stored error.
    pub error: Option<Option<String>>,
    pub result: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub retry_count: Option<i32>,
    pub increment_retry: bool,
}

impl AiAttemptUpdate {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(Some(message.into())),
            ..Default::default()
        }
    }
}

pub struct AiAttemptRepository {
    pool: SqlitePool,
}

impl AiAttemptRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the message's AI attempt row in `waiting` state. Idempotent:
    /// an existing row for the message is returned untouched.
    pub async fn create(
        &self,
        message_id: &str,
        ai_channel_id: &str,
        prompt: &str,
    ) -> Result<AiAttempt> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = now_ts();

        sqlx::query(
            "INSERT INTO message_ai (id, message_id, ai_channel_id, prompt, status, retry_count, \
             created_at, updated_at) VALUES (?, ?, ?, ?, 'waiting', 0, ?, ?) \
             ON CONFLICT (message_id) DO NOTHING",
        )
        .bind(&id)
        .bind(message_id)
        .bind(ai_channel_id)
        .bind(prompt)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.find_by_message(message_id).await?.ok_or_else(|| {
            StoreError::CorruptRow(format!("ai attempt for {} missing after insert", message_id))
        })
    }

    pub async fn get(&self, id: &str) -> Result<Option<AiAttempt>> {
        let row = sqlx::query(&format!("SELECT {} FROM message_ai WHERE id = ?", COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(parse_row).transpose()
    }

    pub async fn find_by_message(&self, message_id: &str) -> Result<Option<AiAttempt>> {
        let row = sqlx::query(&format!("SELECT {} FROM message_ai WHERE message_id = ?", COLUMNS))
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(parse_row).transpose()
    }

    /// Failed AI attempts with retry budget remaining.
    pub async fn find_failed_with_budget(
        &self,
        max_retries: i32,
        limit: i64,
    ) -> Result<Vec<AiAttempt>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM message_ai WHERE status = 'failed' AND retry_count < ? \
             ORDER BY updated_at ASC LIMIT ?",
            COLUMNS
        ))
        .bind(max_retries)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(parse_row).collect()
    }

    /// AI attempts stuck in `processing` longer than `threshold`.
    pub async fn find_stuck(&self, threshold: Duration, limit: i64) -> Result<Vec<AiAttempt>> {
        let cutoff = to_ts(Utc::now() - threshold);
        let rows = sqlx::query(&format!(
            "SELECT {} FROM message_ai WHERE status = 'processing' AND updated_at < ? \
             ORDER BY updated_at ASC LIMIT ?",
            COLUMNS
        ))
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(parse_row).collect()
    }

    /// Conditionally transition `from -> to`, applying `update` atomically.
    /// Rejected when the current status differs or the row reached `success`.
    pub async fn compare_and_set_status(
        &self,
        id: &str,
        from: AiAttemptStatus,
        to: AiAttemptStatus,
        update: AiAttemptUpdate,
    ) -> Result<bool> {
        if from.is_terminal() {
            return Ok(false);
        }

        let mut sets = vec!["status = ?".to_string(), "updated_at = ?".to_string()];
        if update.error.is_some() {
            sets.push("error = ?".to_string());
        }
        if update.result.is_some() {
            sets.push("result = ?".to_string());
        }
        if update.processed_at.is_some() {
            sets.push("processed_at = ?".to_string());
        }
        if update.retry_count.is_some() {
            sets.push("retry_count = ?".to_string());
        } else if update.increment_retry {
            sets.push("retry_count = retry_count + 1".to_string());
        }

        let sql = format!(
            "UPDATE message_ai SET {} WHERE id = ? AND status = ?",
            sets.join(", ")
        );

        let mut query = sqlx::query(&sql).bind(to.as_str()).bind(now_ts());
        if let Some(error) = &update.error {
            query = query.bind(error.clone());
        }
        if let Some(result) = &update.result {
            query = query.bind(result.clone());
        }
        if let Some(processed_at) = update.processed_at {
            query = query.bind(to_ts(processed_at));
        }
        if let Some(retry_count) = update.retry_count {
            query = query.bind(retry_count);
        }
        let result = query.bind(id).bind(from.as_str()).execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn count_by_status(&self) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM message_ai GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| (row.get("status"), row.get::<i64, _>("n")))
            .collect())
    }
}

fn parse_row(row: &sqlx::sqlite::SqliteRow) -> Result<AiAttempt> {
    let status: String = row.get("status");

    Ok(AiAttempt {
        id: row.get("id"),
        message_id: row.get("message_id"),
        ai_channel_id: row.get("ai_channel_id"),
        prompt: row.get("prompt"),
        result: row.try_get("result").ok().flatten(),
        status: AiAttemptStatus::parse(&status)
            .ok_or_else(|| StoreError::CorruptRow(format!("bad ai status {:?}", status)))?,
        error: row.try_get("error").ok().flatten(),
        processed_at: parse_opt_ts(row.try_get("processed_at").ok().flatten())?,
        retry_count: row.get::<i64, _>("retry_count") as i32,
        created_at: parse_ts(row.get("created_at"))?,
        updated_at: parse_ts(row.get("updated_at"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai_channels::NewAiChannel;
    use crate::credentials::NewCredential;
    use crate::messages::NewMessage;
    use crate::Store;

    async fn seeded() -> (Store, String, String) {
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
        let msg = store
            .messages()
            .create(NewMessage {
                api_token_id: cred.id,
                title: None,
                content: Some("body".to_string()),
                url: None,
            })
            .await
            .unwrap();
        let ai = store
            .ai_channels()
            .create(NewAiChannel {
                name: "a".to_string(),
                api_url: "http://example.com/v1/chat/completions".to_string(),
                model: "m".to_string(),
                params: None,
                headers: None,
                placeholders: None,
                prompt: Some("Summarize.".to_string()),
                proxy: None,
            })
            .await
            .unwrap();

        (store, msg.id, ai.id)
    }

    #[tokio::test]
    async fn test_one_attempt_per_message() {
        let (store, msg_id, ai_id) = seeded().await;
        let repo = store.ai_attempts();

        let first = repo.create(&msg_id, &ai_id, "Summarize.").await.unwrap();
        let second = repo.create(&msg_id, &ai_id, "other prompt").await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.prompt, "Summarize.");
    }

    #[tokio::test]
    async fn test_result_latch() {
        let (store, msg_id, ai_id) = seeded().await;
        let repo = store.ai_attempts();
        let attempt = repo.create(&msg_id, &ai_id, "Summarize.").await.unwrap();

        assert!(repo
            .compare_and_set_status(
                &attempt.id,
                AiAttemptStatus::Waiting,
                AiAttemptStatus::Processing,
                AiAttemptUpdate::default(),
            )
            .await
            .unwrap());
        assert!(repo
            .compare_and_set_status(
                &attempt.id,
                AiAttemptStatus::Processing,
                AiAttemptStatus::Success,
                AiAttemptUpdate {
                    result: Some("summary".to_string()),
                    processed_at: Some(Utc::now()),
                    error: Some(None),
                    ..Default::default()
                },
            )
            .await
            .unwrap());

        // Terminal: no further transitions
        assert!(!repo
            .compare_and_set_status(
                &attempt.id,
                AiAttemptStatus::Success,
                AiAttemptStatus::Failed,
                AiAttemptUpdate::error("late failure"),
            )
            .await
            .unwrap());

        let done = repo.find_by_message(&msg_id).await.unwrap().unwrap();
        assert_eq!(done.status, AiAttemptStatus::Success);
        assert_eq!(done.result.as_deref(), Some("summary"));
        assert!(done.processed_at.is_some());
    }
}
