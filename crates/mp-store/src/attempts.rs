//! Per-(message, channel) delivery attempt repository.
//!
//! Status transitions go through `compare_and_set_status`, the only writer of
//! `message_channels.status` after creation. The update only applies when the
//! row's current status equals the expected one, so exactly one of several
//! racing workers wins each transition, and a row that has reached `success`
//! is never rewritten.

use chrono::{DateTime, Duration, Utc};
use sqlx::{Row, SqlitePool};

use mp_common::{AttemptStatus, ChannelAttempt};

use crate::mapping::{now_ts, parse_opt_ts, parse_ts, to_ts};
use crate::{Result, StoreError};

const COLUMNS: &str = "id, message_id, channel_id, status, error, sent_at, retry_count, \
                       created_at, updated_at";

/// Extra fields applied together with a status transition.
#[derive(Debug, Clone, Default)]
pub struct AttemptUpdate {
    /// `Some(None)` clears the stored error.
    pub error: Option<Option<String>>,
    pub sent_at: Option<DateTime<Utc>>,
    /// Absolute retry count (used to exhaust the budget on permanent failures).
    pub retry_count: Option<i32>,
    /// Increment the retry count by one as part of the transition.
    pub increment_retry: bool,
}

impl AttemptUpdate {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(Some(message.into())),
            ..Default::default()
        }
    }
}

pub struct AttemptRepository {
    pool: SqlitePool,
}

impl AttemptRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the `(message, channel)` attempt row in `waiting` state.
    /// Idempotent: an existing pair is returned untouched.
    pub async fn create(&self, message_id: &str, channel_id: &str) -> Result<ChannelAttempt> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = now_ts();

        sqlx::query(
            "INSERT INTO message_channels (id, message_id, channel_id, status, retry_count, \
             created_at, updated_at) VALUES (?, ?, ?, 'waiting', 0, ?, ?) \
             ON CONFLICT (message_id, channel_id) DO NOTHING",
        )
        .bind(&id)
        .bind(message_id)
        .bind(channel_id)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.find_one(message_id, channel_id).await?.ok_or_else(|| {
            StoreError::CorruptRow(format!(
                "attempt ({}, {}) missing after insert",
                message_id, channel_id
            ))
        })
    }

    pub async fn get(&self, id: &str) -> Result<Option<ChannelAttempt>> {
        let row = sqlx::query(&format!("SELECT {} FROM message_channels WHERE id = ?", COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(parse_row).transpose()
    }

    pub async fn find_one(
        &self,
        message_id: &str,
        channel_id: &str,
    ) -> Result<Option<ChannelAttempt>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM message_channels WHERE message_id = ? AND channel_id = ?",
            COLUMNS
        ))
        .bind(message_id)
        .bind(channel_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parse_row).transpose()
    }

    pub async fn find_by_message(&self, message_id: &str) -> Result<Vec<ChannelAttempt>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM message_channels WHERE message_id = ? ORDER BY created_at ASC",
            COLUMNS
        ))
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(parse_row).collect()
    }

    /// Attempts of a message ready for dispatch: `waiting`, or `failed` with
    /// retry budget remaining.
    pub async fn find_dispatchable(
        &self,
        message_id: &str,
        max_retries: i32,
    ) -> Result<Vec<ChannelAttempt>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM message_channels WHERE message_id = ? AND \
             (status = 'waiting' OR (status = 'failed' AND retry_count < ?)) \
             ORDER BY created_at ASC",
            COLUMNS
        ))
        .bind(message_id)
        .bind(max_retries)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(parse_row).collect()
    }

    /// Failed attempts with retry budget remaining, across all messages.
    pub async fn find_failed_with_budget(
        &self,
        max_retries: i32,
        limit: i64,
    ) -> Result<Vec<ChannelAttempt>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM message_channels WHERE status = 'failed' AND retry_count < ? \
             ORDER BY updated_at ASC LIMIT ?",
            COLUMNS
        ))
        .bind(max_retries)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(parse_row).collect()
    }

    /// Attempts stuck in `sending` longer than `threshold` (crash recovery).
    pub async fn find_stuck(&self, threshold: Duration, limit: i64) -> Result<Vec<ChannelAttempt>> {
        let cutoff = to_ts(Utc::now() - threshold);
        let rows = sqlx::query(&format!(
            "SELECT {} FROM message_channels WHERE status = 'sending' AND updated_at < ? \
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
    ///
    /// Returns false when the row's current status is not `from` (another
    /// worker won the race) or the row does not exist. Transitions out of
    /// `success` are always rejected.
    pub async fn compare_and_set_status(
        &self,
        id: &str,
        from: AttemptStatus,
        to: AttemptStatus,
        update: AttemptUpdate,
    ) -> Result<bool> {
        if from.is_terminal() {
            return Ok(false);
        }

        let mut sets = vec!["status = ?".to_string(), "updated_at = ?".to_string()];
        if update.error.is_some() {
            sets.push("error = ?".to_string());
        }
        if update.sent_at.is_some() {
            sets.push("sent_at = ?".to_string());
        }
        if update.retry_count.is_some() {
            sets.push("retry_count = ?".to_string());
        } else if update.increment_retry {
            sets.push("retry_count = retry_count + 1".to_string());
        }

        let sql = format!(
            "UPDATE message_channels SET {} WHERE id = ? AND status = ?",
            sets.join(", ")
        );

        let mut query = sqlx::query(&sql).bind(to.as_str()).bind(now_ts());
        if let Some(error) = &update.error {
            query = query.bind(error.clone());
        }
        if let Some(sent_at) = update.sent_at {
            query = query.bind(to_ts(sent_at));
        }
        if let Some(retry_count) = update.retry_count {
            query = query.bind(retry_count);
        }
        let result = query.bind(id).bind(from.as_str()).execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }

    /// Attempt counts per status, for the stats maintenance action.
    pub async fn count_by_status(&self) -> Result<Vec<(String, i64)>> {
        let rows =
            sqlx::query("SELECT status, COUNT(*) AS n FROM message_channels GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .iter()
            .map(|row| (row.get("status"), row.get::<i64, _>("n")))
            .collect())
    }
}

fn parse_row(row: &sqlx::sqlite::SqliteRow) -> Result<ChannelAttempt> {
    let status: String = row.get("status");

    Ok(ChannelAttempt {
        id: row.get("id"),
        message_id: row.get("message_id"),
        channel_id: row.get("channel_id"),
        status: AttemptStatus::parse(&status)
            .ok_or_else(|| StoreError::CorruptRow(format!("bad attempt status {:?}", status)))?,
        error: row.try_get("error").ok().flatten(),
        sent_at: parse_opt_ts(row.try_get("sent_at").ok().flatten())?,
        retry_count: row.get::<i64, _>("retry_count") as i32,
        created_at: parse_ts(row.get("created_at"))?,
        updated_at: parse_ts(row.get("updated_at"))?,
    })
}
