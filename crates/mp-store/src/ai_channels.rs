//! AI channel template repository.

use indexmap::IndexMap;
use sqlx::{Row, SqlitePool};

use mp_common::{AiChannelTemplate, EntityStatus, ProxyConfig};

use crate::mapping::{now_ts, parse_opt_json, parse_ts, to_opt_json};
use crate::{Result, StoreError};

const COLUMNS: &str = "id, name, api_url, model, params, headers, placeholders, prompt, proxy, \
                       status, created_at, updated_at";

/// Input for creating an AI channel template. Dispatch is always POST/JSON.
#[derive(Debug, Clone)]
pub struct NewAiChannel {
    pub name: String,
    pub api_url: String,
    pub model: String,
    pub params: Option<IndexMap<String, serde_json::Value>>,
    pub headers: Option<IndexMap<String, String>>,
    pub placeholders: Option<IndexMap<String, String>>,
    pub prompt: Option<String>,
    pub proxy: Option<ProxyConfig>,
}

pub struct AiChannelRepository {
    pool: SqlitePool,
}

impl AiChannelRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, input: NewAiChannel) -> Result<AiChannelTemplate> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = now_ts();

        sqlx::query(
            "INSERT INTO ai_channels (id, name, api_url, method, model, params, headers, \
             placeholders, prompt, proxy, status, created_at, updated_at) \
             VALUES (?, ?, ?, 'POST', ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&input.name)
        .bind(&input.api_url)
        .bind(&input.model)
        .bind(to_opt_json(&input.params)?)
        .bind(to_opt_json(&input.headers)?)
        .bind(to_opt_json(&input.placeholders)?)
        .bind(&input.prompt)
        .bind(to_opt_json(&input.proxy)?)
        .bind(EntityStatus::Enabled.as_str())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.get(&id)
            .await?
            .ok_or_else(|| StoreError::CorruptRow(format!("ai_channel {} missing after insert", id)))
    }

    pub async fn get(&self, id: &str) -> Result<Option<AiChannelTemplate>> {
        let row = sqlx::query(&format!("SELECT {} FROM ai_channels WHERE id = ?", COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(parse_row).transpose()
    }

    pub async fn list(&self) -> Result<Vec<AiChannelTemplate>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM ai_channels ORDER BY created_at ASC",
            COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(parse_row).collect()
    }

    pub async fn set_status(&self, id: &str, status: EntityStatus) -> Result<bool> {
        let result = sqlx::query("UPDATE ai_channels SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now_ts())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM ai_channels WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

fn parse_row(row: &sqlx::sqlite::SqliteRow) -> Result<AiChannelTemplate> {
    let status: String = row.get("status");

    Ok(AiChannelTemplate {
        id: row.get("id"),
        name: row.get("name"),
        api_url: row.get("api_url"),
        model: row.get("model"),
        params: parse_opt_json(row.try_get("params").ok().flatten())?,
        headers: parse_opt_json(row.try_get("headers").ok().flatten())?,
        placeholders: parse_opt_json(row.try_get("placeholders").ok().flatten())?,
        prompt: row.try_get("prompt").ok().flatten(),
        proxy: parse_opt_json(row.try_get("proxy").ok().flatten())?,
        status: EntityStatus::parse(&status)
            .ok_or_else(|| StoreError::CorruptRow(format!("bad status {:?}", status)))?,
        created_at: parse_ts(row.get("created_at"))?,
        updated_at: parse_ts(row.get("updated_at"))?,
    })
}
