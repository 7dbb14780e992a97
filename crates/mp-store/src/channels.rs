//! Channel template repository.

use indexmap::IndexMap;
use sqlx::{Row, SqlitePool};

use mp_common::{
    BodyEncoding, ChannelTemplate, EntityStatus, HttpMethod, ProxyConfig, DEFAULT_MAX_LENGTH,
};

use crate::mapping::{now_ts, parse_opt_json, parse_ts, to_json, to_opt_json};
use crate::{Result, StoreError};

const COLUMNS: &str = "id, name, api_url, method, content_type, params, headers, placeholders, \
                       proxy, max_length, status, created_at, updated_at";

/// Input for creating a channel template.
#[derive(Debug, Clone)]
pub struct NewChannel {
    pub name: String,
    pub api_url: String,
    pub method: HttpMethod,
    pub content_type: BodyEncoding,
    pub params: IndexMap<String, serde_json::Value>,
    pub headers: Option<IndexMap<String, String>>,
    pub placeholders: Option<IndexMap<String, String>>,
    pub proxy: Option<ProxyConfig>,
    pub max_length: Option<u32>,
}

pub struct ChannelRepository {
    pool: SqlitePool,
}

impl ChannelRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, input: NewChannel) -> Result<ChannelTemplate> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = now_ts();

        sqlx::query(
            "INSERT INTO channels (id, name, api_url, method, content_type, params, headers, \
             placeholders, proxy, max_length, status, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&input.name)
        .bind(&input.api_url)
        .bind(input.method.as_str())
        .bind(input.content_type.as_str())
        .bind(to_json(&input.params)?)
        .bind(to_opt_json(&input.headers)?)
        .bind(to_opt_json(&input.placeholders)?)
        .bind(to_opt_json(&input.proxy)?)
        .bind(input.max_length.unwrap_or(DEFAULT_MAX_LENGTH) as i64)
        .bind(EntityStatus::Enabled.as_str())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.get(&id)
            .await?
            .ok_or_else(|| StoreError::CorruptRow(format!("channel {} missing after insert", id)))
    }

    pub async fn get(&self, id: &str) -> Result<Option<ChannelTemplate>> {
        let row = sqlx::query(&format!("SELECT {} FROM channels WHERE id = ?", COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(parse_row).transpose()
    }

    pub async fn list(&self) -> Result<Vec<ChannelTemplate>> {
        let rows = sqlx::query(&format!("SELECT {} FROM channels ORDER BY created_at ASC", COLUMNS))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(parse_row).collect()
    }

    pub async fn set_status(&self, id: &str, status: EntityStatus) -> Result<bool> {
        let result = sqlx::query("UPDATE channels SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now_ts())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM channels WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

fn parse_row(row: &sqlx::sqlite::SqliteRow) -> Result<ChannelTemplate> {
    let method: String = row.get("method");
    let content_type: String = row.get("content_type");
    let status: String = row.get("status");
    let params: String = row.get("params");

    Ok(ChannelTemplate {
        id: row.get("id"),
        name: row.get("name"),
        api_url: row.get("api_url"),
        method: HttpMethod::parse(&method)
            .ok_or_else(|| StoreError::CorruptRow(format!("bad method {:?}", method)))?,
        content_type: BodyEncoding::parse(&content_type)
            .ok_or_else(|| StoreError::CorruptRow(format!("bad content_type {:?}", content_type)))?,
        params: serde_json::from_str(&params)?,
        headers: parse_opt_json(row.try_get("headers").ok().flatten())?,
        placeholders: parse_opt_json(row.try_get("placeholders").ok().flatten())?,
        proxy: parse_opt_json(row.try_get("proxy").ok().flatten())?,
        max_length: row.get::<i64, _>("max_length") as u32,
        status: EntityStatus::parse(&status)
            .ok_or_else(|| StoreError::CorruptRow(format!("bad status {:?}", status)))?,
        created_at: parse_ts(row.get("created_at"))?,
        updated_at: parse_ts(row.get("updated_at"))?,
    })
}
