//! API credential repository.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use mp_common::{Credential, EntityStatus};

use crate::mapping::{now_ts, parse_opt_json, parse_opt_ts, parse_ts, to_json, to_ts};
use crate::{Result, StoreError};

const COLUMNS: &str =
    "id, name, token, default_channels, default_ai, expires_at, status, created_at, updated_at";

/// Input for creating a credential.
#[derive(Debug, Clone)]
pub struct NewCredential {
    pub name: String,
    pub token: String,
    pub default_channels: Vec<String>,
    pub default_ai: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

pub struct CredentialRepository {
    pool: SqlitePool,
}

impl CredentialRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, input: NewCredential) -> Result<Credential> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = now_ts();

        sqlx::query(
            "INSERT INTO api_tokens (id, name, token, default_channels, default_ai, expires_at, \
             status, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&input.name)
        .bind(&input.token)
        .bind(to_json(&input.default_channels)?)
        .bind(&input.default_ai)
        .bind(input.expires_at.map(to_ts))
        .bind(EntityStatus::Enabled.as_str())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.get(&id)
            .await?
            .ok_or_else(|| StoreError::CorruptRow(format!("credential {} missing after insert", id)))
    }

    pub async fn get(&self, id: &str) -> Result<Option<Credential>> {
        let row = sqlx::query(&format!("SELECT {} FROM api_tokens WHERE id = ?", COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(parse_row).transpose()
    }

    /// Look up a credential by the opaque token value carried on requests.
    pub async fn find_by_token(&self, token: &str) -> Result<Option<Credential>> {
        let row = sqlx::query(&format!("SELECT {} FROM api_tokens WHERE token = ?", COLUMNS))
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(parse_row).transpose()
    }

    pub async fn set_status(&self, id: &str, status: EntityStatus) -> Result<bool> {
        let result = sqlx::query("UPDATE api_tokens SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now_ts())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn set_expiry(&self, id: &str, expires_at: Option<DateTime<Utc>>) -> Result<bool> {
        let result = sqlx::query("UPDATE api_tokens SET expires_at = ?, updated_at = ? WHERE id = ?")
            .bind(expires_at.map(to_ts))
            .bind(now_ts())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM api_tokens WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

fn parse_row(row: &sqlx::sqlite::SqliteRow) -> Result<Credential> {
    let status: String = row.get("status");

    Ok(Credential {
        id: row.get("id"),
        name: row.get("name"),
        token: row.get("token"),
        default_channels: parse_opt_json(row.try_get("default_channels").ok().flatten())?
            .unwrap_or_default(),
        default_ai: row.try_get("default_ai").ok().flatten(),
        expires_at: parse_opt_ts(row.try_get("expires_at").ok().flatten())?,
        status: EntityStatus::parse(&status)
            .ok_or_else(|| StoreError::CorruptRow(format!("bad status {:?}", status)))?,
        created_at: parse_ts(row.get("created_at"))?,
        updated_at: parse_ts(row.get("updated_at"))?,
    })
}
