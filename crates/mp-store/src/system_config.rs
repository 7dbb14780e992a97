//! System configuration repository.
//!
//! The authoritative source of tunables at startup: file/env configuration
//! is merged with these rows before components are configured.

use std::collections::HashMap;

use sqlx::{Row, SqlitePool};

use crate::mapping::now_ts;
use crate::Result;

pub struct SystemConfigRepository {
    pool: SqlitePool,
}

impl SystemConfigRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM system_config WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("value")))
    }

    /// Insert or update a config row, refreshing `updated_at`.
    pub async fn set(&self, key: &str, value: &str, description: &str) -> Result<()> {
        let now = now_ts();
        sqlx::query(
            "INSERT INTO system_config (key, value, description, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT (key) DO UPDATE SET value = excluded.value, \
             description = excluded.description, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(description)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_all(&self) -> Result<HashMap<String, String>> {
        let rows = sqlx::query("SELECT key, value FROM system_config")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get("key"), row.get("value")))
            .collect())
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM system_config WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use crate::Store;

    #[tokio::test]
    async fn test_set_and_get_all() {
        let store = Store::open_in_memory().await.unwrap();
        store.init_schema().await.unwrap();
        let repo = store.system_config();

        repo.set("custom_key", "42", "a tunable").await.unwrap();
        assert_eq!(repo.get("custom_key").await.unwrap().as_deref(), Some("42"));

        repo.set("custom_key", "43", "a tunable").await.unwrap();
        assert_eq!(repo.get("custom_key").await.unwrap().as_deref(), Some("43"));

        let all = repo.get_all().await.unwrap();
        assert!(all.len() >= 7);
        assert_eq!(all.get("version").map(String::as_str), Some("1.0.0"));

        assert!(repo.delete("custom_key").await.unwrap());
        assert!(repo.get("custom_key").await.unwrap().is_none());
    }
}
