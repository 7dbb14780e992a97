//! MessagePusher Store
//!
//! Embedded SQLite persistence for messages, per-channel delivery attempts,
//! AI attempts, templates, credentials and system configuration. Every
//! repository operation is individually transactional; attempt status
//! transitions go through a compare-and-set primitive so concurrent workers
//! serialise on the row's current status.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

pub mod error;
mod mapping;
mod schema;

pub mod ai_attempts;
pub mod ai_channels;
pub mod attempts;
pub mod channels;
pub mod credentials;
pub mod messages;
pub mod system_config;

pub use ai_attempts::{AiAttemptRepository, AiAttemptUpdate};
pub use ai_channels::AiChannelRepository;
pub use attempts::{AttemptRepository, AttemptUpdate};
pub use channels::ChannelRepository;
pub use credentials::CredentialRepository;
pub use error::StoreError;
pub use messages::{DailyCount, MessageRepository};
pub use system_config::SystemConfigRepository;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Handle over the SQLite pool exposing the per-table repositories.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) the store file at `path`.
    pub async fn open<P: AsRef<Path>>(path: P, max_connections: u32) -> Result<Self> {
        if let Some(dir) = path.as_ref().parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)
                    .map_err(|e| StoreError::Io(format!("create {}: {}", dir.display(), e)))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        info!(path = %path.as_ref().display(), "Opened SQLite store");
        Ok(Self::new(pool))
    }

    /// Open an in-memory store (tests and development).
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(StoreError::Database)?
            .foreign_keys(true);

        // A single connection keeps every caller on the same in-memory DB.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the schema if absent and seed the default system_config rows.
    pub async fn init_schema(&self) -> Result<()> {
        schema::create_tables(&self.pool).await?;
        schema::seed_system_config(&self.pool).await?;
        info!("Store schema initialized");
        Ok(())
    }

    /// Reclaim space and refresh the query planner statistics.
    pub async fn vacuum_analyze(&self) -> Result<()> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        sqlx::query("ANALYZE").execute(&self.pool).await?;
        info!("Store maintenance (VACUUM + ANALYZE) complete");
        Ok(())
    }

    pub fn channels(&self) -> ChannelRepository {
        ChannelRepository::new(self.pool.clone())
    }

    pub fn ai_channels(&self) -> AiChannelRepository {
        AiChannelRepository::new(self.pool.clone())
    }

    pub fn credentials(&self) -> CredentialRepository {
        CredentialRepository::new(self.pool.clone())
    }

    pub fn messages(&self) -> MessageRepository {
        MessageRepository::new(self.pool.clone())
    }

    pub fn attempts(&self) -> AttemptRepository {
        AttemptRepository::new(self.pool.clone())
    }

    pub fn ai_attempts(&self) -> AiAttemptRepository {
        AiAttemptRepository::new(self.pool.clone())
    }

    pub fn system_config(&self) -> SystemConfigRepository {
        SystemConfigRepository::new(self.pool.clone())
    }
}
