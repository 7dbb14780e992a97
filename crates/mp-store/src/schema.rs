//! Schema creation and first-init seeding.

use sqlx::SqlitePool;

use crate::Result;

const TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS channels (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        api_url TEXT NOT NULL,
        method TEXT NOT NULL,
        content_type TEXT NOT NULL,
        params TEXT NOT NULL,
        headers TEXT,
        placeholders TEXT,
        proxy TEXT,
        max_length INTEGER NOT NULL DEFAULT 2000,
        status TEXT NOT NULL DEFAULT 'enabled',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ai_channels (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        api_url TEXT NOT NULL,
        method TEXT NOT NULL DEFAULT 'POST',
        model TEXT NOT NULL,
        params TEXT,
        headers TEXT,
        placeholders TEXT,
        prompt TEXT,
        proxy TEXT,
        status TEXT NOT NULL DEFAULT 'enabled',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS api_tokens (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        token TEXT NOT NULL UNIQUE,
        default_channels TEXT,
        default_ai TEXT,
        expires_at TEXT,
        status TEXT NOT NULL DEFAULT 'enabled',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY,
        api_token_id TEXT NOT NULL,
        title TEXT,
        content TEXT,
        url TEXT,
        url_content TEXT,
        file_storage TEXT,
        view_token TEXT NOT NULL UNIQUE,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        FOREIGN KEY (api_token_id) REFERENCES api_tokens (id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS message_channels (
        id TEXT PRIMARY KEY,
        message_id TEXT NOT NULL,
        channel_id TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'waiting',
        error TEXT,
        sent_at TEXT,
        retry_count INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (message_id, channel_id),
        FOREIGN KEY (message_id) REFERENCES messages (id) ON DELETE CASCADE,
        FOREIGN KEY (channel_id) REFERENCES channels (id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS message_ai (
        id TEXT PRIMARY KEY,
        message_id TEXT NOT NULL,
        ai_channel_id TEXT NOT NULL,
        prompt TEXT NOT NULL,
        result TEXT,
        status TEXT NOT NULL DEFAULT 'waiting',
        error TEXT,
        processed_at TEXT,
        retry_count INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (message_id),
        FOREIGN KEY (message_id) REFERENCES messages (id) ON DELETE CASCADE,
        FOREIGN KEY (ai_channel_id) REFERENCES ai_channels (id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS system_config (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        description TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
];

const INDICES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_api_tokens_token ON api_tokens (token)",
    "CREATE INDEX IF NOT EXISTS idx_messages_api_token_id ON messages (api_token_id)",
    "CREATE INDEX IF NOT EXISTS idx_messages_created_at ON messages (created_at)",
    "CREATE INDEX IF NOT EXISTS idx_message_channels_message_id ON message_channels (message_id)",
    "CREATE INDEX IF NOT EXISTS idx_message_channels_channel_id ON message_channels (channel_id)",
    "CREATE INDEX IF NOT EXISTS idx_message_channels_status ON message_channels (status)",
    "CREATE INDEX IF NOT EXISTS idx_message_ai_message_id ON message_ai (message_id)",
    "CREATE INDEX IF NOT EXISTS idx_message_ai_ai_channel_id ON message_ai (ai_channel_id)",
    "CREATE INDEX IF NOT EXISTS idx_message_ai_status ON message_ai (status)",
];

/// Default system_config rows inserted at first init.
const SEED_CONFIG: &[(&str, &str, &str)] = &[
    ("version", "1.0.0", "system version"),
    ("max_retry_count", "3", "message dispatch retry budget"),
    ("retry_interval", "300", "failed dispatch retry interval (seconds)"),
    ("file_storage_path", "data/files", "file storage path"),
    ("file_retention_days", "30", "file retention (days)"),
    ("default_max_length", "2000", "default maximum message length"),
];

pub async fn create_tables(pool: &SqlitePool) -> Result<()> {
    for ddl in TABLES {
        sqlx::query(ddl).execute(pool).await?;
    }
    for ddl in INDICES {
        sqlx::query(ddl).execute(pool).await?;
    }
    Ok(())
}

pub async fn seed_system_config(pool: &SqlitePool) -> Result<()> {
    let now = crate::mapping::now_ts();
    for (key, value, description) in SEED_CONFIG {
        sqlx::query(
            "INSERT OR IGNORE INTO system_config (key, value, description, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(key)
        .bind(value)
        .bind(description)
        .bind(&now)
        .bind(&now)
        .execute(pool)
        .await?;
    }
    Ok(())
}
