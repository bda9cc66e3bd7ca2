//! Embedded database schema for the key/blob backend
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseStats {
    pub total_keys: i64,
    pub total_backups: i64,
    pub value_bytes: i64,
    pub database_size_bytes: i64,
}

pub const KV_STORE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY NOT NULL,
    value BLOB NOT NULL,
    updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
"#;

pub const KV_BACKUPS_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS kv_backups (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    key TEXT NOT NULL,
    value BLOB NOT NULL,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
CREATE INDEX IF NOT EXISTS idx_kv_backups_key ON kv_backups(key, id DESC);
"#;

/// Ordered `(version, sql)` pairs applied by the migration manager.
pub const MIGRATIONS: &[(i32, &str)] = &[(1, KV_STORE_SQL), (2, KV_BACKUPS_SQL)];
