//! Schema migrations for the embedded database backend

use rusqlite::{Connection, OptionalExtension, Result};
use tracing::{error, info, warn};

use super::schema::{DatabaseStats, MIGRATIONS};

pub struct MigrationManager<'a> {
    conn: &'a mut Connection,
}

impl<'a> MigrationManager<'a> {
    pub fn new(conn: &'a mut Connection) -> Self {
        Self { conn }
    }

    pub fn initialize_database(&mut self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        let current_version = self.get_current_version()?;
        info!("Current kv schema version: {}", current_version);
        self.apply_migrations(current_version)
    }

    fn apply_migrations(&mut self, current_version: i32) -> Result<()> {
        for (version, sql) in MIGRATIONS.iter().filter(|(v, _)| *v > current_version) {
            info!("Applying migration {}...", version);
            let tx = self.conn.transaction()?;
            if let Err(e) = tx.execute_batch(sql) {
                error!("Failed to apply migration {}: {}", version, e);
                return Err(e);
            }
            tx.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
            tx.commit()?;
        }
        Ok(())
    }

    pub fn get_current_version(&self) -> Result<i32> {
        self.conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .or(Ok(0))
    }

    pub fn has_migration_applied(&self, version: i32) -> Result<bool> {
        self.conn
            .query_row(
                "SELECT 1 FROM schema_version WHERE version = ?",
                [version],
                |_| Ok(1),
            )
            .optional()
            .map(|row| row.is_some())
    }
}

pub fn get_database_stats(conn: &Connection) -> Result<DatabaseStats> {
    fn count(conn: &Connection, sql: &str) -> i64 {
        conn.query_row(sql, [], |row| row.get(0)).unwrap_or_else(|e| {
            warn!("Stats query failed ({}): {}", sql, e);
            0
        })
    }

    Ok(DatabaseStats {
        total_keys: count(conn, "SELECT COUNT(*) FROM kv_store"),
        total_backups: count(conn, "SELECT COUNT(*) FROM kv_backups"),
        value_bytes: count(conn, "SELECT COALESCE(SUM(LENGTH(value)), 0) FROM kv_store"),
        database_size_bytes: count(
            conn,
            "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        MigrationManager::new(&mut conn).initialize_database().unwrap();
        MigrationManager::new(&mut conn).initialize_database().unwrap();

        let manager = MigrationManager::new(&mut conn);
        assert_eq!(manager.get_current_version().unwrap(), 2);
        assert!(manager.has_migration_applied(1).unwrap());
        assert!(!manager.has_migration_applied(3).unwrap());
    }

    #[test]
    fn test_stats_on_empty_database() {
        let mut conn = Connection::open_in_memory().unwrap();
        MigrationManager::new(&mut conn).initialize_database().unwrap();
        let stats = get_database_stats(&conn).unwrap();
        assert_eq!(stats.total_keys, 0);
        assert_eq!(stats.value_bytes, 0);
    }
}
