//! Database migration system

use rusqlite::{Connection, OptionalExtension};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::memory_db::schema;

/// A single schema step; applied only while the stored version is below `version`.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: i32,
    pub name: &'static str,
    pub sql: &'static str,
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("failed to read schema version: {0}")]
    Version(#[source] rusqlite::Error),

    #[error("migration {version} ({name}) failed: {source}")]
    StepFailed {
        version: i32,
        name: &'static str,
        #[source]
        source: rusqlite::Error,
    },
}

/// Manages database schema migrations
pub struct MigrationManager<'a> {
    conn: &'a mut Connection,
}

impl<'a> MigrationManager<'a> {
    /// Create a new migration manager
    pub fn new(conn: &'a mut Connection) -> Self {
        Self { conn }
    }

    /// Bring the schema up to the latest version. Safe to call on every start.
    pub fn initialize_database(&mut self) -> Result<i32, MigrationError> {
        self.apply_migrations(MIGRATIONS)
    }

    /// Apply every step newer than the stored version, each in its own transaction.
    /// The version row is written inside the step's transaction, so a failed step
    /// leaves the version where it was.
    pub fn apply_migrations(&mut self, migrations: &[Migration]) -> Result<i32, MigrationError> {
        self.conn
            .execute(
                "CREATE TABLE IF NOT EXISTS schema_version (
                    version INTEGER PRIMARY KEY,
                    applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
                )",
                [],
            )
            .map_err(MigrationError::Version)?;

        let mut current_version = self.get_current_version()?;
        info!("Current database schema version: {}", current_version);

        for migration in migrations {
            if migration.version <= current_version {
                continue;
            }
            info!("Applying migration {} ({})...", migration.version, migration.name);

            let step_failed = |source: rusqlite::Error| MigrationError::StepFailed {
                version: migration.version,
                name: migration.name,
                source,
            };

            let tx = self.conn.transaction().map_err(step_failed)?;
            if let Err(e) = tx.execute_batch(migration.sql) {
                error!("Failed to apply migration {}: {}", migration.version, e);
                // dropping `tx` rolls the step back
                return Err(step_failed(e));
            }
            tx.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                [migration.version],
            )
            .map_err(step_failed)?;
            tx.commit().map_err(step_failed)?;

            current_version = migration.version;
            info!("Migration {} applied successfully", migration.version);
        }

        Ok(current_version)
    }

    /// Get current schema version
    pub fn get_current_version(&self) -> Result<i32, MigrationError> {
        self.conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .map_err(MigrationError::Version)
    }

    /// Check if a specific migration has been applied
    pub fn has_migration_applied(&self, version: i32) -> Result<bool, MigrationError> {
        self.conn
            .query_row(
                "SELECT 1 FROM schema_version WHERE version = ?1",
                [version],
                |_| Ok(1),
            )
            .optional()
            .map(|result| result.is_some())
            .map_err(MigrationError::Version)
    }
}

/// Every schema step, in order.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial",
        sql: include_str!("migrations/001_initial.sql"),
    },
    Migration {
        version: 2,
        name: "full_text_index",
        sql: include_str!("migrations/002_full_text_index.sql"),
    },
];

/// Get database statistics from a connection
pub fn get_database_stats(conn: &Connection) -> rusqlite::Result<schema::DatabaseStats> {
    fn get_count(conn: &Connection, sql: &str) -> rusqlite::Result<i64> {
        conn.query_row(sql, [], |row| row.get(0)).or_else(|e| {
            warn!("Failed to run count query '{}': {}", sql, e);
            Ok(0)
        })
    }

    let schema_version: i32 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| row.get(0))
        .unwrap_or(0);

    let database_size_bytes: i64 = conn
        .query_row(
            "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    Ok(schema::DatabaseStats {
        total_sessions: get_count(conn, "SELECT COUNT(*) FROM sessions")?,
        total_messages: get_count(conn, "SELECT COUNT(*) FROM messages")?,
        total_facts: get_count(conn, "SELECT COUNT(*) FROM memories")?,
        active_facts: get_count(conn, "SELECT COUNT(*) FROM memories WHERE superseded_by IS NULL")?,
        schema_version,
        database_size_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT 1 FROM sqlite_master WHERE name = ?1",
            [name],
            |_| Ok(()),
        )
        .optional()
        .unwrap()
        .is_some()
    }

    #[test]
    fn test_initialize_fresh_database() {
        let mut conn = Connection::open_in_memory().unwrap();
        let version = MigrationManager::new(&mut conn).initialize_database().unwrap();

        assert_eq!(version, 2);
        for table in ["sessions", "messages", "memories", "messages_fts", "memories_fts"] {
            assert!(table_exists(&conn, table), "missing table {}", table);
        }
    }

    #[test]
    fn test_initialize_twice_applies_nothing_new() {
        let mut conn = Connection::open_in_memory().unwrap();
        MigrationManager::new(&mut conn).initialize_database().unwrap();
        let version = MigrationManager::new(&mut conn).initialize_database().unwrap();

        assert_eq!(version, 2);
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 2);
    }

    #[test]
    fn test_failed_step_does_not_advance_version() {
        let mut conn = Connection::open_in_memory().unwrap();
        let mut migrator = MigrationManager::new(&mut conn);
        migrator.initialize_database().unwrap();

        let broken = [
            MIGRATIONS[0],
            MIGRATIONS[1],
            Migration {
                version: 3,
                name: "broken",
                sql: "CREATE TABLE extra (id INTEGER); THIS IS NOT SQL;",
            },
        ];
        let err = migrator.apply_migrations(&broken).unwrap_err();
        assert!(matches!(err, MigrationError::StepFailed { version: 3, .. }));

        assert_eq!(migrator.get_current_version().unwrap(), 2);
        assert!(!migrator.has_migration_applied(3).unwrap());
        assert!(!table_exists(&conn, "extra"));
    }

    #[test]
    fn test_stats_on_empty_store() {
        let mut conn = Connection::open_in_memory().unwrap();
        MigrationManager::new(&mut conn).initialize_database().unwrap();
        let stats = get_database_stats(&conn).unwrap();

        assert_eq!(stats.total_sessions, 0);
        assert_eq!(stats.active_facts, 0);
        assert_eq!(stats.schema_version, 2);
    }
}
