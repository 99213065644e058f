//! Memory database module - SQLite-based storage for sessions, messages and facts,
//! with a full-text index kept in step with every write.
pub mod schema;
pub mod migration;
pub mod conversation_store;
pub mod fact_store;
pub mod search_index;
pub use schema::*;
pub use migration::{MigrationError, MigrationManager};
pub use conversation_store::ConversationStore;
pub use fact_store::FactStore;
pub use search_index::{merge_ranked, Fts5Index, FullTextIndex};
use anyhow::Context;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The relational store: one pool shared by the session, message and fact
/// stores and by the search index.
pub struct MemoryDatabase {
    pub conversations: ConversationStore,
    pub facts: FactStore,
    index: Arc<dyn FullTextIndex>,
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl MemoryDatabase {
    /// Open (or create) the database file and run pending migrations.
    /// A migration failure is returned and the database is not usable.
    pub fn new(db_path: &Path) -> anyhow::Result<Self> {
        info!("Opening memory database at: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let manager = SqliteConnectionManager::file(db_path)
            .with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
            )
            .with_init(|conn| {
                conn.execute_batch(
                    "PRAGMA foreign_keys = ON;
                     PRAGMA journal_mode = WAL;
                     PRAGMA synchronous = NORMAL;
                     PRAGMA busy_timeout = 5000;",
                )
            });
        let pool = Pool::builder()
            .max_size(4)
            .build(manager)
            .map_err(|e| anyhow::anyhow!("Failed to create connection pool: {}", e))?;

        Self::from_pool(pool, Arc::new(Fts5Index::new()))
    }

    /// A private in-memory database. It lives on a single pooled connection that
    /// is never recycled, so every caller sees the same data.
    pub fn new_in_memory() -> anyhow::Result<Self> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));
        let pool = Pool::builder()
            .max_size(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .build(manager)
            .map_err(|e| anyhow::anyhow!("Failed to create connection pool: {}", e))?;

        Self::from_pool(pool, Arc::new(Fts5Index::new()))
    }

    fn from_pool(
        pool: Pool<SqliteConnectionManager>,
        index: Arc<dyn FullTextIndex>,
    ) -> anyhow::Result<Self> {
        {
            let mut conn = pool.get()?;
            let mut migrator = MigrationManager::new(&mut conn);
            let version = migrator
                .initialize_database()
                .context("Memory database migration failed")?;
            debug!("Schema at version {}", version);
        }
        let pool = Arc::new(pool);
        info!("Memory database initialized successfully");
        Ok(Self {
            conversations: ConversationStore::new(Arc::clone(&pool), Arc::clone(&index)),
            facts: FactStore::new(Arc::clone(&pool), Arc::clone(&index)),
            index,
            pool,
        })
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    /// Ranked message hits. Queries the index cannot run yield no results.
    pub fn search_messages(&self, query: &str, limit: usize) -> anyhow::Result<Vec<SearchResult>> {
        let conn = self.get_conn()?;
        Ok(self.index.search_messages(&conn, query, limit).unwrap_or_else(|e| {
            warn!("Message search for '{}' failed: {}", query, e);
            Vec::new()
        }))
    }

    /// Ranked hits over active facts. Queries the index cannot run yield no results.
    pub fn search_facts(&self, query: &str, limit: usize) -> anyhow::Result<Vec<SearchResult>> {
        let conn = self.get_conn()?;
        Ok(self.index.search_facts(&conn, query, limit).unwrap_or_else(|e| {
            warn!("Fact search for '{}' failed: {}", query, e);
            Vec::new()
        }))
    }

    /// Facts and messages merged by rank, at most `limit` results.
    pub fn search(&self, query: &str, limit: usize) -> anyhow::Result<Vec<SearchResult>> {
        let facts = self.search_facts(query, limit)?;
        let messages = self.search_messages(query, limit)?;
        let results = merge_ranked(facts, messages, limit);
        debug!("Search '{}' returned {} result(s)", query, results.len());
        Ok(results)
    }

    pub fn get_stats(&self) -> anyhow::Result<DatabaseStats> {
        let conn = self.get_conn()?;
        Ok(migration::get_database_stats(&conn)?)
    }
}

impl Drop for MemoryDatabase {
    fn drop(&mut self) {
        if let Ok(conn) = self.pool.get() {
            let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Message;
    use chrono::Utc;

    fn db_with_session(id: &str) -> MemoryDatabase {
        let db = MemoryDatabase::new_in_memory().unwrap();
        db.conversations.create_session(id, Some("Test"), Utc::now()).unwrap();
        db
    }

    #[test]
    fn test_search_empty_store() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        assert!(db.search("anything", 10).unwrap().is_empty());
        assert!(db.search("", 10).unwrap().is_empty());
        assert!(db.search("\"unbalanced (", 10).unwrap().is_empty());
    }

    #[test]
    fn test_message_search_finds_inserted_message() {
        let db = db_with_session("session_20261016_001");
        db.conversations
            .insert_message("session_20261016_001", &Message::user("I want to go skiing in Utah"), None)
            .unwrap();
        db.conversations
            .insert_message("session_20261016_001", &Message::assistant("Utah has great powder"), None)
            .unwrap();

        let results = db.search_messages("skiing", 10).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source, SearchSource::Message);
        assert_eq!(results[0].session_id.as_deref(), Some("session_20261016_001"));
        assert_eq!(results[0].session_title.as_deref(), Some("Test"));
        assert!(results[0].timestamp.is_some());
    }

    #[test]
    fn test_merged_search_is_limited_and_ordered() {
        let db = db_with_session("session_20261016_001");
        for i in 0..5 {
            db.conversations
                .insert_message(
                    "session_20261016_001",
                    &Message::user(format!("coffee note {} about coffee beans", i)),
                    None,
                )
                .unwrap();
            db.facts
                .insert_fact(&format!("Jamie drinks coffee {}", i), None, None)
                .unwrap();
        }

        let results = db.search("coffee", 4).unwrap();
        assert_eq!(results.len(), 4);
        assert!(results.windows(2).all(|w| w[0].rank <= w[1].rank));
    }

    #[test]
    fn test_superseded_fact_leaves_search() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let old = db.facts.insert_fact("Jamie lives in Denver", None, None).unwrap();
        let new = db
            .facts
            .supersede_fact(old.id, "Jamie lives in Boulder", None, None)
            .unwrap()
            .unwrap();

        assert!(db.search_facts("Denver", 10).unwrap().is_empty());
        let hits = db.search_facts("Boulder", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, new.fact);
    }

    #[test]
    fn test_delete_session_cascades_messages_and_index() {
        let db = db_with_session("session_20261016_001");
        db.conversations
            .insert_message("session_20261016_001", &Message::user("remember the lighthouse"), None)
            .unwrap();
        let fact = db
            .facts
            .insert_fact("Jamie likes lighthouses", None, Some("session_20261016_001"))
            .unwrap();

        assert!(db.conversations.delete_session("session_20261016_001").unwrap());

        assert!(db.conversations.get_session("session_20261016_001").unwrap().is_none());
        assert!(db.conversations.get_messages("session_20261016_001").unwrap().is_empty());
        assert!(db.search_messages("lighthouse", 10).unwrap().is_empty());
        let fact = db.facts.get_fact(fact.id).unwrap().unwrap();
        assert_eq!(fact.source_session, None);
    }

    #[test]
    fn test_stats_count_rows() {
        let db = db_with_session("session_20261016_001");
        db.conversations
            .insert_message("session_20261016_001", &Message::user("hello"), Some(1))
            .unwrap();
        let old = db.facts.insert_fact("a", None, None).unwrap();
        db.facts.supersede_fact(old.id, "b", None, None).unwrap();

        let stats = db.get_stats().unwrap();
        assert_eq!(stats.total_sessions, 1);
        assert_eq!(stats.total_messages, 1);
        assert_eq!(stats.total_facts, 2);
        assert_eq!(stats.active_facts, 1);
    }
}
