//! Memory fact storage and the supersession chain.
//!
//! Facts are never edited in place. Replacing a fact inserts a new row and
//! then points the old row at it through `superseded_by`; that pointer is set
//! at most once and always points to a newer id, so chains only run forward.
use crate::memory_db::schema::*;
use crate::memory_db::search_index::FullTextIndex;
use chrono::Utc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::Arc;
use tracing::{debug, info, warn};

const FACT_COLUMNS: &str = "id, fact, category, source_session, created_at, superseded_by";

pub struct FactStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
    index: Arc<dyn FullTextIndex>,
}

impl FactStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>, index: Arc<dyn FullTextIndex>) -> Self {
        Self { pool, index }
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    /// Insert an active fact and index it. `category` defaults to `general`.
    pub fn insert_fact(
        &self,
        fact: &str,
        category: Option<&str>,
        source_session: Option<&str>,
    ) -> anyhow::Result<MemoryFact> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let stored = self.insert_with_conn(&tx, fact, category, source_session)?;
        tx.commit()?;

        debug!("Stored fact {} in category {}", stored.id, stored.category);
        Ok(stored)
    }

    fn insert_with_conn(
        &self,
        conn: &Connection,
        fact: &str,
        category: Option<&str>,
        source_session: Option<&str>,
    ) -> anyhow::Result<MemoryFact> {
        let category = category.unwrap_or(DEFAULT_CATEGORY);
        let created_at = Utc::now();
        conn.execute(
            "INSERT INTO memories (fact, category, source_session, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![fact, category, source_session, format_timestamp(&created_at)],
        )?;
        let id = conn.last_insert_rowid();
        self.index.index_fact(conn, id, fact)?;

        Ok(MemoryFact {
            id,
            fact: fact.to_string(),
            category: category.to_string(),
            source_session: source_session.map(str::to_string),
            created_at,
            superseded_by: None,
        })
    }

    pub fn get_fact(&self, fact_id: i64) -> anyhow::Result<Option<MemoryFact>> {
        let conn = self.get_conn()?;
        fetch_fact(&conn, fact_id)
    }

    /// Facts with no successor, oldest first.
    pub fn get_active_facts(&self) -> anyhow::Result<Vec<MemoryFact>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {FACT_COLUMNS} FROM memories WHERE superseded_by IS NULL ORDER BY created_at ASC, id ASC"
        ))?;
        let mut rows = stmt.query([])?;
        let mut facts = Vec::new();
        while let Some(row) = rows.next()? {
            facts.push(row_to_fact(row)?);
        }
        Ok(facts)
    }

    /// The active fact whose text matches exactly, if any.
    pub fn find_active_fact_by_text(&self, fact: &str) -> anyhow::Result<Option<MemoryFact>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {FACT_COLUMNS} FROM memories WHERE fact = ?1 AND superseded_by IS NULL ORDER BY id LIMIT 1"
        ))?;
        let mut rows = stmt.query([fact])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_fact(row)?)),
            None => Ok(None),
        }
    }

    /// Point `old_id` at `new_id`. Only links an active fact to an existing,
    /// newer fact; anything else leaves the chain untouched and returns `false`.
    pub fn mark_superseded(&self, old_id: i64, new_id: i64) -> anyhow::Result<bool> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let linked = self.link_with_conn(&tx, old_id, new_id)?;
        tx.commit()?;
        Ok(linked)
    }

    fn link_with_conn(&self, conn: &Connection, old_id: i64, new_id: i64) -> anyhow::Result<bool> {
        let Some(old) = fetch_fact(conn, old_id)? else {
            return Ok(false);
        };
        if !old.is_active() || new_id <= old_id || fetch_fact(conn, new_id)?.is_none() {
            warn!("Refusing to link fact {} to {}", old_id, new_id);
            return Ok(false);
        }

        let updated = conn.execute(
            "UPDATE memories SET superseded_by = ?1 WHERE id = ?2 AND superseded_by IS NULL",
            params![new_id, old_id],
        )?;
        if updated == 0 {
            return Ok(false);
        }
        self.index.unindex_fact(conn, old.id, &old.fact)?;

        info!("Fact {} superseded by {}", old_id, new_id);
        Ok(true)
    }

    /// Replace an active fact with new text in one transaction. Returns the new
    /// fact, or `None` when `old_id` is unknown or already superseded.
    pub fn supersede_fact(
        &self,
        old_id: i64,
        fact: &str,
        category: Option<&str>,
        source_session: Option<&str>,
    ) -> anyhow::Result<Option<MemoryFact>> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        let Some(old) = fetch_fact(&tx, old_id)? else {
            return Ok(None);
        };
        if !old.is_active() {
            return Ok(None);
        }

        let category = category.or(Some(old.category.as_str()));
        let replacement = self.insert_with_conn(&tx, fact, category, source_session)?;
        if !self.link_with_conn(&tx, old_id, replacement.id)? {
            // rolled back when `tx` drops
            return Ok(None);
        }
        tx.commit()?;

        Ok(Some(replacement))
    }

    /// Every fact in the chain that starts at `fact_id`, oldest first.
    pub fn get_fact_history(&self, fact_id: i64) -> anyhow::Result<Vec<MemoryFact>> {
        let conn = self.get_conn()?;
        let mut chain = Vec::new();
        let mut next = Some(fact_id);
        while let Some(id) = next {
            let Some(fact) = fetch_fact(&conn, id)? else {
                break;
            };
            next = fact.superseded_by;
            chain.push(fact);
        }
        Ok(chain)
    }
}

fn fetch_fact(conn: &Connection, fact_id: i64) -> anyhow::Result<Option<MemoryFact>> {
    let fact = conn
        .query_row(
            &format!("SELECT {FACT_COLUMNS} FROM memories WHERE id = ?1"),
            [fact_id],
            |row| Ok(row_to_fact(row)),
        )
        .optional()?;
    fact.transpose()
}

fn row_to_fact(row: &Row) -> anyhow::Result<MemoryFact> {
    let created_at = parse_timestamp(&row.get::<_, String>(4)?)
        .unwrap_or_else(|| { warn!("Failed parse fact created_at"); Utc::now() });

    Ok(MemoryFact {
        id: row.get(0)?,
        fact: row.get(1)?,
        category: row.get(2)?,
        source_session: row.get(3)?,
        created_at,
        superseded_by: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use crate::memory_db::MemoryDatabase;

    #[test]
    fn test_mark_superseded_links_forward_once() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let a = db.facts.insert_fact("Jamie lives in Denver", None, None).unwrap();
        let b = db.facts.insert_fact("Jamie lives in Boulder", None, None).unwrap();
        let c = db.facts.insert_fact("Jamie lives in Golden", None, None).unwrap();

        assert!(db.facts.mark_superseded(a.id, b.id).unwrap());
        assert_eq!(db.facts.get_fact(a.id).unwrap().unwrap().superseded_by, Some(b.id));

        // already superseded
        assert!(!db.facts.mark_superseded(a.id, c.id).unwrap());
        assert_eq!(db.facts.get_fact(a.id).unwrap().unwrap().superseded_by, Some(b.id));

        // successor must be newer
        assert!(!db.facts.mark_superseded(c.id, a.id).unwrap());
        assert!(db.facts.get_fact(c.id).unwrap().unwrap().is_active());
    }

    #[test]
    fn test_mark_superseded_unknown_ids() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let a = db.facts.insert_fact("a", None, None).unwrap();

        assert!(!db.facts.mark_superseded(a.id, a.id + 100).unwrap());
        assert!(!db.facts.mark_superseded(a.id + 100, a.id + 200).unwrap());
        assert!(db.facts.get_fact(a.id).unwrap().unwrap().is_active());
    }

    #[test]
    fn test_active_facts_exclude_superseded() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let a = db.facts.insert_fact("old", Some("work"), None).unwrap();
        let b = db.facts.supersede_fact(a.id, "new", None, None).unwrap().unwrap();

        assert_eq!(b.category, "work");
        let active: Vec<i64> = db.facts.get_active_facts().unwrap().iter().map(|f| f.id).collect();
        assert_eq!(active, vec![b.id]);
        assert!(db.facts.find_active_fact_by_text("old").unwrap().is_none());
        assert!(db.facts.supersede_fact(a.id, "newer", None, None).unwrap().is_none());
    }
}
