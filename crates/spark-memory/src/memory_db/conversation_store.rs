//! Session and message storage with synchronous index maintenance
use crate::memory::Message;
use crate::memory_db::schema::*;
use crate::memory_db::search_index::FullTextIndex;
use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, Row, ToSql};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct ConversationStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
    index: Arc<dyn FullTextIndex>,
}

impl ConversationStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>, index: Arc<dyn FullTextIndex>) -> Self {
        Self { pool, index }
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    pub fn create_session(
        &self,
        session_id: &str,
        title: Option<&str>,
        created_at: DateTime<Utc>,
    ) -> anyhow::Result<StoredSession> {
        let conn = self.get_conn()?;
        let created = format_timestamp(&created_at);
        conn.execute(
            "INSERT INTO sessions (id, title, created_at, updated_at) VALUES (?1, ?2, ?3, ?4)",
            params![session_id, title, created, created],
        )?;

        info!("Created session with ID: {}", session_id);
        Ok(StoredSession {
            id: session_id.to_string(),
            title: title.map(str::to_string),
            summary: None,
            created_at,
            updated_at: created_at,
            tags: Vec::new(),
        })
    }

    /// Apply the set fields of `update`. Returns `false` when the session does not exist.
    pub fn update_session(&self, session_id: &str, update: &SessionUpdate) -> anyhow::Result<bool> {
        if update.is_empty() {
            return Ok(self.get_session(session_id)?.is_some());
        }

        let mut sets: Vec<&str> = Vec::new();
        let mut values: Vec<Box<dyn ToSql>> = Vec::new();
        if let Some(title) = &update.title {
            sets.push("title = ?");
            values.push(Box::new(title.clone()));
        }
        if let Some(summary) = &update.summary {
            sets.push("summary = ?");
            values.push(Box::new(summary.clone()));
        }
        if let Some(updated_at) = &update.updated_at {
            sets.push("updated_at = ?");
            values.push(Box::new(format_timestamp(updated_at)));
        }
        if let Some(tags) = &update.tags {
            sets.push("tags = ?");
            values.push(Box::new(serde_json::to_string(tags)?));
        }
        values.push(Box::new(session_id.to_string()));

        let query = format!("UPDATE sessions SET {} WHERE id = ?", sets.join(", "));
        let conn = self.get_conn()?;
        let param_refs: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();
        let updated = conn.execute(&query, rusqlite::params_from_iter(param_refs))?;

        debug!("Updated session {} ({} field(s))", session_id, sets.len());
        Ok(updated > 0)
    }

    pub fn get_session(&self, session_id: &str) -> anyhow::Result<Option<StoredSession>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, title, summary, created_at, updated_at, tags FROM sessions WHERE id = ?1",
        )?;
        let mut rows = stmt.query([session_id])?;

        if let Some(row) = rows.next()? {
            Ok(Some(row_to_session(row)?))
        } else {
            Ok(None)
        }
    }

    /// Most recently created sessions first.
    pub fn list_sessions(&self, limit: usize) -> anyhow::Result<Vec<StoredSession>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, title, summary, created_at, updated_at, tags FROM sessions
             ORDER BY created_at DESC, id DESC LIMIT ?1",
        )?;
        let mut rows = stmt.query([limit as i64])?;
        let mut sessions = Vec::new();

        while let Some(row) = rows.next()? {
            sessions.push(row_to_session(row)?);
        }

        Ok(sessions)
    }

    /// Remove a session: its messages (and their index entries) first, then the
    /// session row, in one transaction. Facts learned in the session survive with
    /// their source cleared. Returns `false` when there was no such session.
    pub fn delete_session(&self, session_id: &str) -> anyhow::Result<bool> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        let messages: Vec<(i64, String)> = {
            let mut stmt = tx.prepare("SELECT id, content FROM messages WHERE session_id = ?1")?;
            let rows = stmt.query_map([session_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        for (id, content) in &messages {
            self.index.unindex_message(&tx, *id, content)?;
        }
        tx.execute("DELETE FROM messages WHERE session_id = ?1", [session_id])?;
        tx.execute(
            "UPDATE memories SET source_session = NULL WHERE source_session = ?1",
            [session_id],
        )?;
        let deleted = tx.execute("DELETE FROM sessions WHERE id = ?1", [session_id])?;
        tx.commit()?;

        info!("Deleted session {} ({} messages)", session_id, messages.len());
        Ok(deleted > 0)
    }

    /// Insert a message row and its index entry in one transaction.
    pub fn insert_message(
        &self,
        session_id: &str,
        message: &Message,
        token_count: Option<i64>,
    ) -> anyhow::Result<StoredMessage> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO messages (session_id, role, content, timestamp, token_count)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                session_id,
                message.role.as_str(),
                &message.content,
                format_timestamp(&message.timestamp),
                token_count,
            ],
        )?;
        let id = tx.last_insert_rowid();
        self.index.index_message(&tx, id, &message.content)?;
        tx.commit()?;

        Ok(StoredMessage {
            id,
            session_id: session_id.to_string(),
            role: message.role,
            content: message.content.clone(),
            timestamp: message.timestamp,
            token_count,
        })
    }

    /// Messages of a session in insertion order; empty for an unknown session.
    pub fn get_messages(&self, session_id: &str) -> anyhow::Result<Vec<StoredMessage>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, session_id, role, content, timestamp, token_count
             FROM messages WHERE session_id = ?1 ORDER BY id ASC",
        )?;
        let mut rows = stmt.query([session_id])?;
        let mut messages = Vec::new();
        while let Some(row) = rows.next()? {
            messages.push(row_to_stored_message(row)?);
        }
        Ok(messages)
    }

    pub fn get_session_message_count(&self, session_id: &str) -> anyhow::Result<usize> {
        let conn = self.get_conn()?;
        count_messages(&conn, session_id)
    }
}

fn count_messages(conn: &Connection, session_id: &str) -> anyhow::Result<usize> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM messages WHERE session_id = ?1",
        [session_id],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

fn row_to_session(row: &Row) -> anyhow::Result<StoredSession> {
    let tags_json: String = row.get(5)?;
    let tags: Vec<String> = serde_json::from_str(&tags_json).unwrap_or_else(|e| {
        warn!("Failed to parse session tags '{}': {}", tags_json, e);
        Vec::new()
    });

    let created_at = parse_timestamp(&row.get::<_, String>(3)?)
        .unwrap_or_else(|| { warn!("Failed parse created_at"); Utc::now() });
    let updated_at = parse_timestamp(&row.get::<_, String>(4)?)
        .unwrap_or_else(|| { warn!("Failed parse updated_at"); Utc::now() });

    Ok(StoredSession {
        id: row.get(0)?,
        title: row.get(1)?,
        summary: row.get(2)?,
        created_at,
        updated_at,
        tags,
    })
}

fn row_to_stored_message(row: &Row) -> anyhow::Result<StoredMessage> {
    let role: String = row.get(2)?;
    let timestamp = parse_timestamp(&row.get::<_, String>(4)?)
        .unwrap_or_else(|| { warn!("Failed parse message timestamp"); Utc::now() });

    Ok(StoredMessage {
        id: row.get(0)?,
        session_id: row.get(1)?,
        role: role.parse()?,
        content: row.get(3)?,
        timestamp,
        token_count: row.get(5)?,
    })
}
