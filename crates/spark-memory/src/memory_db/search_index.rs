//! Lexical search over message content and active fact text.
//!
//! Index maintenance is explicit: every store write that adds or removes a
//! content row calls into the index on the same connection, inside the same
//! transaction, so a committed row and its index entry always travel together.
//! The [`FullTextIndex`] trait is the seam for swapping the backend; the
//! default [`Fts5Index`] uses SQLite's FTS5 external-content tables created by
//! migration 2.

use crate::memory_db::schema::{parse_timestamp, SearchResult, SearchSource};
use rusqlite::{params, Connection, Row};
use std::cmp::Ordering;

pub trait FullTextIndex: Send + Sync {
    fn index_message(&self, conn: &Connection, message_id: i64, content: &str) -> rusqlite::Result<()>;

    fn unindex_message(&self, conn: &Connection, message_id: i64, content: &str) -> rusqlite::Result<()>;

    fn index_fact(&self, conn: &Connection, fact_id: i64, fact: &str) -> rusqlite::Result<()>;

    fn unindex_fact(&self, conn: &Connection, fact_id: i64, fact: &str) -> rusqlite::Result<()>;

    /// Ranked message hits, best (lowest rank) first.
    fn search_messages(&self, conn: &Connection, query: &str, limit: usize) -> rusqlite::Result<Vec<SearchResult>>;

    /// Ranked hits over facts that have not been superseded, best first.
    fn search_facts(&self, conn: &Connection, query: &str, limit: usize) -> rusqlite::Result<Vec<SearchResult>>;
}

/// FTS5-backed index. Ranks are bm25 scores, so message and fact hits compare directly.
#[derive(Debug, Default, Clone, Copy)]
pub struct Fts5Index;

impl Fts5Index {
    pub fn new() -> Self {
        Self
    }
}

impl FullTextIndex for Fts5Index {
    fn index_message(&self, conn: &Connection, message_id: i64, content: &str) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO messages_fts(rowid, content) VALUES (?1, ?2)",
            params![message_id, content],
        )?;
        Ok(())
    }

    fn unindex_message(&self, conn: &Connection, message_id: i64, content: &str) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO messages_fts(messages_fts, rowid, content) VALUES ('delete', ?1, ?2)",
            params![message_id, content],
        )?;
        Ok(())
    }

    fn index_fact(&self, conn: &Connection, fact_id: i64, fact: &str) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO memories_fts(rowid, fact) VALUES (?1, ?2)",
            params![fact_id, fact],
        )?;
        Ok(())
    }

    fn unindex_fact(&self, conn: &Connection, fact_id: i64, fact: &str) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO memories_fts(memories_fts, rowid, fact) VALUES ('delete', ?1, ?2)",
            params![fact_id, fact],
        )?;
        Ok(())
    }

    fn search_messages(&self, conn: &Connection, query: &str, limit: usize) -> rusqlite::Result<Vec<SearchResult>> {
        let Some(match_query) = build_match_query(query) else {
            return Ok(Vec::new());
        };
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut stmt = conn.prepare(
            "SELECT m.content, m.session_id, m.timestamp, s.title, bm25(messages_fts) AS score
             FROM messages_fts
             JOIN messages m ON m.id = messages_fts.rowid
             LEFT JOIN sessions s ON s.id = m.session_id
             WHERE messages_fts MATCH ?1
             ORDER BY score
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![match_query, limit as i64], |row| {
            row_to_result(row, SearchSource::Message)
        })?;
        rows.collect()
    }

    fn search_facts(&self, conn: &Connection, query: &str, limit: usize) -> rusqlite::Result<Vec<SearchResult>> {
        let Some(match_query) = build_match_query(query) else {
            return Ok(Vec::new());
        };
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut stmt = conn.prepare(
            "SELECT mem.fact, mem.source_session, mem.created_at, NULL, bm25(memories_fts) AS score
             FROM memories_fts
             JOIN memories mem ON mem.id = memories_fts.rowid
             WHERE memories_fts MATCH ?1 AND mem.superseded_by IS NULL
             ORDER BY score
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![match_query, limit as i64], |row| {
            row_to_result(row, SearchSource::Memory)
        })?;
        rows.collect()
    }
}

fn row_to_result(row: &Row, source: SearchSource) -> rusqlite::Result<SearchResult> {
    let timestamp: Option<String> = row.get(2)?;
    Ok(SearchResult {
        source,
        content: row.get(0)?,
        session_id: row.get(1)?,
        session_title: row.get(3)?,
        timestamp: timestamp.as_deref().and_then(parse_timestamp),
        rank: row.get(4)?,
    })
}

/// Turn free text into an FTS5 query: every alphanumeric term quoted, all
/// terms required. Returns `None` when nothing searchable remains, so
/// operator characters in user input can never produce a syntax error.
pub fn build_match_query(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|term| !term.is_empty())
        .map(|term| format!("\"{}\"", term))
        .collect();

    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}

/// Interleave fact and message hits by rank and keep the best `limit`.
/// On equal rank a fact sorts ahead of a message.
pub fn merge_ranked(
    facts: Vec<SearchResult>,
    messages: Vec<SearchResult>,
    limit: usize,
) -> Vec<SearchResult> {
    let mut merged = facts;
    merged.extend(messages);
    merged.sort_by(|a, b| a.rank.partial_cmp(&b.rank).unwrap_or(Ordering::Equal));
    merged.truncate(limit);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn hit(source: SearchSource, rank: f64) -> SearchResult {
        SearchResult {
            source,
            content: format!("{}:{}", source, rank),
            session_id: None,
            session_title: None,
            timestamp: None,
            rank,
        }
    }

    #[test]
    fn test_build_match_query_quotes_terms() {
        assert_eq!(build_match_query("jamie skiing").as_deref(), Some("\"jamie\" \"skiing\""));
        assert_eq!(build_match_query("  NEAR(\"a\" OR b*)").as_deref(), Some("\"NEAR\" \"a\" \"OR\" \"b\""));
    }

    #[test]
    fn test_build_match_query_rejects_empty_input() {
        assert_eq!(build_match_query(""), None);
        assert_eq!(build_match_query("  \"*( )"), None);
    }

    #[test]
    fn test_merge_prefers_fact_on_tie() {
        let merged = merge_ranked(
            vec![hit(SearchSource::Memory, -1.0)],
            vec![hit(SearchSource::Message, -1.0), hit(SearchSource::Message, -3.0)],
            2,
        );
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].source, SearchSource::Message);
        assert_eq!(merged[0].rank, -3.0);
        assert_eq!(merged[1].source, SearchSource::Memory);
    }

    proptest! {
        #[test]
        fn prop_merge_is_bounded_and_sorted(
            fact_ranks in proptest::collection::vec(-50.0f64..0.0, 0..20),
            message_ranks in proptest::collection::vec(-50.0f64..0.0, 0..20),
            limit in 0usize..30,
        ) {
            let facts: Vec<_> = fact_ranks.iter().map(|r| hit(SearchSource::Memory, *r)).collect();
            let messages: Vec<_> = message_ranks.iter().map(|r| hit(SearchSource::Message, *r)).collect();
            let total = facts.len() + messages.len();

            let merged = merge_ranked(facts, messages, limit);

            prop_assert_eq!(merged.len(), total.min(limit));
            prop_assert!(merged.windows(2).all(|w| w[0].rank <= w[1].rank));
        }
    }
}
