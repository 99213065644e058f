//! Database row types for the memory system
use crate::memory::Role;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Category assigned to facts that arrive without one.
pub const DEFAULT_CATEGORY: &str = "general";

/// A session row. `title` stays `None` only for rows created without one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSession {
    pub id: String,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Partial update of a session row; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    pub title: Option<String>,
    pub summary: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
    pub tags: Option<Vec<String>>,
}

impl SessionUpdate {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.summary.is_none()
            && self.updated_at.is_none()
            && self.tags.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub token_count: Option<i64>,
}

/// A distilled fact. A fact whose `superseded_by` is set is history only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryFact {
    pub id: i64,
    pub fact: String,
    pub category: String,
    pub source_session: Option<String>,
    pub created_at: DateTime<Utc>,
    pub superseded_by: Option<i64>,
}

impl MemoryFact {
    pub fn is_active(&self) -> bool {
        self.superseded_by.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchSource {
    Message,
    Memory,
}

impl fmt::Display for SearchSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchSource::Message => f.write_str("message"),
            SearchSource::Memory => f.write_str("memory"),
        }
    }
}

/// One ranked hit from the full-text index. Lower `rank` is better.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub source: SearchSource,
    pub content: String,
    pub session_id: Option<String>,
    pub session_title: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub rank: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DatabaseStats {
    pub total_sessions: i64,
    pub total_messages: i64,
    pub total_facts: i64,
    pub active_facts: i64,
    pub schema_version: i32,
    pub database_size_bytes: i64,
}

/// Timestamps are written as RFC 3339; older rows may carry SQLite's own format.
pub(crate) fn parse_timestamp(datetime_str: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(datetime_str) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(datetime_str, "%Y-%m-%d %H:%M:%S") {
        return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(datetime_str, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
    }
    None
}

pub(crate) fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
