//! Append-only session logs.
//!
//! Each conversation is one newline-delimited JSON file in the sessions
//! directory. The first line is a `meta` record; every message follows as a
//! `message` record, and a fresh `meta` record is appended whenever the
//! session's attributes change. Readers take the last `meta` record as the
//! truth and keep messages in file order.
//!
//! There is no process-wide "current session": [`SessionLog::start`] hands
//! back a [`SessionHandle`] that every later call takes explicitly.

use crate::config::DEFAULT_TITLE_MAX_CHARS;
use crate::memory::{Message, Role, Session, SessionMeta, PLACEHOLDER_TITLE};
use crate::memory_db::{MemoryDatabase, SessionUpdate};
use crate::utils::TextUtils;
use anyhow::Context;
use chrono::{Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const LOG_EXTENSION: &str = "jsonl";

/// `session_<YYYYMMDD>_<NNN>`; orders by date, then sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId {
    pub date: NaiveDate,
    pub sequence: u32,
}

impl SessionId {
    pub fn parse(s: &str) -> Option<Self> {
        let rest = s.strip_prefix("session_")?;
        let (date, sequence) = rest.split_once('_')?;
        let all_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
        if date.len() != 8 || !all_digits(date) || sequence.len() < 3 || !all_digits(sequence) {
            return None;
        }
        Some(Self {
            date: NaiveDate::from_ymd_opt(
                date[..4].parse().ok()?,
                date[4..6].parse().ok()?,
                date[6..].parse().ok()?,
            )?,
            sequence: sequence.parse().ok()?,
        })
    }

    pub fn file_name(&self) -> String {
        format!("{}.{}", self, LOG_EXTENSION)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session_{}_{:03}", self.date.format("%Y%m%d"), self.sequence)
    }
}

/// One line of a session log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LogRecord {
    Meta(SessionMeta),
    Message(Message),
}

/// The live state of an open session.
#[derive(Debug)]
pub struct SessionHandle {
    session: Session,
    path: PathBuf,
    file: File,
    titled: bool,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        self.session.id()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_record(&mut self, record: &LogRecord) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .with_context(|| format!("Failed to append to {}", self.path.display()))?;
        self.file
            .sync_data()
            .with_context(|| format!("Failed to sync {}", self.path.display()))?;
        Ok(())
    }

    fn write_meta(&mut self) -> anyhow::Result<()> {
        let record = LogRecord::Meta(self.session.meta.clone());
        self.write_record(&record)
    }
}

/// Creates, appends to and replays session logs. When a database is attached,
/// sessions and messages are mirrored into it as well; the log file stays the
/// primary record, so a failed mirror write is logged rather than returned.
pub struct SessionLog {
    sessions_dir: PathBuf,
    store: Option<Arc<MemoryDatabase>>,
    title_max_chars: usize,
}

impl SessionLog {
    pub fn new(sessions_dir: impl Into<PathBuf>) -> Self {
        Self {
            sessions_dir: sessions_dir.into(),
            store: None,
            title_max_chars: DEFAULT_TITLE_MAX_CHARS,
        }
    }

    pub fn with_store(mut self, store: Arc<MemoryDatabase>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_title_max_chars(mut self, title_max_chars: usize) -> Self {
        self.title_max_chars = title_max_chars;
        self
    }

    pub fn sessions_dir(&self) -> &Path {
        &self.sessions_dir
    }

    /// Open a new session for today and write its first `meta` record.
    pub fn start(&self) -> anyhow::Result<SessionHandle> {
        let id = self.next_session_id(Local::now().date_naive())?;
        let path = self.sessions_dir.join(id.file_name());
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to create session log {}", path.display()))?;

        let now = Utc::now();
        let mut handle = SessionHandle {
            session: Session {
                meta: SessionMeta {
                    id: id.to_string(),
                    created_at: now,
                    updated_at: now,
                    title: PLACEHOLDER_TITLE.to_string(),
                    tags: Default::default(),
                },
                messages: Vec::new(),
            },
            path,
            file,
            titled: false,
        };
        handle.write_meta()?;
        info!("Started session {}", handle.id());

        if let Some(store) = &self.store {
            if let Err(e) = store.conversations.create_session(handle.id(), Some(PLACEHOLDER_TITLE), now) {
                warn!("Failed to mirror session {} into the store: {}", handle.id(), e);
            }
        }
        Ok(handle)
    }

    /// Append a message. The first user message names the session; the new
    /// title is written as a `meta` record ahead of the message itself.
    pub fn append(&self, handle: &mut SessionHandle, message: Message) -> anyhow::Result<()> {
        handle.session.meta.updated_at = Utc::now();

        let retitle = !handle.titled && message.role == Role::User;
        if retitle {
            handle.session.meta.title =
                TextUtils::truncate_chars(&message.content, self.title_max_chars).into_owned();
            handle.titled = true;
            handle.write_meta()?;
            debug!("Session {} titled '{}'", handle.id(), handle.session.meta.title);
        }
        handle.write_record(&LogRecord::Message(message.clone()))?;

        if let Some(store) = &self.store {
            let update = SessionUpdate {
                title: retitle.then(|| handle.session.meta.title.clone()),
                updated_at: Some(handle.session.meta.updated_at),
                ..Default::default()
            };
            let mirrored = store
                .conversations
                .insert_message(handle.id(), &message, None)
                .and_then(|_| store.conversations.update_session(handle.id(), &update));
            if let Err(e) = mirrored {
                warn!("Failed to mirror message into session {}: {}", handle.id(), e);
            }
        }

        handle.session.messages.push(message);
        Ok(())
    }

    /// Add a tag to the session. Returns `false` when it was already present.
    pub fn tag(&self, handle: &mut SessionHandle, tag: &str) -> anyhow::Result<bool> {
        if !handle.session.meta.tags.insert(tag.to_string()) {
            return Ok(false);
        }
        handle.session.meta.updated_at = Utc::now();
        handle.write_meta()?;

        if let Some(store) = &self.store {
            let update = SessionUpdate {
                tags: Some(handle.session.meta.tags.iter().cloned().collect()),
                updated_at: Some(handle.session.meta.updated_at),
                ..Default::default()
            };
            if let Err(e) = store.conversations.update_session(handle.id(), &update) {
                warn!("Failed to mirror tags of session {}: {}", handle.id(), e);
            }
        }
        Ok(true)
    }

    /// Next id for `date`: one past the highest sequence already on disk.
    pub fn next_session_id(&self, date: NaiveDate) -> anyhow::Result<SessionId> {
        fs::create_dir_all(&self.sessions_dir)
            .with_context(|| format!("Failed to create {}", self.sessions_dir.display()))?;

        let sequence = self
            .list_session_ids()?
            .into_iter()
            .filter(|id| id.date == date)
            .map(|id| id.sequence)
            .max()
            .unwrap_or(0)
            + 1;
        Ok(SessionId { date, sequence })
    }

    /// Ids of every session log on disk, oldest first.
    pub fn list_session_ids(&self) -> anyhow::Result<Vec<SessionId>> {
        if !self.sessions_dir.exists() {
            return Ok(Vec::new());
        }

        let mut ids: Vec<SessionId> = fs::read_dir(&self.sessions_dir)
            .with_context(|| format!("Failed to read {}", self.sessions_dir.display()))?
            .flatten()
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension()? != LOG_EXTENSION {
                    return None;
                }
                SessionId::parse(path.file_stem()?.to_str()?)
            })
            .collect();
        ids.sort();
        Ok(ids)
    }

    pub fn load(&self, id: &SessionId) -> anyhow::Result<Option<Session>> {
        replay(&self.sessions_dir.join(id.file_name()))
    }

    /// The `n` most recently created sessions, newest first. Logs that cannot
    /// be read are left out.
    pub fn recent(&self, n: usize) -> anyhow::Result<Vec<Session>> {
        let ids = self.list_session_ids()?;
        let sessions = ids
            .iter()
            .rev()
            .take(n)
            .filter_map(|id| match self.load(id) {
                Ok(Some(session)) => Some(session),
                Ok(None) => {
                    warn!("Session log {} has no metadata, skipping", id);
                    None
                }
                Err(e) => {
                    warn!("Failed to read session log {}: {}", id, e);
                    None
                }
            })
            .collect();
        Ok(sessions)
    }
}

/// Rebuild a session from its log. Lines that do not parse as a record,
/// including a torn final line cut inside a UTF-8 sequence, are skipped.
/// Returns `None` when the log holds no `meta` record.
pub fn replay(path: &Path) -> anyhow::Result<Option<Session>> {
    let raw = fs::read(path)
        .with_context(|| format!("Failed to read session log {}", path.display()))?;

    let mut meta = None;
    let mut messages = Vec::new();
    for (line_no, line) in raw.split(|&b| b == b'\n').enumerate() {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice::<LogRecord>(line) {
            Ok(LogRecord::Meta(m)) => meta = Some(m),
            Ok(LogRecord::Message(m)) => messages.push(m),
            Err(e) => debug!("Skipping record {} of {}: {}", line_no + 1, path.display(), e),
        }
    }

    Ok(meta.map(|meta| Session { meta, messages }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn log_in(dir: &TempDir) -> SessionLog {
        SessionLog::new(dir.path().join("sessions"))
    }

    fn record_types(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| {
                let value: serde_json::Value = serde_json::from_str(line).unwrap();
                value["type"].as_str().unwrap().to_string()
            })
            .collect()
    }

    #[test]
    fn test_session_id_format_and_parse() {
        let id = SessionId { date: NaiveDate::from_ymd_opt(2026, 10, 16).unwrap(), sequence: 7 };
        assert_eq!(id.to_string(), "session_20261016_007");
        assert_eq!(id.file_name(), "session_20261016_007.jsonl");
        assert_eq!(SessionId::parse("session_20261016_007"), Some(id));
        assert_eq!(SessionId::parse("session_20261016_1234").unwrap().sequence, 1234);
        assert_eq!(SessionId::parse("session_2026101_007"), None);
        assert_eq!(SessionId::parse("session_20261016_07"), None);
        assert_eq!(SessionId::parse("notes_20261016_007"), None);
    }

    #[test]
    fn test_start_writes_meta_first() {
        let dir = TempDir::new().unwrap();
        let log = log_in(&dir);
        let handle = log.start().unwrap();

        assert!(handle.id().ends_with("_001"));
        assert_eq!(handle.session().title(), PLACEHOLDER_TITLE);
        assert_eq!(record_types(handle.path()), vec!["meta"]);
    }

    #[test]
    fn test_sequence_uses_max_plus_one() {
        let dir = TempDir::new().unwrap();
        let log = log_in(&dir);
        let first = log.start().unwrap();
        let second = log.start().unwrap();
        assert!(first.id().ends_with("_001"));
        assert!(second.id().ends_with("_002"));

        fs::remove_file(first.path()).unwrap();
        let third = log.start().unwrap();
        assert!(third.id().ends_with("_003"));
    }

    #[test]
    fn test_first_user_message_sets_title_once() {
        let dir = TempDir::new().unwrap();
        let log = log_in(&dir);
        let mut handle = log.start().unwrap();

        log.append(&mut handle, Message::system("be helpful")).unwrap();
        assert_eq!(handle.session().title(), PLACEHOLDER_TITLE);

        let long = "x".repeat(100);
        log.append(&mut handle, Message::user(long.clone())).unwrap();
        log.append(&mut handle, Message::assistant("ok")).unwrap();
        log.append(&mut handle, Message::user("a different question")).unwrap();

        assert_eq!(handle.session().title(), &long[..60]);
        assert_eq!(
            record_types(handle.path()),
            vec!["meta", "message", "meta", "message", "message", "message"]
        );

        let replayed = replay(handle.path()).unwrap().unwrap();
        assert_eq!(replayed.title(), &long[..60]);
        assert_eq!(replayed.messages.len(), 4);
        assert_eq!(replayed.messages, handle.session().messages);
    }

    #[test]
    fn test_replay_skips_bad_records_and_uses_last_meta() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("session_20261016_001.jsonl");
        let lines = [
            r#"{"type":"meta","id":"session_20261016_001","created_at":"2026-10-16T09:00:00.000Z","updated_at":"2026-10-16T09:00:00.000Z","title":"New session","tags":[]}"#,
            "not json at all",
            r#"{"type":"message","role":"user","content":"first","timestamp":"2026-10-16T09:00:01.000Z"}"#,
            r#"{"type":"unknown","content":"?"}"#,
            r#"{"type":"message","role":"robot","content":"bad role","timestamp":"2026-10-16T09:00:02.000Z"}"#,
            "",
            r#"{"type":"meta","id":"session_20261016_001","created_at":"2026-10-16T09:00:00.000Z","updated_at":"2026-10-16T09:05:00.000Z","title":"first","tags":["travel"]}"#,
            r#"{"type":"message","role":"assistant","content":"second","timestamp":"2026-10-16T09:00:03.000Z"}"#,
        ];
        fs::write(&path, lines.join("\n")).unwrap();

        let session = replay(&path).unwrap().unwrap();
        assert_eq!(session.title(), "first");
        assert!(session.meta.tags.contains("travel"));
        assert_eq!(session.meta.updated_at.to_rfc3339(), "2026-10-16T09:05:00+00:00");
        let contents: Vec<&str> = session.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second"]);
    }

    #[test]
    fn test_replay_survives_write_torn_inside_utf8() {
        let dir = TempDir::new().unwrap();
        let log = log_in(&dir);
        let mut handle = log.start().unwrap();
        log.append(&mut handle, Message::user("first question")).unwrap();

        let mut file = OpenOptions::new().append(true).open(handle.path()).unwrap();
        file.write_all(b"{\"type\":\"message\",\"role\":\"user\",\"content\":\"caf\xc3").unwrap();

        let session = replay(handle.path()).unwrap().unwrap();
        assert_eq!(session.title(), "first question");
        assert_eq!(session.messages.len(), 1);
        assert_eq!(log.recent(3).unwrap().len(), 1);
    }

    #[test]
    fn test_replay_without_meta_is_none() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("session_20261016_001.jsonl");
        fs::write(&path, "garbage\n").unwrap();
        assert!(replay(&path).unwrap().is_none());
    }

    #[test]
    fn test_tag_reemits_meta_only_on_change() {
        let dir = TempDir::new().unwrap();
        let log = log_in(&dir);
        let mut handle = log.start().unwrap();

        assert!(log.tag(&mut handle, "travel").unwrap());
        assert!(!log.tag(&mut handle, "travel").unwrap());
        assert_eq!(record_types(handle.path()), vec!["meta", "meta"]);
        assert!(replay(handle.path()).unwrap().unwrap().meta.tags.contains("travel"));
    }

    #[test]
    fn test_recent_returns_newest_first() {
        let dir = TempDir::new().unwrap();
        let log = log_in(&dir);
        for question in ["one", "two", "three"] {
            let mut handle = log.start().unwrap();
            log.append(&mut handle, Message::user(question)).unwrap();
        }

        let recent = log.recent(2).unwrap();
        let titles: Vec<&str> = recent.iter().map(|s| s.title()).collect();
        assert_eq!(titles, vec!["three", "two"]);
        assert_eq!(log.recent(10).unwrap().len(), 3);
    }

    #[test]
    fn test_recent_on_missing_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(log_in(&dir).recent(3).unwrap().is_empty());
    }

    #[test]
    fn test_store_mirrors_session_and_messages() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryDatabase::new_in_memory().unwrap());
        let log = log_in(&dir).with_store(Arc::clone(&store));

        let mut handle = log.start().unwrap();
        log.append(&mut handle, Message::user("plan a trip to Lisbon")).unwrap();
        log.append(&mut handle, Message::assistant("Sure, when?")).unwrap();

        let row = store.conversations.get_session(handle.id()).unwrap().unwrap();
        assert_eq!(row.title.as_deref(), Some("plan a trip to Lisbon"));
        let messages = store.conversations.get_messages(handle.id()).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].content, "Sure, when?");
    }
}
