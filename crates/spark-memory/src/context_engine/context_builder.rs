//! Builds the system prompt that opens a conversation

use crate::config::{MemoryConfig, DEFAULT_EXCERPT_MAX_CHARS};
use crate::context_engine::fact_artifact::FactArtifact;
use crate::memory::Session;
use crate::session_log::SessionLog;
use crate::utils::TextUtils;
use anyhow::Context;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Used when `context/system_prompt.md` is missing or blank.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful personal assistant with long-term memory. \
Facts you have learned about the user and summaries of recent conversations follow. \
When you learn something worth remembering, add a line starting with [MEMORY] followed by the fact, \
or [MEMORY] followed by a list of \"- \" bullets.";

pub const SECTION_SEPARATOR: &str = "\n\n---\n\n";

/// Assembles the base prompt, every fact file and recent session summaries
pub struct ContextBuilder {
    config: ContextBuilderConfig,
}

/// Where the builder reads from
#[derive(Debug, Clone)]
pub struct ContextBuilderConfig {
    pub system_prompt_path: PathBuf,
    pub memories_dir: PathBuf,
    pub sessions_dir: PathBuf,
    pub excerpt_max_chars: usize,
}

impl ContextBuilderConfig {
    pub fn from_memory_config(config: &MemoryConfig) -> Self {
        Self {
            system_prompt_path: config.system_prompt_path(),
            memories_dir: config.memories_dir(),
            sessions_dir: config.sessions_dir(),
            excerpt_max_chars: config.excerpt_max_chars,
        }
    }

    pub fn for_workspace(root: &Path) -> Self {
        Self {
            system_prompt_path: root.join("context").join("system_prompt.md"),
            memories_dir: root.join("memories"),
            sessions_dir: root.join("sessions"),
            excerpt_max_chars: DEFAULT_EXCERPT_MAX_CHARS,
        }
    }
}

impl ContextBuilder {
    pub fn new(config: ContextBuilderConfig) -> Self {
        Self { config }
    }

    /// System prompt with summaries of the `n_recent` newest sessions
    pub fn build(&self, n_recent: usize) -> anyhow::Result<String> {
        let mut parts = Vec::new();

        let base = read_trimmed(&self.config.system_prompt_path)?;
        if base.is_empty() {
            debug!("No system prompt at {}, using default", self.config.system_prompt_path.display());
            parts.push(DEFAULT_SYSTEM_PROMPT.to_string());
        } else {
            parts.push(base);
        }

        let artifact = FactArtifact::new(&self.config.memories_dir);
        let mut memory_files = 0;
        for path in artifact.files()? {
            match read_trimmed(&path) {
                Ok(content) if !content.is_empty() => {
                    parts.push(content);
                    memory_files += 1;
                }
                Ok(_) => {}
                Err(e) => warn!("Skipping memory file: {:#}", e),
            }
        }

        let sessions = SessionLog::new(&self.config.sessions_dir).recent(n_recent)?;
        for session in &sessions {
            parts.push(summarize_session(session, self.config.excerpt_max_chars));
        }

        info!(
            "Built system prompt from {} memory file(s) and {} past session(s)",
            memory_files,
            sessions.len()
        );
        Ok(parts.join(SECTION_SEPARATOR))
    }
}

/// `## Past session: "<title>"` followed by one labelled excerpt per message.
pub fn summarize_session(session: &Session, excerpt_max_chars: usize) -> String {
    let mut lines = Vec::with_capacity(session.messages.len() + 1);
    lines.push(format!("## Past session: \"{}\"", session.title()));
    for message in &session.messages {
        lines.push(format!(
            "{}: {}",
            message.role.label(),
            TextUtils::excerpt(&message.content, excerpt_max_chars)
        ));
    }
    lines.join("\n")
}

fn read_trimmed(path: &Path) -> anyhow::Result<String> {
    if !path.exists() {
        return Ok(String::new());
    }
    // invalid bytes become U+FFFD
    let raw = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(String::from_utf8_lossy(&raw).trim().to_string())
}
