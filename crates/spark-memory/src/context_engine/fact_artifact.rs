//! Human-readable fact files.
//!
//! Every category has one markdown file of `- fact` bullets under the
//! memories directory (`general` lives in `MEMORY.md`). Files are only ever
//! appended to, and a fact is written at most once per file: its bulleted
//! line must not already appear anywhere in the file.

use crate::memory_db::{MemoryDatabase, DEFAULT_CATEGORY};
use anyhow::Context;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const GENERAL_FILE: &str = "MEMORY.md";
const BULLET: &str = "- ";

pub struct FactArtifact {
    memories_dir: PathBuf,
}

impl FactArtifact {
    pub fn new(memories_dir: impl Into<PathBuf>) -> Self {
        Self {
            memories_dir: memories_dir.into(),
        }
    }

    pub fn memories_dir(&self) -> &Path {
        &self.memories_dir
    }

    /// File holding `category`. Characters outside `[A-Za-z0-9_-]` become `_`.
    pub fn path_for(&self, category: &str) -> PathBuf {
        if category.eq_ignore_ascii_case(DEFAULT_CATEGORY) {
            return self.memories_dir.join(GENERAL_FILE);
        }
        let name: String = category
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c.to_ascii_lowercase() } else { '_' })
            .collect();
        self.memories_dir.join(format!("{}.md", name))
    }

    fn read(&self, path: &Path) -> anyhow::Result<String> {
        if !path.exists() {
            return Ok(String::new());
        }
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
    }

    pub fn contains(&self, category: &str, fact: &str) -> anyhow::Result<bool> {
        let current = self.read(&self.path_for(category))?;
        Ok(current.contains(&format!("{}{}", BULLET, fact)))
    }

    /// Append `- fact` unless that exact line text is already in the file.
    /// Returns whether anything was written.
    pub fn append_unique(&self, category: &str, fact: &str) -> anyhow::Result<bool> {
        let path = self.path_for(category);
        let current = self.read(&path)?;
        let bullet = format!("{}{}", BULLET, fact);
        if current.contains(&bullet) {
            debug!("Fact already recorded in {}: {}", path.display(), fact);
            return Ok(false);
        }

        fs::create_dir_all(&self.memories_dir)
            .with_context(|| format!("Failed to create {}", self.memories_dir.display()))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;

        let mut entry = String::with_capacity(bullet.len() + 2);
        if !current.is_empty() && !current.ends_with('\n') {
            entry.push('\n');
        }
        entry.push_str(&bullet);
        entry.push('\n');
        file.write_all(entry.as_bytes())
            .with_context(|| format!("Failed to append to {}", path.display()))?;
        file.sync_data()
            .with_context(|| format!("Failed to sync {}", path.display()))?;
        Ok(true)
    }

    /// Bullet entries of one category, in file order.
    pub fn facts(&self, category: &str) -> anyhow::Result<Vec<String>> {
        let current = self.read(&self.path_for(category))?;
        Ok(current
            .lines()
            .filter_map(|line| line.trim_start().strip_prefix(BULLET))
            .map(|fact| fact.trim_end().to_string())
            .filter(|fact| !fact.is_empty())
            .collect())
    }

    /// Every markdown file in the memories directory, sorted by file name.
    pub fn files(&self) -> anyhow::Result<Vec<PathBuf>> {
        if !self.memories_dir.exists() {
            return Ok(Vec::new());
        }
        let mut files: Vec<PathBuf> = fs::read_dir(&self.memories_dir)
            .with_context(|| format!("Failed to read {}", self.memories_dir.display()))?
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "md"))
            .collect();
        files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        Ok(files)
    }

    /// Append every active store fact the files do not have yet. The store is
    /// authoritative; nothing is ever removed from the files.
    pub fn reconcile_from(&self, store: &MemoryDatabase) -> anyhow::Result<usize> {
        let mut appended = 0;
        for fact in store.facts.get_active_facts()? {
            if self.append_unique(&fact.category, &fact.fact)? {
                appended += 1;
            }
        }
        if appended > 0 {
            info!("Copied {} fact(s) from the store into {}", appended, self.memories_dir.display());
        }
        Ok(appended)
    }
}
