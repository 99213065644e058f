//! Pulls `[MEMORY]` blocks out of model replies and commits new facts.

use crate::context_engine::fact_artifact::FactArtifact;
use crate::memory_db::{MemoryDatabase, DEFAULT_CATEGORY};
use lazy_static::lazy_static;
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const MEMORY_MARKER: &str = "[MEMORY]";

lazy_static! {
    // "Added to profile: ..." / "updated to notes: ..."
    static ref COMMIT_PREFIX: Regex = Regex::new(r"(?i)^(?:added|updated) to \w+:\s*").unwrap();
}

fn bullet_text(line: &str) -> Option<&str> {
    line.trim().strip_prefix("- ").map(str::trim)
}

/// Candidate facts in reply order. Pure text processing; nothing is checked
/// against the artifact here.
pub fn parse_fact_blocks(response_text: &str) -> Vec<String> {
    let lines: Vec<&str> = response_text.lines().collect();
    let mut candidates = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let Some(rest) = lines[i].trim_start().strip_prefix(MEMORY_MARKER) else {
            i += 1;
            continue;
        };
        let inline = rest.trim();

        let mut bullets = Vec::new();
        let mut j = i + 1;
        while j < lines.len() {
            if let Some(bullet) = bullet_text(lines[j]) {
                bullets.push(bullet);
                j += 1;
            } else {
                // a blank line is part of the block but closes it
                if lines[j].trim().is_empty() {
                    j += 1;
                }
                break;
            }
        }

        if bullets.is_empty() {
            let fact = COMMIT_PREFIX.replace(inline, "");
            let fact = fact.trim();
            if !fact.is_empty() {
                candidates.push(fact.to_string());
            }
        } else {
            candidates.extend(bullets.into_iter().filter(|b| !b.is_empty()).map(String::from));
        }
        i = j;
    }

    candidates
}

pub struct FactExtractor {
    artifact: FactArtifact,
    store: Option<Arc<MemoryDatabase>>,
}

impl FactExtractor {
    pub fn new(artifact: FactArtifact) -> Self {
        Self { artifact, store: None }
    }

    /// Also record accepted facts in the relational store.
    pub fn with_store(mut self, store: Arc<MemoryDatabase>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn artifact(&self) -> &FactArtifact {
        &self.artifact
    }

    /// Facts from `response_text` that were not already in the artifact.
    pub fn extract(&self, response_text: &str) -> Vec<String> {
        self.extract_for_session(response_text, None)
    }

    /// Like [`extract`](Self::extract), tagging stored facts with their
    /// source session. Failures are logged and the candidate dropped.
    pub fn extract_for_session(&self, response_text: &str, session_id: Option<&str>) -> Vec<String> {
        let mut accepted = Vec::new();

        for fact in parse_fact_blocks(response_text) {
            match self.artifact.append_unique(DEFAULT_CATEGORY, &fact) {
                Ok(true) => {
                    self.mirror(&fact, session_id);
                    accepted.push(fact);
                }
                Ok(false) => debug!("Skipping known fact: {}", fact),
                Err(e) => warn!("Could not record fact '{}': {:#}", fact, e),
            }
        }

        if !accepted.is_empty() {
            info!("Extracted {} new fact(s)", accepted.len());
        }
        accepted
    }

    fn mirror(&self, fact: &str, session_id: Option<&str>) {
        let Some(store) = &self.store else {
            return;
        };
        let result = store.facts.find_active_fact_by_text(fact).and_then(|existing| match existing {
            Some(_) => Ok(()),
            None => store.facts.insert_fact(fact, None, session_id).map(|_| ()),
        });
        if let Err(e) = result {
            warn!("Fact '{}' kept in the artifact only: {:#}", fact, e);
        }
    }
}
