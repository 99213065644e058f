// spark-memory/crates/spark-memory/src/runtime.rs

//! Wires the session log, the database, the fact files and the prompt
//! builder into one handle per workspace.

use crate::config::MemoryConfig;
use crate::context_engine::{ContextBuilder, ContextBuilderConfig, FactArtifact, FactExtractor};
use crate::memory::{Message, Session};
use crate::memory_db::{MemoryDatabase, SearchResult};
use crate::session_log::{SessionHandle, SessionLog};
use anyhow::Context;
use std::fs;
use std::sync::Arc;
use tracing::info;

/// One live conversation: its log handle and the prompt frozen when it began.
pub struct Conversation {
    handle: SessionHandle,
    system_prompt: String,
}

impl Conversation {
    pub fn id(&self) -> &str {
        self.handle.id()
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn session(&self) -> &Session {
        self.handle.session()
    }
}

pub struct MemoryRuntime {
    config: MemoryConfig,
    store: Arc<MemoryDatabase>,
    log: SessionLog,
    extractor: FactExtractor,
    context: ContextBuilder,
}

impl MemoryRuntime {
    /// Lay out the workspace, open the database and bring the fact files up to
    /// date with it. A migration failure is returned.
    pub fn open(config: MemoryConfig) -> anyhow::Result<Self> {
        for dir in [
            config.sessions_dir(),
            config.memories_dir(),
            config.workspace_root.join("context"),
        ] {
            fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        }

        let store = Arc::new(MemoryDatabase::new(&config.database_path)?);

        let artifact = FactArtifact::new(config.memories_dir());
        artifact
            .reconcile_from(&store)
            .context("Failed to reconcile fact files with the database")?;

        let log = SessionLog::new(config.sessions_dir())
            .with_store(Arc::clone(&store))
            .with_title_max_chars(config.title_max_chars);
        let extractor = FactExtractor::new(artifact).with_store(Arc::clone(&store));
        let context = ContextBuilder::new(ContextBuilderConfig::from_memory_config(&config));

        info!("Memory runtime ready at {}", config.workspace_root.display());
        Ok(Self {
            config,
            store,
            log,
            extractor,
            context,
        })
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<MemoryDatabase> {
        &self.store
    }

    pub fn session_log(&self) -> &SessionLog {
        &self.log
    }

    pub fn extractor(&self) -> &FactExtractor {
        &self.extractor
    }

    pub fn build_context(&self, n_recent: usize) -> anyhow::Result<String> {
        self.context.build(n_recent)
    }

    /// Build the prompt from past sessions, then open a new one. The prompt
    /// does not change for the rest of the conversation.
    pub fn begin_conversation(&self) -> anyhow::Result<Conversation> {
        let system_prompt = self.context.build(self.config.recent_sessions)?;
        let handle = self.log.start()?;
        Ok(Conversation {
            handle,
            system_prompt,
        })
    }

    pub fn record_user(&self, conversation: &mut Conversation, text: &str) -> anyhow::Result<()> {
        self.log.append(&mut conversation.handle, Message::user(text))
    }

    /// Log the reply, then return the facts it taught us.
    pub fn record_assistant(&self, conversation: &mut Conversation, text: &str) -> anyhow::Result<Vec<String>> {
        self.log.append(&mut conversation.handle, Message::assistant(text))?;
        Ok(self.extractor.extract_for_session(text, Some(conversation.id())))
    }

    pub fn tag(&self, conversation: &mut Conversation, tag: &str) -> anyhow::Result<bool> {
        self.log.tag(&mut conversation.handle, tag)
    }

    pub fn search(&self, query: &str, limit: usize) -> anyhow::Result<Vec<SearchResult>> {
        self.store.search(query, limit)
    }
}
