// spark-memory/crates/spark-memory/src/config.rs

use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const DEFAULT_RECENT_SESSIONS: usize = 3;
pub const DEFAULT_TITLE_MAX_CHARS: usize = 60;
pub const DEFAULT_EXCERPT_MAX_CHARS: usize = 200;
pub const DEFAULT_SEARCH_LIMIT: usize = 10;

#[derive(Debug, Clone)]
pub struct MemoryConfig {
    pub workspace_root: PathBuf,
    pub database_path: PathBuf,
    pub recent_sessions: usize,
    pub title_max_chars: usize,
    pub excerpt_max_chars: usize,
    pub search_limit: usize,
}

impl MemoryConfig {
    /// Defaults for a workspace rooted at `workspace_root`.
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        let workspace_root = workspace_root.into();
        Self {
            database_path: workspace_root.join("spark.db"),
            workspace_root,
            recent_sessions: DEFAULT_RECENT_SESSIONS,
            title_max_chars: DEFAULT_TITLE_MAX_CHARS,
            excerpt_max_chars: DEFAULT_EXCERPT_MAX_CHARS,
            search_limit: DEFAULT_SEARCH_LIMIT,
        }
    }

    /// Load `~/.config/spark/.env` when present (variables already set in the
    /// environment win), then read the `SPARK_*` variables.
    pub fn from_env() -> Result<Self> {
        if let Some(path) = Self::env_file() {
            if path.exists() {
                dotenvy::from_path(&path)
                    .with_context(|| format!("Failed to load {}", path.display()))?;
                info!("Loaded environment variables from {}", path.display());
            } else {
                debug!("No config file at {}", path.display());
            }
        }

        let workspace_root = match env::var("SPARK_WORKSPACE") {
            Ok(root) => PathBuf::from(root),
            Err(_) => Self::default_workspace()?,
        };
        let mut config = Self::new(workspace_root);

        if let Ok(db_path) = env::var("SPARK_DB_PATH") {
            config.database_path = PathBuf::from(db_path);
        }
        config.recent_sessions = env::var("SPARK_RECENT_SESSIONS")
            .unwrap_or_else(|_| DEFAULT_RECENT_SESSIONS.to_string())
            .parse()
            .context("SPARK_RECENT_SESSIONS must be a non-negative integer")?;
        config.search_limit = env::var("SPARK_SEARCH_LIMIT")
            .unwrap_or_else(|_| DEFAULT_SEARCH_LIMIT.to_string())
            .parse()
            .context("SPARK_SEARCH_LIMIT must be a non-negative integer")?;

        info!(
            "Memory workspace: {} (database: {}, recent sessions: {})",
            config.workspace_root.display(),
            config.database_path.display(),
            config.recent_sessions
        );
        Ok(config)
    }

    fn env_file() -> Option<PathBuf> {
        env::var_os("HOME").map(|home| Path::new(&home).join(".config").join("spark").join(".env"))
    }

    fn default_workspace() -> Result<PathBuf> {
        let home = env::var_os("HOME").context("HOME is not set; set SPARK_WORKSPACE instead")?;
        Ok(Path::new(&home).join(".local").join("share").join("spark"))
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.workspace_root.join("sessions")
    }

    pub fn memories_dir(&self) -> PathBuf {
        self.workspace_root.join("memories")
    }

    pub fn system_prompt_path(&self) -> PathBuf {
        self.workspace_root.join("context").join("system_prompt.md")
    }
}
