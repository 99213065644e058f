// spark-memory/crates/spark-memory/src/lib.rs

pub mod config;
pub mod context_engine;
pub mod memory;
pub mod memory_db;
pub mod runtime;
pub mod session_log;
pub mod telemetry;
pub mod utils;

// Public API exports
pub use config::MemoryConfig;
pub use context_engine::{ContextBuilder, FactArtifact, FactExtractor};
pub use memory::{Message, Role, Session, SessionMeta};
pub use memory_db::{MemoryDatabase, MemoryFact, SearchResult, SearchSource};
pub use runtime::{Conversation, MemoryRuntime};
pub use session_log::{replay, SessionHandle, SessionId, SessionLog};
