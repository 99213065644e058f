//! Context engine module - prompt assembly and the fact memory loop

pub mod context_builder;
pub mod fact_artifact;
pub mod fact_extractor;

pub use context_builder::{summarize_session, ContextBuilder, ContextBuilderConfig, DEFAULT_SYSTEM_PROMPT};
pub use fact_artifact::FactArtifact;
pub use fact_extractor::{parse_fact_blocks, FactExtractor, MEMORY_MARKER};
