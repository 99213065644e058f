//! Utilities module - Common helpers for text handling

pub mod text_utils;

// Re-export commonly used utilities
pub use text_utils::TextUtils;
