//! Wiregate Common Library
//!
//! Shared types, error taxonomy, and persistence plumbing for the
//! Wiregate gateway controller.

pub mod db;
pub mod error;
pub mod types;
pub mod validate;

// Re-export commonly used types
pub use db::Database;
pub use error::{Error, FieldError, Result};
pub use types::*;

/// Wiregate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Current time as unix epoch seconds.
pub fn now_epoch_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Default store path
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".wiregate")
}

/// Default database path
pub fn default_db_path() -> std::path::PathBuf {
    default_store_path().join("state.db")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
