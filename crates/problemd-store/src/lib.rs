//! Persistence layer for problemd
//!
//! Provides:
//! - Problem directories guarded by a symlink-as-PID lock
//! - Element name rules and content classification
//! - `reported_to` parsing
//! - Audit journal (append-only)

mod audit;
mod dump_dir;
mod element;
mod lock;
mod reported_to;
mod sqlite;
mod traits;

pub use audit::*;
pub use dump_dir::*;
pub use element::*;
pub use lock::LOCK_FILE;
pub use reported_to::{parse_reported_line, parse_reported_to};
pub use sqlite::*;
pub use traits::*;

use thiserror::Error;

/// Audit journal errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
