//! Error types for claimq.
//!
//! Only storage faults and bad input are errors. Losing a race for an item
//! is ordinary control flow and is reported through `bool`/`Option` results.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("work item not found: {0}")]
    NotFound(String),

    #[error("invalid owner token: {0}")]
    InvalidOwner(String),

    #[error("invalid work item id: {0}")]
    InvalidItemId(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("corrupt item document {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
