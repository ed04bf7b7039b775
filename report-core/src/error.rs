//! Error types for the report pipeline.

use crate::report::SyncState;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ReportError>;

#[derive(Error, Debug)]
pub enum ReportError {
    /// User input rejected before anything was persisted.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("report {0} already exists")]
    DuplicateId(String),

    #[error("report {0} not found")]
    NotFound(String),

    #[error("report {id}: invalid sync transition {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: SyncState,
        to: SyncState,
    },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A blocking store task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(String),
}

impl ReportError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// True for errors caused by caller input rather than a broken contract.
    pub fn is_user_error(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}
