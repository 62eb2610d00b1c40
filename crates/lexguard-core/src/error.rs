use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by pipeline operations.
///
/// `Validation` and `Auth` are raised before any mutation. `Provider` and `Timeout`
/// normally end up recorded on the document itself rather than returned, since the
/// uploader has already been answered by then.
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not authorized: {0}")]
    Auth(String),

    #[error("analysis provider error: {0}")]
    Provider(String),

    #[error("analysis exceeded {}s budget", .0.as_secs())]
    Timeout(Duration),

    #[error("delete failed: {0}")]
    Delete(String),

    #[error("document {0} has not been analyzed")]
    NotAnalyzed(String),

    #[error("document {0} not found")]
    NotFound(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Errors returned by an analysis backend.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("document is {size} bytes, limit is {limit}")]
    TooLarge { size: u64, limit: u64 },

    #[error("{0}")]
    Provider(String),
}
