//! Error types for the keep-alive cache.

use thiserror::Error;

/// Errors produced by keep-alive cache operations.
#[derive(Debug, Error)]
pub enum KeepAliveError {
    #[error("failed to close connection to {destination}: {source}")]
    Close {
        destination: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}

pub type KeepAliveResult<T> = Result<T, KeepAliveError>;
