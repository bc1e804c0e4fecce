use thiserror::Error;

use crate::request::StoreId;

/// Error type for store-layer operations.
///
/// Errors are cloneable because a single fetch may be awaited by several
/// callers through a shared future.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Index read failed: {0}")]
    IndexFailed(String),

    #[error("Mutation failed: {0}")]
    MutationFailed(String),

    #[error("Unknown store: {0}")]
    UnknownStore(StoreId),

    #[error("Request aborted")]
    Aborted,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("No tokio runtime to drive the request")]
    NoRuntime,
}

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
