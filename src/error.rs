//! Error types for the cluster store.

use crate::types::ClusterId;
use thiserror::Error;

/// Main error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Missing disk field: cluster {cluster}, field `{field}`")]
    MissingField { cluster: ClusterId, field: String },

    #[error(
        "Shape mismatch: cluster {cluster}, field `{field}`: \
         {len} bytes is not a multiple of the {row_bytes}-byte record size"
    )]
    ShapeMismatch {
        cluster: ClusterId,
        field: String,
        len: u64,
        row_bytes: usize,
    },

    #[error("Write attempted in read-only mode")]
    ReadOnlyViolation,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Store is locked by another process")]
    Locked,

    #[error("Unknown cluster: {0}")]
    UnknownCluster(ClusterId),

    #[error("Inconsistent partition-change event: {0}")]
    InconsistentUpdate(String),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
