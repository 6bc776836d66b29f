//! Pipeline error taxonomy.
//!
//! Every stage returns one of these variants. The pipeline never rewraps
//! them, so a caller sees exactly the error the failing stage produced.

use thiserror::Error;

/// Errors that abort a prediction invocation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// The reference has no usable trailing segment to use as an object key.
    #[error("invalid image reference {0:?}: no object key after the last '/'")]
    InvalidReference(String),

    #[error("no object {key:?} in bucket {bucket:?}")]
    NotFound { bucket: String, key: String },

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("inference endpoint unavailable: {0}")]
    InferenceUnavailable(String),

    #[error("malformed inference result: {0}")]
    MalformedResult(String),

    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("invocation cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Short machine-readable name, used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::InvalidReference(_) => "invalid_reference",
            PipelineError::NotFound { .. } => "not_found",
            PipelineError::StorageUnavailable(_) => "storage_unavailable",
            PipelineError::InferenceUnavailable(_) => "inference_unavailable",
            PipelineError::MalformedResult(_) => "malformed_result",
            PipelineError::CacheUnavailable(_) => "cache_unavailable",
            PipelineError::Cancelled => "cancelled",
        }
    }
}
