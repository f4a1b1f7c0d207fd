//! Error types for the streaming core

use thiserror::Error;

use crate::streaming::task::DrawMode;

/// Main error type for the streaming core.
///
/// Every variant is fatal to the frame loop: contract violations mean the
/// caller broke the ingestion contract, device errors mean the GPU is gone.
/// Fence exhaustion is not an error, requests simply wait in the pending set.
#[derive(Debug, Error)]
pub enum Error {
    #[error("GPU error: {0}")]
    Gpu(String),

    #[error("Device lost: {0}")]
    DeviceLost(String),

    #[error("Chunk key {key} out of range (capacity {capacity})")]
    KeyOutOfRange { key: usize, capacity: usize },

    #[error("Unsupported topology: {0:?}")]
    UnsupportedTopology(DrawMode),

    #[error("Mismatched length in {what}: got {len}, expected a multiple of {multiple}")]
    MismatchedLength {
        what: &'static str,
        len: usize,
        multiple: usize,
    },

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// True for errors caused by the caller breaking the ingestion contract.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Error::KeyOutOfRange { .. }
                | Error::UnsupportedTopology(_)
                | Error::MismatchedLength { .. }
                | Error::InvalidConfig(_)
        )
    }
}
