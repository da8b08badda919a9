//! Error types for chunkfetch core

use chunkfetch_types::ByteRange;
use std::fmt;
use thiserror::Error;

/// Errors that can occur in chunkfetch core
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("Size probe failed for {url}: {reason}")]
    ProbeFailed { url: String, reason: FetchFailure },

    #[error("Range {range} fetch failed: {reason}")]
    RangeFetchFailed { range: ByteRange, reason: FetchFailure },

    #[error("Download already registered: {0}")]
    DuplicateId(String),

    #[error("Download not found: {0}")]
    NotFound(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Download was cancelled: {0}")]
    Cancelled(String),

    #[error("HTTP client error: {0}")]
    Client(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Why a probe or range request did not produce usable data
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchFailure {
    /// Server answered with an unexpected status code
    Status(u16),
    /// Connection, TLS, timeout or body stream error
    Transport(String),
    /// Body length did not match the requested range
    ShortBody { expected: u64, actual: u64 },
    /// Server did not report a usable length
    MissingLength,
}

impl fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchFailure::Status(code) => write!(f, "HTTP status {}", code),
            FetchFailure::Transport(msg) => write!(f, "transport error: {}", msg),
            FetchFailure::ShortBody { expected, actual } => {
                write!(f, "expected {} bytes, received {}", expected, actual)
            }
            FetchFailure::MissingLength => f.write_str("no usable content length"),
        }
    }
}

impl From<reqwest::Error> for FetchFailure {
    fn from(error: reqwest::Error) -> Self {
        match error.status() {
            Some(status) => FetchFailure::Status(status.as_u16()),
            None => FetchFailure::Transport(error.to_string()),
        }
    }
}

impl EngineError {
    /// Whether the error ended a download (as opposed to a rejected call or a cancel)
    pub fn is_transfer_failure(&self) -> bool {
        matches!(
            self,
            EngineError::ProbeFailed { .. } | EngineError::RangeFetchFailed { .. } | EngineError::Internal(_)
        )
    }
}
