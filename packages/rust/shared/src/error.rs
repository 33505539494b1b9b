//! Error types for recsync.
//!
//! Library crates use [`RecsyncError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all recsync operations.
#[derive(Debug, thiserror::Error)]
pub enum RecsyncError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error while talking to the record source.
    #[error("network error: {0}")]
    Network(String),

    /// Artifact read/write error (encoding, delimiter, rename).
    #[error("storage error: {0}")]
    Storage(String),

    /// Persisted artifact is structurally inconsistent and was not loaded.
    #[error("integrity error in {path:?}: {message}")]
    Integrity { path: PathBuf, message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (unknown column, bad operator, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, RecsyncError>;

impl RecsyncError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create an integrity error for the artifact at `path`.
    pub fn integrity(path: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        Self::Integrity {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
