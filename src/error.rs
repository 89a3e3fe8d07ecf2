//! Error type for preview server operations.

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by [`crate::manager::PreviewManager`].
///
/// Teardown failures are never represented here: stopping an instance always
/// completes, and anything that goes wrong during cleanup is only logged.
#[derive(Debug, Error)]
pub enum PreviewError {
    #[error("No available ports after {attempts} attempts starting at {base}")]
    PortExhausted { base: u16, attempts: u16 },

    #[error("Filesystem error at {path}: {source}")]
    FileSystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid file path '{path}': {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("Preview server {id} not found")]
    NotFound { id: String },

    #[error("Preview manager is shutting down")]
    ShuttingDown,

    #[error("Background task failed: {0}")]
    Background(#[from] tokio::task::JoinError),
}

impl PreviewError {
    pub(crate) fn fs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileSystem {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, PreviewError>;
