//! Error taxonomy shared by every durability component

use std::path::PathBuf;
use std::time::Duration;

use crate::records::StoreError;

/// Errors raised by snapshot, backup, recovery and cache operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Disk full, permission denied, missing path
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed payload or artifact document
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Checksum mismatch; never retried and never partially applied
    #[error("integrity check failed for {artifact}")]
    Integrity { artifact: String },

    /// The record store's native backup primitive failed
    #[error("backup failed: {0}")]
    Backup(String),

    /// The requested artifact does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Replaying a verified artifact into the record store failed
    #[error("replay failed: {0}")]
    Replay(String),

    /// Any other failure reported by the record store
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Artifact written by a newer, unknown format
    #[error("unsupported snapshot format version {0}")]
    UnsupportedVersion(u32),

    /// A bounded operation did not finish within its budget
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Caller supplied an invalid identifier, path or setting
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// Shorthand for a missing artifact at `path`
    pub fn missing(path: impl Into<PathBuf>) -> Self {
        Self::NotFound(path.into().display().to_string())
    }

    /// True when the error means "the artifact is corrupt" rather than absent
    pub fn is_integrity(&self) -> bool {
        matches!(self, Self::Integrity { .. })
    }
}

/// Result type used throughout keepsake-core and its dependents
pub type Result<T> = std::result::Result<T, Error>;
