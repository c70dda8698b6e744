//! Error types for the disk cache.

use std::path::PathBuf;

/// Cache errors.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Cache root is missing, not a directory, or not writable.
    #[error("cache configuration error at {path}: {message}")]
    Config { path: PathBuf, message: String },

    /// Filesystem operation failed.
    #[error("cache io error: {message}")]
    Io { message: String },

    /// Fingerprint cannot be used as a cache key.
    #[error("invalid cache key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    /// Stored entry failed integrity verification.
    #[error("corrupt cache entry {fingerprint}: {reason}")]
    Corrupt { fingerprint: String, reason: String },

    /// Entry header could not be encoded.
    #[error("serialization error: {message}")]
    Serialization { message: String },
}

impl CacheError {
    pub(crate) fn io(context: &str, err: std::io::Error) -> Self {
        Self::Io {
            message: format!("{}: {}", context, err),
        }
    }

    /// Whether the error means the cache root itself is unusable.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config { .. })
    }
}

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;
