//! Error types for cache operations.

use depcache_redis::RedisError;
use thiserror::Error;

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Cache-specific errors.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Transport, pool, protocol or not-found error.
    #[error(transparent)]
    Redis(#[from] RedisError),

    /// The lock is held by another secret.
    #[error("key is locked with a different secret")]
    LockMismatch,

    /// A lock could not be acquired in time.
    #[error("timed out waiting for lock {0}")]
    LockTimeout(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

impl CacheError {
    /// Check if a read found nothing.
    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Redis(RedisError::Nil))
    }

    /// Check if a lock operation was refused because of another holder.
    pub fn is_lock_mismatch(&self) -> bool {
        matches!(self, Self::LockMismatch)
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            Self::Deserialization(err.to_string())
        } else {
            Self::Serialization(err.to_string())
        }
    }
}
