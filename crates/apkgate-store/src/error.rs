//! Error types for apkgate-store

use thiserror::Error;

/// Errors returned by the storage traits and their backends.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Requested record does not exist
    #[error("not found: {what}")]
    NotFound { what: String },

    /// Digest string is not 64 lowercase hex characters
    #[error("invalid digest: {digest}")]
    InvalidDigest { digest: String },

    /// Key cannot be used as a single path component
    #[error("invalid store key: {key:?}")]
    InvalidKey { key: String },

    /// Cache key is write-locked by another run
    #[error("cache key {key} is locked by {owner}")]
    LockHeld { key: String, owner: String },

    /// Commit or release attempted without holding the write lock
    #[error("cache key {key} is not locked by {owner}")]
    LockNotHeld { key: String, owner: String },

    /// Cache entries are immutable once committed
    #[error("cache key {key} is already committed")]
    AlreadyCommitted { key: String },

    /// Build number was claimed by an earlier run
    #[error("build number {build_number} is already claimed by {owner}")]
    NumberClaimed { build_number: u64, owner: String },

    /// Filesystem error in a file-backed store
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Manifest (de)serialization error
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}
