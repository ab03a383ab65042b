//! Storage trait definitions for apkgate
//!
//! These traits define the sinks and shared resources a pipeline run touches:
//! - `ArtifactStore`: ephemeral build artifacts with a retention window
//! - `ReleaseStore`: persistent (pre)releases keyed by tag
//! - `CacheStore`: fingerprint-keyed build caches with per-key write locks
//! - `BuildNumberLedger`: monotonically increasing, never-reused build numbers
//! - `CommentSink`: summaries attached to a change request
//! - `RunStore`: the current run per concurrency key, and dispatched triggers
//!
//! All traits are async and backend-agnostic. In-memory fakes live in the
//! `fakes` module and file-backed implementations in `fs`.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// ContentDigest
// ---------------------------------------------------------------------------

/// Content digest (SHA-256 hex string).
///
/// The inner field is private to guarantee the string is always valid
/// lowercase hex produced by `from_bytes`, `from_hash_output` or validated via
/// `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Wrap a finished 32-byte SHA-256 output.
    pub fn from_hash_output(output: &[u8; 32]) -> Self {
        ContentDigest(hex::encode(output))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl From<ContentDigest> for String {
    fn from(d: ContentDigest) -> Self {
        d.0
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of an idempotent write.
///
/// `replaced` is true when a record with the same key already existed and was
/// overwritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upserted<T> {
    pub record: T,
    pub replaced: bool,
}

// ---------------------------------------------------------------------------
// ArtifactStore
// ---------------------------------------------------------------------------

/// An artifact to be uploaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactUpload {
    /// Artifact name, the idempotency key
    pub name: String,
    /// Local file to upload
    pub source_path: PathBuf,
    pub size_bytes: u64,
    pub sha256: ContentDigest,
    pub build_number: u64,
    /// Days until the artifact expires
    pub retention_days: u32,
}

/// A stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub name: String,
    /// Backend-specific location (path or URL)
    pub location: String,
    pub size_bytes: u64,
    pub sha256: ContentDigest,
    pub build_number: u64,
    pub retention_days: u32,
    pub uploaded_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Ephemeral artifact store.
///
/// Guarantees:
/// - `upload` with an existing name overwrites, never duplicates.
/// - `list` is ordered by name.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Upload (or overwrite) an artifact.
    async fn upload(&self, upload: ArtifactUpload) -> StorageResult<Upserted<ArtifactRecord>>;

    /// Fetch an artifact record by name.
    async fn get(&self, name: &str) -> StorageResult<Option<ArtifactRecord>>;

    /// List all stored artifacts.
    async fn list(&self) -> StorageResult<Vec<ArtifactRecord>>;
}

// ---------------------------------------------------------------------------
// ReleaseStore
// ---------------------------------------------------------------------------

/// A release to be published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseDraft {
    /// Release tag, the idempotency key
    pub tag: String,
    pub title: String,
    /// Markdown body
    pub body: String,
    pub prerelease: bool,
    /// Local file attached as the release asset
    pub asset_path: PathBuf,
    pub asset_name: String,
    pub sha256: ContentDigest,
    pub build_number: u64,
}

/// A published release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseRecord {
    pub tag: String,
    pub title: String,
    pub body: String,
    pub prerelease: bool,
    pub asset_name: String,
    pub asset_location: String,
    pub sha256: ContentDigest,
    pub build_number: u64,
    pub published_at: DateTime<Utc>,
}

/// Persistent release store.
///
/// Guarantees:
/// - `publish` with an existing tag overwrites, never duplicates.
/// - `list` is ordered newest first.
#[async_trait]
pub trait ReleaseStore: Send + Sync {
    /// Publish (or overwrite) a release.
    async fn publish(&self, draft: ReleaseDraft) -> StorageResult<Upserted<ReleaseRecord>>;

    /// Fetch a release by tag.
    async fn get(&self, tag: &str) -> StorageResult<Option<ReleaseRecord>>;

    /// List releases, newest first.
    async fn list(&self) -> StorageResult<Vec<ReleaseRecord>>;
}

// ---------------------------------------------------------------------------
// CacheStore
// ---------------------------------------------------------------------------

/// A committed (valid) cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Fingerprint-derived key
    pub key: String,
    /// Paths captured by this entry
    pub paths: Vec<String>,
    /// Run that committed the entry
    pub owner: String,
    pub committed_at: DateTime<Utc>,
}

/// Shared, read-mostly build cache.
///
/// Guarantees:
/// - Only committed entries are visible through `lookup`.
/// - At most one owner holds the write lock for a key.
/// - `commit` marks the entry valid and releases the lock in one step.
/// - `release` drops a lock without marking anything valid.
/// - Committed entries are immutable.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Return the committed entry for `key`, if any.
    async fn lookup(&self, key: &str) -> StorageResult<Option<CacheEntry>>;

    /// Acquire the write lock for `key` on behalf of `owner`.
    ///
    /// Fails with `LockHeld` if another owner holds it and with
    /// `AlreadyCommitted` if the key is already valid.
    async fn acquire(&self, key: &str, owner: &str) -> StorageResult<()>;

    /// Commit an entry. The lock must be held by `entry.owner`.
    async fn commit(&self, entry: CacheEntry) -> StorageResult<()>;

    /// Release the write lock held by `owner`. No-op if unlocked.
    async fn release(&self, key: &str, owner: &str) -> StorageResult<()>;

    /// Current lock holder for `key`.
    async fn lock_owner(&self, key: &str) -> StorageResult<Option<String>>;
}

// ---------------------------------------------------------------------------
// BuildNumberLedger
// ---------------------------------------------------------------------------

/// Ledger of claimed build numbers.
///
/// Guarantees:
/// - `next_available` is strictly greater than every claimed number.
/// - A number can be claimed exactly once; later claims fail with
///   `NumberClaimed`.
#[async_trait]
pub trait BuildNumberLedger: Send + Sync {
    /// Smallest number greater than every claimed number (starts at 1).
    async fn next_available(&self) -> StorageResult<u64>;

    /// Claim `build_number` for `owner`.
    async fn claim(&self, build_number: u64, owner: &str) -> StorageResult<()>;

    /// Owner of a claimed number.
    async fn owner_of(&self, build_number: u64) -> StorageResult<Option<String>>;
}

// ---------------------------------------------------------------------------
// CommentSink
// ---------------------------------------------------------------------------

/// A comment attached to a change request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentRecord {
    pub pr_number: u64,
    /// Idempotency key within the change request
    pub key: String,
    pub body: String,
    pub updated_at: DateTime<Utc>,
}

/// Change-request comment service.
#[async_trait]
pub trait CommentSink: Send + Sync {
    /// Create or replace the comment identified by `(pr_number, key)`.
    async fn upsert(
        &self,
        pr_number: u64,
        key: &str,
        body: &str,
    ) -> StorageResult<Upserted<CommentRecord>>;

    /// All comments on a change request, ordered by key.
    async fn list(&self, pr_number: u64) -> StorageResult<Vec<CommentRecord>>;
}

// ---------------------------------------------------------------------------
// RunStore
// ---------------------------------------------------------------------------

/// The run currently entitled to publish for a concurrency key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSlot {
    pub key: String,
    pub run_id: String,
    pub started_at: DateTime<Utc>,
}

/// Run bookkeeping shared by every process handling triggers.
///
/// Guarantees:
/// - `supersede` is last-writer-wins: the newest call owns the slot.
/// - Slots are never cleared, so a finished run still supersedes older ones.
/// - `claim_dispatch` succeeds at most once per key until released.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Make `run_id` the current run for `key`. Returns the slot it replaced.
    async fn supersede(&self, key: &str, run_id: &str) -> StorageResult<Option<RunSlot>>;

    /// Current run for `key`, if any.
    async fn current(&self, key: &str) -> StorageResult<Option<RunSlot>>;

    /// Record a dispatched trigger. Returns false if it was already recorded.
    async fn claim_dispatch(&self, dispatch_key: &str) -> StorageResult<bool>;

    /// Forget a dispatched trigger so it can be handled again.
    async fn release_dispatch(&self, dispatch_key: &str) -> StorageResult<()>;
}
