//! apkgate-store: persistence layer for the apkgate pipeline
//!
//! Every sink or shared resource a pipeline run touches is a trait here, so the
//! core crate can be exercised against in-memory fakes and run for real
//! against a state directory.
//!
//! ## Key Components
//!
//! - `ArtifactStore` / `ReleaseStore`: the two publish sinks
//! - `CacheStore`: fingerprint-keyed caches with write locks
//! - `BuildNumberLedger`: unique build numbers
//! - `CommentSink`: change-request summaries
//! - `RunStore`: current run per concurrency key, shared across processes

mod error;
pub mod fakes;
pub mod fs;
pub mod storage_traits;

pub use error::StorageError;
pub use fs::{
    FsArtifactStore, FsBuildLedger, FsCacheStore, FsCommentSink, FsReleaseStore, FsRunStore,
};
pub use storage_traits::{
    ArtifactRecord, ArtifactStore, ArtifactUpload, BuildNumberLedger, CacheEntry, CacheStore,
    CommentRecord, CommentSink, ContentDigest, ReleaseDraft, ReleaseRecord, ReleaseStore,
    RunSlot, RunStore, StorageResult, Upserted,
};
