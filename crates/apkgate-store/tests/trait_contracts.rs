//! Trait contract tests for the storage traits.
//!
//! These tests verify the behavioral contracts using the in-memory fakes.
//! Any conforming implementation must pass these.

use std::path::PathBuf;

use apkgate_store::fakes::{
    MemoryArtifactStore, MemoryBuildLedger, MemoryCacheStore, MemoryCommentSink,
    MemoryReleaseStore, MemoryRunStore,
};
use apkgate_store::storage_traits::*;
use apkgate_store::StorageError;
use chrono::Utc;

fn upload(name: &str, build_number: u64) -> ArtifactUpload {
    ArtifactUpload {
        name: name.to_string(),
        source_path: PathBuf::from("fdroid/debug/app-fdroid-debug.apk"),
        size_bytes: 1024,
        sha256: ContentDigest::from_bytes(name.as_bytes()),
        build_number,
        retention_days: 30,
    }
}

fn draft(tag: &str, build_number: u64) -> ReleaseDraft {
    ReleaseDraft {
        tag: tag.to_string(),
        title: format!("Test build {build_number}"),
        body: "body".to_string(),
        prerelease: true,
        asset_path: PathBuf::from("fdroid/debug/app-fdroid-debug.apk"),
        asset_name: "app.apk".to_string(),
        sha256: ContentDigest::from_bytes(tag.as_bytes()),
        build_number,
    }
}

// ===========================================================================
// ArtifactStore
// ===========================================================================

#[tokio::test]
async fn artifact_upload_then_get() {
    let store = MemoryArtifactStore::new();
    let out = store.upload(upload("app-android-test-1", 1)).await.unwrap();

    assert!(!out.replaced);
    let got = store.get("app-android-test-1").await.unwrap().unwrap();
    assert_eq!(got, out.record);
    assert_eq!(got.retention_days, 30);
    assert_eq!((got.expires_at - got.uploaded_at).num_days(), 30);
}

#[tokio::test]
async fn artifact_reupload_overwrites() {
    let store = MemoryArtifactStore::new();
    store.upload(upload("app-android-test-1", 1)).await.unwrap();
    let second = store.upload(upload("app-android-test-1", 1)).await.unwrap();

    assert!(second.replaced);
    assert_eq!(store.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn artifact_list_sorted_by_name() {
    let store = MemoryArtifactStore::new();
    store.upload(upload("b", 2)).await.unwrap();
    store.upload(upload("a", 1)).await.unwrap();

    let names: Vec<String> = store
        .list()
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.name)
        .collect();
    assert_eq!(names, vec!["a", "b"]);
}

// ===========================================================================
// ReleaseStore
// ===========================================================================

#[tokio::test]
async fn release_publish_is_idempotent_by_tag() {
    let store = MemoryReleaseStore::new();
    let first = store.publish(draft("v1.0-test-20260101-build1", 1)).await.unwrap();
    let second = store.publish(draft("v1.0-test-20260101-build1", 1)).await.unwrap();

    assert!(!first.replaced);
    assert!(second.replaced);
    assert_eq!(store.list().await.unwrap().len(), 1);
    assert!(store
        .get("v1.0-test-20260101-build1")
        .await
        .unwrap()
        .unwrap()
        .prerelease);
}

#[tokio::test]
async fn release_get_missing_is_none() {
    let store = MemoryReleaseStore::new();
    assert!(store.get("nope").await.unwrap().is_none());
}

// ===========================================================================
// CacheStore
// ===========================================================================

fn entry(key: &str, owner: &str) -> CacheEntry {
    CacheEntry {
        key: key.to_string(),
        paths: vec!["~/.gradle/caches".to_string()],
        owner: owner.to_string(),
        committed_at: Utc::now(),
    }
}

#[tokio::test]
async fn cache_uncommitted_entry_is_invisible() {
    let cache = MemoryCacheStore::new();
    cache.acquire("gradle-linux-1", "run-a").await.unwrap();

    assert!(cache.lookup("gradle-linux-1").await.unwrap().is_none());
    assert_eq!(
        cache.lock_owner("gradle-linux-1").await.unwrap().as_deref(),
        Some("run-a")
    );
}

#[tokio::test]
async fn cache_lock_is_exclusive() {
    let cache = MemoryCacheStore::new();
    cache.acquire("k", "run-a").await.unwrap();
    // Re-entrant for the same owner.
    cache.acquire("k", "run-a").await.unwrap();

    let err = cache.acquire("k", "run-b").await.unwrap_err();
    assert!(matches!(err, StorageError::LockHeld { owner, .. } if owner == "run-a"));
}

#[tokio::test]
async fn cache_commit_requires_lock() {
    let cache = MemoryCacheStore::new();
    let err = cache.commit(entry("k", "run-a")).await.unwrap_err();
    assert!(matches!(err, StorageError::LockNotHeld { .. }));
}

#[tokio::test]
async fn cache_commit_marks_valid_and_unlocks() {
    let cache = MemoryCacheStore::new();
    cache.acquire("k", "run-a").await.unwrap();
    cache.commit(entry("k", "run-a")).await.unwrap();

    assert!(cache.lookup("k").await.unwrap().is_some());
    assert!(cache.lock_owner("k").await.unwrap().is_none());
}

#[tokio::test]
async fn cache_committed_entry_is_immutable() {
    let cache = MemoryCacheStore::new();
    cache.acquire("k", "run-a").await.unwrap();
    cache.commit(entry("k", "run-a")).await.unwrap();

    let err = cache.acquire("k", "run-b").await.unwrap_err();
    assert!(matches!(err, StorageError::AlreadyCommitted { .. }));
}

#[tokio::test]
async fn cache_release_leaves_no_entry() {
    let cache = MemoryCacheStore::new();
    cache.acquire("k", "run-a").await.unwrap();
    cache.release("k", "run-a").await.unwrap();

    assert!(cache.lookup("k").await.unwrap().is_none());
    assert!(cache.lock_owner("k").await.unwrap().is_none());
    // Releasing an unlocked key is a no-op.
    cache.release("k", "run-a").await.unwrap();
}

#[tokio::test]
async fn cache_release_by_non_owner_fails() {
    let cache = MemoryCacheStore::new();
    cache.acquire("k", "run-a").await.unwrap();
    let err = cache.release("k", "run-b").await.unwrap_err();
    assert!(matches!(err, StorageError::LockNotHeld { .. }));
}

// ===========================================================================
// BuildNumberLedger
// ===========================================================================

#[tokio::test]
async fn ledger_starts_at_one() {
    let ledger = MemoryBuildLedger::new();
    assert_eq!(ledger.next_available().await.unwrap(), 1);
}

#[tokio::test]
async fn ledger_next_exceeds_every_claim() {
    let ledger = MemoryBuildLedger::new();
    ledger.claim(41, "run-a").await.unwrap();
    ledger.claim(3, "run-b").await.unwrap();

    assert_eq!(ledger.next_available().await.unwrap(), 42);
}

#[tokio::test]
async fn ledger_double_claim_conflicts() {
    let ledger = MemoryBuildLedger::new();
    ledger.claim(7, "run-a").await.unwrap();
    let err = ledger.claim(7, "run-b").await.unwrap_err();

    assert!(matches!(
        err,
        StorageError::NumberClaimed { build_number: 7, .. }
    ));
    assert_eq!(ledger.owner_of(7).await.unwrap().as_deref(), Some("run-a"));
}

// ===========================================================================
// CommentSink
// ===========================================================================

#[tokio::test]
async fn comments_are_scoped_per_pr() {
    let sink = MemoryCommentSink::new();
    sink.upsert(1, "build-1", "a").await.unwrap();
    sink.upsert(2, "build-1", "b").await.unwrap();
    let replaced = sink.upsert(1, "build-1", "c").await.unwrap();

    assert!(replaced.replaced);
    let pr1 = sink.list(1).await.unwrap();
    assert_eq!(pr1.len(), 1);
    assert_eq!(pr1[0].body, "c");
    assert_eq!(sink.list(2).await.unwrap().len(), 1);
}

// ===========================================================================
// RunStore
// ===========================================================================

#[tokio::test]
async fn newest_run_owns_the_slot() {
    let runs = MemoryRunStore::new();
    assert!(runs.supersede("main", "run-a").await.unwrap().is_none());
    let previous = runs.supersede("main", "run-b").await.unwrap().unwrap();

    assert_eq!(previous.run_id, "run-a");
    assert_eq!(runs.current("main").await.unwrap().unwrap().run_id, "run-b");
    assert!(runs.current("feature-x#7").await.unwrap().is_none());
}

#[tokio::test]
async fn dispatch_claim_until_released() {
    let runs = MemoryRunStore::new();
    assert!(runs.claim_dispatch("abc:push").await.unwrap());
    assert!(!runs.claim_dispatch("abc:push").await.unwrap());
    assert!(runs.claim_dispatch("abc:pull_request").await.unwrap());

    runs.release_dispatch("abc:push").await.unwrap();
    assert!(runs.claim_dispatch("abc:push").await.unwrap());
}
