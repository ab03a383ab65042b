//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryArtifactStore`, `MemoryReleaseStore`, `MemoryCacheStore`,
//! `MemoryBuildLedger`, `MemoryCommentSink` and `MemoryRunStore` that satisfy
//! the trait contracts without touching the filesystem.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{Duration, Utc};

use crate::error::StorageError;
use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// MemoryArtifactStore
// ---------------------------------------------------------------------------

/// In-memory artifact store backed by a `BTreeMap<name, ArtifactRecord>`.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    artifacts: Mutex<BTreeMap<String, ArtifactRecord>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn upload(&self, upload: ArtifactUpload) -> StorageResult<Upserted<ArtifactRecord>> {
        let now = Utc::now();
        let record = ArtifactRecord {
            location: format!("memory://artifacts/{}", upload.name),
            name: upload.name,
            size_bytes: upload.size_bytes,
            sha256: upload.sha256,
            build_number: upload.build_number,
            retention_days: upload.retention_days,
            uploaded_at: now,
            expires_at: now + Duration::days(i64::from(upload.retention_days)),
        };
        let mut artifacts = self.artifacts.lock().unwrap();
        let replaced = artifacts
            .insert(record.name.clone(), record.clone())
            .is_some();
        Ok(Upserted { record, replaced })
    }

    async fn get(&self, name: &str) -> StorageResult<Option<ArtifactRecord>> {
        let artifacts = self.artifacts.lock().unwrap();
        Ok(artifacts.get(name).cloned())
    }

    async fn list(&self) -> StorageResult<Vec<ArtifactRecord>> {
        let artifacts = self.artifacts.lock().unwrap();
        Ok(artifacts.values().cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// MemoryReleaseStore
// ---------------------------------------------------------------------------

/// In-memory release store keyed by tag.
#[derive(Debug, Default)]
pub struct MemoryReleaseStore {
    releases: Mutex<HashMap<String, ReleaseRecord>>,
}

impl MemoryReleaseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReleaseStore for MemoryReleaseStore {
    async fn publish(&self, draft: ReleaseDraft) -> StorageResult<Upserted<ReleaseRecord>> {
        let record = ReleaseRecord {
            asset_location: format!("memory://releases/{}/{}", draft.tag, draft.asset_name),
            tag: draft.tag,
            title: draft.title,
            body: draft.body,
            prerelease: draft.prerelease,
            asset_name: draft.asset_name,
            sha256: draft.sha256,
            build_number: draft.build_number,
            published_at: Utc::now(),
        };
        let mut releases = self.releases.lock().unwrap();
        let replaced = releases
            .insert(record.tag.clone(), record.clone())
            .is_some();
        Ok(Upserted { record, replaced })
    }

    async fn get(&self, tag: &str) -> StorageResult<Option<ReleaseRecord>> {
        let releases = self.releases.lock().unwrap();
        Ok(releases.get(tag).cloned())
    }

    async fn list(&self) -> StorageResult<Vec<ReleaseRecord>> {
        let releases = self.releases.lock().unwrap();
        let mut all: Vec<ReleaseRecord> = releases.values().cloned().collect();
        all.sort_by(|a, b| {
            b.published_at
                .cmp(&a.published_at)
                .then(b.build_number.cmp(&a.build_number))
        });
        Ok(all)
    }
}

// ---------------------------------------------------------------------------
// MemoryCacheStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    locks: HashMap<String, String>,
}

/// In-memory cache store with per-key write locks.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    state: Mutex<CacheState>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn lookup(&self, key: &str) -> StorageResult<Option<CacheEntry>> {
        let state = self.state.lock().unwrap();
        Ok(state.entries.get(key).cloned())
    }

    async fn acquire(&self, key: &str, owner: &str) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.entries.contains_key(key) {
            return Err(StorageError::AlreadyCommitted {
                key: key.to_string(),
            });
        }
        match state.locks.get(key) {
            Some(holder) if holder != owner => Err(StorageError::LockHeld {
                key: key.to_string(),
                owner: holder.clone(),
            }),
            _ => {
                state.locks.insert(key.to_string(), owner.to_string());
                Ok(())
            }
        }
    }

    async fn commit(&self, entry: CacheEntry) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.locks.get(&entry.key) != Some(&entry.owner) {
            return Err(StorageError::LockNotHeld {
                key: entry.key,
                owner: entry.owner,
            });
        }
        state.locks.remove(&entry.key);
        state.entries.insert(entry.key.clone(), entry);
        Ok(())
    }

    async fn release(&self, key: &str, owner: &str) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        match state.locks.get(key) {
            None => Ok(()),
            Some(holder) if holder == owner => {
                state.locks.remove(key);
                Ok(())
            }
            Some(_) => Err(StorageError::LockNotHeld {
                key: key.to_string(),
                owner: owner.to_string(),
            }),
        }
    }

    async fn lock_owner(&self, key: &str) -> StorageResult<Option<String>> {
        let state = self.state.lock().unwrap();
        Ok(state.locks.get(key).cloned())
    }
}

// ---------------------------------------------------------------------------
// MemoryBuildLedger
// ---------------------------------------------------------------------------

/// In-memory build-number ledger.
#[derive(Debug, Default)]
pub struct MemoryBuildLedger {
    claimed: Mutex<BTreeMap<u64, String>>,
}

impl MemoryBuildLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BuildNumberLedger for MemoryBuildLedger {
    async fn next_available(&self) -> StorageResult<u64> {
        let claimed = self.claimed.lock().unwrap();
        Ok(claimed.keys().next_back().map_or(1, |n| n + 1))
    }

    async fn claim(&self, build_number: u64, owner: &str) -> StorageResult<()> {
        let mut claimed = self.claimed.lock().unwrap();
        if let Some(existing) = claimed.get(&build_number) {
            return Err(StorageError::NumberClaimed {
                build_number,
                owner: existing.clone(),
            });
        }
        claimed.insert(build_number, owner.to_string());
        Ok(())
    }

    async fn owner_of(&self, build_number: u64) -> StorageResult<Option<String>> {
        let claimed = self.claimed.lock().unwrap();
        Ok(claimed.get(&build_number).cloned())
    }
}

// ---------------------------------------------------------------------------
// MemoryCommentSink
// ---------------------------------------------------------------------------

/// In-memory comment sink keyed by `(pr_number, key)`.
#[derive(Debug, Default)]
pub struct MemoryCommentSink {
    comments: Mutex<BTreeMap<(u64, String), CommentRecord>>,
}

impl MemoryCommentSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CommentSink for MemoryCommentSink {
    async fn upsert(
        &self,
        pr_number: u64,
        key: &str,
        body: &str,
    ) -> StorageResult<Upserted<CommentRecord>> {
        let record = CommentRecord {
            pr_number,
            key: key.to_string(),
            body: body.to_string(),
            updated_at: Utc::now(),
        };
        let mut comments = self.comments.lock().unwrap();
        let replaced = comments
            .insert((pr_number, key.to_string()), record.clone())
            .is_some();
        Ok(Upserted { record, replaced })
    }

    async fn list(&self, pr_number: u64) -> StorageResult<Vec<CommentRecord>> {
        let comments = self.comments.lock().unwrap();
        Ok(comments
            .iter()
            .filter(|((pr, _), _)| *pr == pr_number)
            .map(|(_, c)| c.clone())
            .collect())
    }
}

// ---------------------------------------------------------------------------
// MemoryRunStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct RunState {
    slots: HashMap<String, RunSlot>,
    dispatched: HashSet<String>,
}

/// In-memory run store. Share one instance between pipelines to model
/// several processes working off the same state.
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    state: Mutex<RunState>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn supersede(&self, key: &str, run_id: &str) -> StorageResult<Option<RunSlot>> {
        let slot = RunSlot {
            key: key.to_string(),
            run_id: run_id.to_string(),
            started_at: Utc::now(),
        };
        let mut state = self.state.lock().unwrap();
        Ok(state.slots.insert(key.to_string(), slot))
    }

    async fn current(&self, key: &str) -> StorageResult<Option<RunSlot>> {
        let state = self.state.lock().unwrap();
        Ok(state.slots.get(key).cloned())
    }

    async fn claim_dispatch(&self, dispatch_key: &str) -> StorageResult<bool> {
        let mut state = self.state.lock().unwrap();
        Ok(state.dispatched.insert(dispatch_key.to_string()))
    }

    async fn release_dispatch(&self, dispatch_key: &str) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        state.dispatched.remove(dispatch_key);
        Ok(())
    }
}
