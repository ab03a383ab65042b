//! File-backed store implementations.
//!
//! Layout under a state directory:
//!
//! ```text
//! <root>/artifacts/<name>/<file>            uploaded binary
//! <root>/artifacts/<name>/artifact.json     ArtifactRecord
//! <root>/releases/<tag>/<asset>             release asset
//! <root>/releases/<tag>/release.json        ReleaseRecord
//! <root>/cache/entries/<key>.json           committed CacheEntry
//! <root>/cache/locks/<key>.lock             lock file, owner and acquired_at
//! <root>/build-numbers/<n>                  claim file, contains owner
//! <root>/comments/pr-<n>/<key>.json         CommentRecord
//! <root>/runs/current/<sha256(key)>.json    RunSlot
//! <root>/runs/dispatched/<sha256(key)>      dispatch marker
//! ```
//!
//! Locks, claims and dispatch markers are created with `create_new`, so two
//! processes sharing a state directory cannot both win. A cache lock left by
//! a process that died can be taken over once it is older than the store's
//! `stale_after` window.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::error::StorageError;
use crate::storage_traits::*;

/// Reject keys that would escape their directory.
fn path_component(key: &str) -> StorageResult<&str> {
    if key.is_empty()
        || key == "."
        || key == ".."
        || key.contains(['/', '\\', '\0'])
    {
        return Err(StorageError::InvalidKey {
            key: key.to_string(),
        });
    }
    Ok(key)
}

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Atomic JSON write: write a uniquely named sibling temp file, then rename.
async fn write_json<T: Serialize>(path: &Path, value: &T) -> StorageResult<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension(format!(
        "json.{}-{}.tmp",
        std::process::id(),
        TMP_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    fs::write(&tmp, &bytes).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> StorageResult<Option<T>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Create `path` exclusively and write `contents`. Returns false if it exists.
async fn create_exclusive(path: &Path, contents: &str) -> StorageResult<bool> {
    let opened = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await;
    match opened {
        Ok(mut file) => {
            file.write_all(contents.as_bytes()).await?;
            file.flush().await?;
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.into()),
    }
}

async fn remove_if_exists(path: &Path) -> StorageResult<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn read_optional_string(path: &Path) -> StorageResult<Option<String>> {
    match fs::read_to_string(path).await {
        Ok(s) => Ok(Some(s.trim().to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Every `<dir>/*/<manifest>` parsed as `T`.
async fn read_manifests<T: DeserializeOwned>(dir: &Path, manifest: &str) -> StorageResult<Vec<T>> {
    let mut out = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            if let Some(record) = read_json(&entry.path().join(manifest)).await? {
                out.push(record);
            }
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// FsArtifactStore
// ---------------------------------------------------------------------------

/// Artifact store rooted at `<root>/artifacts`.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    dir: PathBuf,
}

impl FsArtifactStore {
    /// Open the store, creating `<root>/artifacts` if needed.
    pub async fn open(root: impl AsRef<Path>) -> StorageResult<Self> {
        let dir = root.as_ref().join("artifacts");
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn upload(&self, upload: ArtifactUpload) -> StorageResult<Upserted<ArtifactRecord>> {
        let slot = self.dir.join(path_component(&upload.name)?);
        let replaced = fs::try_exists(&slot).await?;
        if replaced {
            info!(name = %upload.name, "replacing existing artifact");
            fs::remove_dir_all(&slot).await?;
        }
        fs::create_dir_all(&slot).await?;

        let file_name = upload
            .source_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{}.bin", upload.name));
        let target = slot.join(&file_name);
        fs::copy(&upload.source_path, &target).await?;

        let now = Utc::now();
        let record = ArtifactRecord {
            name: upload.name,
            location: target.to_string_lossy().into_owned(),
            size_bytes: upload.size_bytes,
            sha256: upload.sha256,
            build_number: upload.build_number,
            retention_days: upload.retention_days,
            uploaded_at: now,
            expires_at: now + Duration::days(i64::from(upload.retention_days)),
        };
        write_json(&slot.join("artifact.json"), &record).await?;
        Ok(Upserted { record, replaced })
    }

    async fn get(&self, name: &str) -> StorageResult<Option<ArtifactRecord>> {
        let slot = self.dir.join(path_component(name)?);
        read_json(&slot.join("artifact.json")).await
    }

    async fn list(&self) -> StorageResult<Vec<ArtifactRecord>> {
        let mut all: Vec<ArtifactRecord> = read_manifests(&self.dir, "artifact.json").await?;
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }
}

// ---------------------------------------------------------------------------
// FsReleaseStore
// ---------------------------------------------------------------------------

/// Release store rooted at `<root>/releases`.
#[derive(Debug, Clone)]
pub struct FsReleaseStore {
    dir: PathBuf,
}

impl FsReleaseStore {
    /// Open the store, creating `<root>/releases` if needed.
    pub async fn open(root: impl AsRef<Path>) -> StorageResult<Self> {
        let dir = root.as_ref().join("releases");
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }
}

#[async_trait]
impl ReleaseStore for FsReleaseStore {
    async fn publish(&self, draft: ReleaseDraft) -> StorageResult<Upserted<ReleaseRecord>> {
        let slot = self.dir.join(path_component(&draft.tag)?);
        let asset_name = path_component(&draft.asset_name)?.to_string();
        let replaced = fs::try_exists(slot.join("release.json")).await?;
        if replaced {
            info!(tag = %draft.tag, "replacing existing release");
        }
        fs::create_dir_all(&slot).await?;

        let target = slot.join(&asset_name);
        fs::copy(&draft.asset_path, &target).await?;

        let record = ReleaseRecord {
            tag: draft.tag,
            title: draft.title,
            body: draft.body,
            prerelease: draft.prerelease,
            asset_name,
            asset_location: target.to_string_lossy().into_owned(),
            sha256: draft.sha256,
            build_number: draft.build_number,
            published_at: Utc::now(),
        };
        write_json(&slot.join("release.json"), &record).await?;
        Ok(Upserted { record, replaced })
    }

    async fn get(&self, tag: &str) -> StorageResult<Option<ReleaseRecord>> {
        let slot = self.dir.join(path_component(tag)?);
        read_json(&slot.join("release.json")).await
    }

    async fn list(&self) -> StorageResult<Vec<ReleaseRecord>> {
        let mut all: Vec<ReleaseRecord> = read_manifests(&self.dir, "release.json").await?;
        all.sort_by(|a, b| {
            b.published_at
                .cmp(&a.published_at)
                .then(b.build_number.cmp(&a.build_number))
        });
        Ok(all)
    }
}

// ---------------------------------------------------------------------------
// FsCacheStore
// ---------------------------------------------------------------------------

/// Contents of a cache lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockRecord {
    owner: String,
    acquired_at: DateTime<Utc>,
}

/// Cache index rooted at `<root>/cache`.
///
/// Only the index and locks live here; cached directories stay where the
/// build tools put them.
#[derive(Debug, Clone)]
pub struct FsCacheStore {
    entries: PathBuf,
    locks: PathBuf,
    stale_after: Option<std::time::Duration>,
}

impl FsCacheStore {
    /// Open the store, creating `<root>/cache/{entries,locks}` if needed.
    pub async fn open(root: impl AsRef<Path>) -> StorageResult<Self> {
        let base = root.as_ref().join("cache");
        let entries = base.join("entries");
        let locks = base.join("locks");
        fs::create_dir_all(&entries).await?;
        fs::create_dir_all(&locks).await?;
        Ok(Self {
            entries,
            locks,
            stale_after: None,
        })
    }

    /// Let `acquire` take over locks held longer than `window`.
    pub fn with_stale_after(mut self, window: std::time::Duration) -> Self {
        self.stale_after = Some(window);
        self
    }

    fn entry_path(&self, key: &str) -> StorageResult<PathBuf> {
        Ok(self.entries.join(format!("{}.json", path_component(key)?)))
    }

    fn lock_path(&self, key: &str) -> StorageResult<PathBuf> {
        Ok(self.locks.join(format!("{}.lock", path_component(key)?)))
    }

    /// A lock that cannot be parsed is still being written; treat it as fresh.
    async fn read_lock(&self, path: &Path) -> StorageResult<Option<LockRecord>> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                LockRecord {
                    owner: String::new(),
                    acquired_at: Utc::now(),
                }
            }))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn is_stale(&self, lock: &LockRecord) -> bool {
        let Some(window) = self.stale_after else {
            return false;
        };
        Utc::now()
            .signed_duration_since(lock.acquired_at)
            .to_std()
            .is_ok_and(|age| age > window)
    }
}

#[async_trait]
impl CacheStore for FsCacheStore {
    async fn lookup(&self, key: &str) -> StorageResult<Option<CacheEntry>> {
        read_json(&self.entry_path(key)?).await
    }

    async fn acquire(&self, key: &str, owner: &str) -> StorageResult<()> {
        if fs::try_exists(self.entry_path(key)?).await? {
            return Err(StorageError::AlreadyCommitted {
                key: key.to_string(),
            });
        }
        let lock = self.lock_path(key)?;
        let contents = serde_json::to_string(&LockRecord {
            owner: owner.to_string(),
            acquired_at: Utc::now(),
        })?;
        if create_exclusive(&lock, &contents).await? {
            return Ok(());
        }
        let held = match self.read_lock(&lock).await? {
            Some(held) if held.owner == owner => return Ok(()),
            Some(held) if self.is_stale(&held) => held,
            Some(held) => {
                return Err(StorageError::LockHeld {
                    key: key.to_string(),
                    owner: held.owner,
                })
            }
            // Released between the two calls; caller may retry.
            None => {
                return Err(StorageError::LockHeld {
                    key: key.to_string(),
                    owner: String::new(),
                })
            }
        };

        warn!(
            key,
            stale_owner = %held.owner,
            acquired_at = %held.acquired_at,
            new_owner = owner,
            "taking over stale cache lock"
        );
        remove_if_exists(&lock).await?;
        if create_exclusive(&lock, &contents).await? {
            return Ok(());
        }
        Err(StorageError::LockHeld {
            key: key.to_string(),
            owner: self
                .read_lock(&lock)
                .await?
                .map(|l| l.owner)
                .unwrap_or_default(),
        })
    }

    async fn commit(&self, entry: CacheEntry) -> StorageResult<()> {
        let lock = self.lock_path(&entry.key)?;
        let held = self.read_lock(&lock).await?;
        if held.as_ref().map(|l| l.owner.as_str()) != Some(entry.owner.as_str()) {
            return Err(StorageError::LockNotHeld {
                key: entry.key,
                owner: entry.owner,
            });
        }
        write_json(&self.entry_path(&entry.key)?, &entry).await?;
        fs::remove_file(&lock).await?;
        Ok(())
    }

    async fn release(&self, key: &str, owner: &str) -> StorageResult<()> {
        let lock = self.lock_path(key)?;
        match self.read_lock(&lock).await? {
            None => Ok(()),
            Some(held) if held.owner == owner => remove_if_exists(&lock).await,
            Some(_) => Err(StorageError::LockNotHeld {
                key: key.to_string(),
                owner: owner.to_string(),
            }),
        }
    }

    async fn lock_owner(&self, key: &str) -> StorageResult<Option<String>> {
        let lock = self.lock_path(key)?;
        Ok(self.read_lock(&lock).await?.map(|l| l.owner))
    }
}

// ---------------------------------------------------------------------------
// FsBuildLedger
// ---------------------------------------------------------------------------

/// Build-number ledger rooted at `<root>/build-numbers`.
#[derive(Debug, Clone)]
pub struct FsBuildLedger {
    dir: PathBuf,
}

impl FsBuildLedger {
    /// Open the ledger, creating `<root>/build-numbers` if needed.
    pub async fn open(root: impl AsRef<Path>) -> StorageResult<Self> {
        let dir = root.as_ref().join("build-numbers");
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }
}

#[async_trait]
impl BuildNumberLedger for FsBuildLedger {
    async fn next_available(&self) -> StorageResult<u64> {
        let mut max = 0u64;
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(n) = entry
                .file_name()
                .to_str()
                .and_then(|s| s.parse::<u64>().ok())
            {
                max = max.max(n);
            }
        }
        Ok(max + 1)
    }

    async fn claim(&self, build_number: u64, owner: &str) -> StorageResult<()> {
        let path = self.dir.join(build_number.to_string());
        if create_exclusive(&path, owner).await? {
            return Ok(());
        }
        Err(StorageError::NumberClaimed {
            build_number,
            owner: read_optional_string(&path).await?.unwrap_or_default(),
        })
    }

    async fn owner_of(&self, build_number: u64) -> StorageResult<Option<String>> {
        read_optional_string(&self.dir.join(build_number.to_string())).await
    }
}

// ---------------------------------------------------------------------------
// FsCommentSink
// ---------------------------------------------------------------------------

/// Comment sink rooted at `<root>/comments`.
#[derive(Debug, Clone)]
pub struct FsCommentSink {
    dir: PathBuf,
}

impl FsCommentSink {
    /// Open the sink, creating `<root>/comments` if needed.
    pub async fn open(root: impl AsRef<Path>) -> StorageResult<Self> {
        let dir = root.as_ref().join("comments");
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn pr_dir(&self, pr_number: u64) -> PathBuf {
        self.dir.join(format!("pr-{pr_number}"))
    }
}

#[async_trait]
impl CommentSink for FsCommentSink {
    async fn upsert(
        &self,
        pr_number: u64,
        key: &str,
        body: &str,
    ) -> StorageResult<Upserted<CommentRecord>> {
        let dir = self.pr_dir(pr_number);
        fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{}.json", path_component(key)?));
        let replaced = fs::try_exists(&path).await?;
        let record = CommentRecord {
            pr_number,
            key: key.to_string(),
            body: body.to_string(),
            updated_at: Utc::now(),
        };
        write_json(&path, &record).await?;
        Ok(Upserted { record, replaced })
    }

    async fn list(&self, pr_number: u64) -> StorageResult<Vec<CommentRecord>> {
        let dir = self.pr_dir(pr_number);
        if !fs::try_exists(&dir).await? {
            return Ok(Vec::new());
        }
        let mut out: Vec<CommentRecord> = Vec::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "json") {
                if let Some(record) = read_json(&path).await? {
                    out.push(record);
                }
            }
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// FsRunStore
// ---------------------------------------------------------------------------

/// Run store rooted at `<root>/runs`.
///
/// Concurrency keys contain branch names, so files are named by the SHA-256
/// of the key.
#[derive(Debug, Clone)]
pub struct FsRunStore {
    current: PathBuf,
    dispatched: PathBuf,
}

impl FsRunStore {
    /// Open the store, creating `<root>/runs/{current,dispatched}` if needed.
    pub async fn open(root: impl AsRef<Path>) -> StorageResult<Self> {
        let base = root.as_ref().join("runs");
        let current = base.join("current");
        let dispatched = base.join("dispatched");
        fs::create_dir_all(&current).await?;
        fs::create_dir_all(&dispatched).await?;
        Ok(Self {
            current,
            dispatched,
        })
    }

    fn slot_path(&self, key: &str) -> PathBuf {
        let digest = ContentDigest::from_bytes(key.as_bytes());
        self.current.join(format!("{digest}.json"))
    }

    fn dispatch_path(&self, dispatch_key: &str) -> PathBuf {
        self.dispatched
            .join(ContentDigest::from_bytes(dispatch_key.as_bytes()).as_str())
    }
}

#[async_trait]
impl RunStore for FsRunStore {
    async fn supersede(&self, key: &str, run_id: &str) -> StorageResult<Option<RunSlot>> {
        let path = self.slot_path(key);
        let previous: Option<RunSlot> = read_json(&path).await?;
        let slot = RunSlot {
            key: key.to_string(),
            run_id: run_id.to_string(),
            started_at: Utc::now(),
        };
        write_json(&path, &slot).await?;
        Ok(previous)
    }

    async fn current(&self, key: &str) -> StorageResult<Option<RunSlot>> {
        read_json(&self.slot_path(key)).await
    }

    async fn claim_dispatch(&self, dispatch_key: &str) -> StorageResult<bool> {
        create_exclusive(&self.dispatch_path(dispatch_key), dispatch_key).await
    }

    async fn release_dispatch(&self, dispatch_key: &str) -> StorageResult<()> {
        remove_if_exists(&self.dispatch_path(dispatch_key)).await
    }
}
