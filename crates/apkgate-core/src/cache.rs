//! Provenance-gated build cache sessions.
//!
//! Cache keys are `{name}-{os}-{fingerprint}`, where the fingerprint hashes
//! the configured lockfiles. Reads are open to every run. Writes need the
//! [`CacheAccess::ReadWrite`] capability, which only trusted runs receive.
//!
//! A write goes through three steps: `reserve` takes the store's per-key
//! lock before the build, `commit` marks the entry valid after a successful
//! build, and `abandon` drops the lock without marking anything when the run
//! fails or is cancelled.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use apkgate_store::{CacheEntry, CacheStore, ContentDigest, StorageError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::error::{BuildError, Result};
use crate::event::Provenance;

/// Capability granted to a run for shared caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheAccess {
    ReadOnly,
    ReadWrite,
}

impl CacheAccess {
    pub fn for_provenance(provenance: Provenance) -> Self {
        match provenance {
            Provenance::Trusted => CacheAccess::ReadWrite,
            Provenance::Untrusted => CacheAccess::ReadOnly,
        }
    }

    pub fn can_write(&self) -> bool {
        matches!(self, CacheAccess::ReadWrite)
    }
}

/// Hash the fingerprint files, sorted by path.
///
/// Each file contributes its path and contents; a missing file contributes
/// its path and a marker so adding the file later changes the key.
pub async fn fingerprint(workspace: &Path, files: &[PathBuf]) -> Result<ContentDigest> {
    let mut sorted: Vec<&PathBuf> = files.iter().collect();
    sorted.sort();

    let mut hasher = Sha256::new();
    for rel in sorted {
        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update(b"\0");
        match tokio::fs::read(workspace.join(rel)).await {
            Ok(bytes) => {
                hasher.update((bytes.len() as u64).to_le_bytes());
                hasher.update(&bytes);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                hasher.update(b"<missing>");
            }
            Err(e) => return Err(e.into()),
        }
        hasher.update(b"\0");
    }
    let mut output = [0u8; 32];
    output.copy_from_slice(&hasher.finalize());
    Ok(ContentDigest::from_hash_output(&output))
}

/// `{name}-{os}-{fingerprint}`
pub fn cache_key(name: &str, os: &str, fingerprint: &ContentDigest) -> String {
    format!("{name}-{os}-{fingerprint}")
}

/// Per-run handle on one cache key.
pub struct CacheSession {
    store: Arc<dyn CacheStore>,
    access: CacheAccess,
    owner: String,
    name: String,
    key: String,
    paths: Vec<String>,
    hit: bool,
    reserved: bool,
}

impl CacheSession {
    /// Compute the key for `config` and bind it to `owner` (the run id).
    pub async fn open(
        store: Arc<dyn CacheStore>,
        config: &CacheConfig,
        os: &str,
        workspace: &Path,
        access: CacheAccess,
        owner: impl Into<String>,
    ) -> Result<Self> {
        let fp = fingerprint(workspace, &config.fingerprint_files).await?;
        Ok(Self {
            store,
            access,
            owner: owner.into(),
            name: config.name.clone(),
            key: cache_key(&config.name, os, &fp),
            paths: config.paths.clone(),
            hit: false,
            reserved: false,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_hit(&self) -> bool {
        self.hit
    }

    pub fn is_reserved(&self) -> bool {
        self.reserved
    }

    /// Look the key up. Always allowed.
    pub async fn restore(&mut self) -> Result<bool> {
        self.hit = self.store.lookup(&self.key).await?.is_some();
        info!(cache = %self.name, key = %self.key, hit = self.hit, "cache restore");
        Ok(self.hit)
    }

    /// Take the write lock for a later `commit`.
    ///
    /// Returns `Ok(false)` when there is nothing to write (entry already
    /// valid) or another run holds the lock. Read-only sessions get
    /// `CacheWriteDenied`.
    pub async fn reserve(&mut self) -> Result<bool> {
        if !self.access.can_write() {
            return Err(BuildError::CacheWriteDenied {
                key: self.key.clone(),
            });
        }
        if self.hit {
            return Ok(false);
        }
        match self.store.acquire(&self.key, &self.owner).await {
            Ok(()) => {
                self.reserved = true;
                debug!(cache = %self.name, key = %self.key, "cache write reserved");
                Ok(true)
            }
            Err(StorageError::AlreadyCommitted { .. }) => {
                self.hit = true;
                Ok(false)
            }
            Err(StorageError::LockHeld { owner, .. }) => {
                warn!(cache = %self.name, key = %self.key, holder = %owner, "cache key locked by another run, skipping save");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Mark the entry valid and release the lock. No-op unless reserved.
    pub async fn commit(&mut self) -> Result<bool> {
        if !self.reserved {
            return Ok(false);
        }
        self.store
            .commit(CacheEntry {
                key: self.key.clone(),
                paths: self.paths.clone(),
                owner: self.owner.clone(),
                committed_at: Utc::now(),
            })
            .await?;
        self.reserved = false;
        info!(cache = %self.name, key = %self.key, "cache saved");
        Ok(true)
    }

    /// Release the lock without marking the entry valid.
    pub async fn abandon(&mut self) -> Result<()> {
        if !self.reserved {
            return Ok(());
        }
        self.store.release(&self.key, &self.owner).await?;
        self.reserved = false;
        info!(cache = %self.name, key = %self.key, "cache write abandoned");
        Ok(())
    }
}
