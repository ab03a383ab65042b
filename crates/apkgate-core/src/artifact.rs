//! Build artifact descriptor, hashing and APK discovery.

use std::path::{Path, PathBuf};

use apkgate_store::ContentDigest;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::warn;

use crate::error::{BuildError, Result};

const HASH_CHUNK: usize = 64 * 1024;

/// Build variant produced by the packaging step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Flavor {
    #[default]
    DebugFdroid,
}

impl Flavor {
    /// Product flavor directory under the APK output root.
    pub fn product_dir(&self) -> &'static str {
        match self {
            Flavor::DebugFdroid => "fdroid",
        }
    }

    /// Build type directory below the product flavor.
    pub fn build_type_dir(&self) -> &'static str {
        match self {
            Flavor::DebugFdroid => "debug",
        }
    }

    /// Directory that holds the packaged APKs, relative to the output root.
    pub fn output_subdir(&self) -> PathBuf {
        Path::new(self.product_dir()).join(self.build_type_dir())
    }

    /// Glob describing the expected binary location.
    pub fn output_pattern(&self) -> String {
        format!("{}/{}/*.apk", self.product_dir(), self.build_type_dir())
    }
}

/// Descriptor of a successfully built binary. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildArtifact {
    pub binary_path: PathBuf,
    pub size_bytes: u64,
    pub sha256: ContentDigest,
    pub build_number: u64,
    pub flavor: Flavor,
    /// UTC date the build number was claimed; release tags use it
    pub built_on: NaiveDate,
}

impl BuildArtifact {
    /// File name of the binary (falls back to `app.apk`).
    pub fn file_name(&self) -> String {
        self.binary_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "app.apk".to_string())
    }

    /// Size in megabytes, two decimals.
    pub fn size_mb(&self) -> String {
        format!("{:.2}", self.size_bytes as f64 / (1024.0 * 1024.0))
    }
}

/// Stream a file through SHA-256. Returns the digest and byte count.
pub async fn hash_file(path: &Path) -> Result<(ContentDigest, u64)> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    let mut output = [0u8; 32];
    output.copy_from_slice(&hasher.finalize());
    Ok((ContentDigest::from_hash_output(&output), total))
}

/// Hash twice with independent reads and require agreement.
///
/// A disagreement means the file changed underneath us, usually a writer that
/// had not finished.
pub async fn verified_hash(path: &Path) -> Result<(ContentDigest, u64)> {
    let (first, first_len) = hash_file(path).await?;
    let (second, second_len) = hash_file(path).await?;
    if first != second || first_len != second_len {
        return Err(BuildError::IntegrityMismatch {
            first: first.to_string(),
            second: second.to_string(),
        });
    }
    Ok((first, first_len))
}

/// Find the packaged APK under `{output_root}/{flavor}/debug/*.apk`.
///
/// With several candidates the lexicographically last is chosen.
pub async fn locate_apk(output_root: &Path, flavor: Flavor) -> Result<PathBuf> {
    let dir = output_root.join(flavor.output_subdir());
    let pattern = output_root.join(flavor.output_pattern());
    let missing = || BuildError::ArtifactMissing {
        pattern: pattern.to_string_lossy().into_owned(),
    };

    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(missing()),
        Err(e) => return Err(e.into()),
    };

    let mut candidates = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_file() && path.extension().is_some_and(|e| e == "apk") {
            candidates.push(path);
        }
    }
    candidates.sort();

    if candidates.len() > 1 {
        warn!(count = candidates.len(), dir = %dir.display(), "multiple APKs found, using the last");
    }
    candidates.pop().ok_or_else(missing)
}
