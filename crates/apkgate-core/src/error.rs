//! Error taxonomy for apkgate.

use apkgate_store::StorageError;

/// Errors produced while building rule sets.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("invalid path pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// Errors produced while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error(transparent)]
    Gate(#[from] GateError),
}

/// Failures of a single build run.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// A delegated external step failed. Not retried; re-trigger to retry.
    #[error("step '{step_name}' failed (see {diagnostic_ref})")]
    StepFailed {
        step_name: String,
        diagnostic_ref: String,
    },

    /// The run exceeded its time bound.
    #[error("build timed out after {limit_secs}s")]
    Timeout { limit_secs: u64 },

    /// The build number was already claimed by another run.
    #[error("build number {build_number} is already in use")]
    NumberConflict { build_number: u64 },

    /// Manual release name contains characters outside the tag-safe set.
    #[error("invalid release name {name:?}: {reason}")]
    InvalidReleaseName { name: String, reason: String },

    /// The trigger is missing data its event type requires.
    #[error("invalid event: {reason}")]
    InvalidEvent { reason: String },

    /// Untrusted run attempted a cache write. Non-fatal.
    #[error("cache write denied for key {key}")]
    CacheWriteDenied { key: String },

    /// Superseded by a newer run for the same branch/change request.
    #[error("run cancelled by a newer trigger")]
    Cancelled,

    /// Packaging succeeded but no APK matched the output convention.
    #[error("no artifact matched {pattern}")]
    ArtifactMissing { pattern: String },

    /// Two independent hash passes disagreed (partial write).
    #[error("artifact hash mismatch: {first} != {second}")]
    IntegrityMismatch { first: String, second: String },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BuildError {
    /// Whether the run must stop. Only cache-write denial is survivable.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, BuildError::CacheWriteDenied { .. })
    }

    /// Short stable identifier used in logs and change-request comments.
    pub fn kind(&self) -> &'static str {
        match self {
            BuildError::StepFailed { .. } => "step_failed",
            BuildError::Timeout { .. } => "timeout",
            BuildError::NumberConflict { .. } => "number_conflict",
            BuildError::InvalidReleaseName { .. } => "invalid_release_name",
            BuildError::InvalidEvent { .. } => "invalid_event",
            BuildError::CacheWriteDenied { .. } => "cache_write_denied",
            BuildError::Cancelled => "cancelled",
            BuildError::ArtifactMissing { .. } => "artifact_missing",
            BuildError::IntegrityMismatch { .. } => "integrity_mismatch",
            BuildError::Storage(_) => "storage",
            BuildError::Io(_) => "io",
        }
    }
}

/// Result type for build and publish operations.
pub type Result<T> = std::result::Result<T, BuildError>;
