//! Pipeline configuration, loaded from TOML.
//!
//! Every field has a default, so an empty file (or no file) yields a working
//! configuration for a stock Capacitor project named `app`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::artifact::Flavor;
use crate::error::ConfigError;
use crate::gate::{RuleSet, DEFAULT_PATH_RULES};
use crate::stage::{default_steps, StepConfig};

/// Default run-level timeout.
pub const DEFAULT_TIMEOUT_MINUTES: u64 = 45;

/// Longest run-level timeout accepted.
pub const MAX_TIMEOUT_MINUTES: u64 = 24 * 60;

/// How often a run checks the shared run store for a newer run.
pub const DEFAULT_SUPERSEDE_POLL_MS: u64 = 2_000;

/// Default artifact retention.
pub const DEFAULT_RETENTION_DAYS: u32 = 30;

/// A named, fingerprinted cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheConfig {
    /// Cache name, first component of the key
    pub name: String,
    /// Files whose contents determine the fingerprint
    pub fingerprint_files: Vec<PathBuf>,
    /// Paths the cache captures
    pub paths: Vec<String>,
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineConfig {
    pub app_name: String,
    pub app_version: String,
    pub flavor: Flavor,
    /// Branches whose pushes are trusted and release-eligible
    pub protected_branches: Vec<String>,
    /// Change-gate glob patterns
    pub path_rules: Vec<String>,
    /// Workspace root the steps run in
    pub workspace: PathBuf,
    /// APK output root, relative to the workspace
    pub output_dir: PathBuf,
    /// Where step logs are written, relative to the workspace
    pub log_dir: PathBuf,
    pub timeout_minutes: u64,
    pub retention_days: u32,
    /// Poll interval for runs superseded by another process
    pub supersede_poll_ms: u64,
    /// OS component of cache keys
    pub cache_os: String,
    /// Base URL used for download links in summaries
    pub artifact_base_url: Option<String>,
    pub steps: Vec<StepConfig>,
    pub caches: Vec<CacheConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            app_name: "app".to_string(),
            app_version: "1.0".to_string(),
            flavor: Flavor::default(),
            protected_branches: vec!["main".to_string()],
            path_rules: DEFAULT_PATH_RULES.iter().map(|s| s.to_string()).collect(),
            workspace: PathBuf::from("."),
            output_dir: PathBuf::from("android/app/build/outputs/apk"),
            log_dir: PathBuf::from(".apkgate/logs"),
            timeout_minutes: DEFAULT_TIMEOUT_MINUTES,
            retention_days: DEFAULT_RETENTION_DAYS,
            supersede_poll_ms: DEFAULT_SUPERSEDE_POLL_MS,
            cache_os: std::env::consts::OS.to_string(),
            artifact_base_url: None,
            steps: default_steps(),
            caches: default_caches(),
        }
    }
}

/// npm dependencies and Gradle caches, as in the stock workflow.
pub fn default_caches() -> Vec<CacheConfig> {
    vec![
        CacheConfig {
            name: "npm".to_string(),
            fingerprint_files: vec![PathBuf::from("package-lock.json")],
            paths: vec!["node_modules".to_string()],
        },
        CacheConfig {
            name: "gradle".to_string(),
            fingerprint_files: vec![
                PathBuf::from("android/build.gradle"),
                PathBuf::from("android/app/build.gradle"),
                PathBuf::from("android/gradle/wrapper/gradle-wrapper.properties"),
            ],
            paths: vec![
                "~/.gradle/caches".to_string(),
                "~/.gradle/wrapper".to_string(),
            ],
        },
    ]
}

impl PipelineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file. Relative `workspace` paths resolve against the
    /// file's directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut config = Self::from_toml_str(&raw)?;
        if config.workspace.is_relative() {
            if let Some(parent) = path.parent() {
                config.workspace = parent.join(&config.workspace);
            }
        }
        Ok(config)
    }

    /// Check invariants that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.app_name.trim().is_empty() {
            return Err(ConfigError::Invalid("app_name must not be empty".into()));
        }
        if self.app_version.trim().is_empty() {
            return Err(ConfigError::Invalid("app_version must not be empty".into()));
        }
        if self.timeout_minutes == 0 || self.timeout_minutes > MAX_TIMEOUT_MINUTES {
            return Err(ConfigError::Invalid(format!(
                "timeout_minutes must be between 1 and {MAX_TIMEOUT_MINUTES}"
            )));
        }
        if self.supersede_poll_ms == 0 {
            return Err(ConfigError::Invalid("supersede_poll_ms must be > 0".into()));
        }
        if self.retention_days == 0 {
            return Err(ConfigError::Invalid("retention_days must be > 0".into()));
        }
        if let Some(step) = self.steps.iter().find(|s| s.command.is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "step '{}' has an empty command",
                step.name
            )));
        }
        self.rule_set()?;
        Ok(())
    }

    /// Compile `path_rules`.
    pub fn rule_set(&self) -> Result<RuleSet, ConfigError> {
        Ok(RuleSet::new(&self.path_rules)?)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_minutes.saturating_mul(60))
    }

    pub fn supersede_poll(&self) -> Duration {
        Duration::from_millis(self.supersede_poll_ms)
    }

    pub fn output_root(&self) -> PathBuf {
        self.workspace.join(&self.output_dir)
    }

    pub fn log_root(&self) -> PathBuf {
        self.workspace.join(&self.log_dir)
    }

    pub fn is_protected(&self, branch: &str) -> bool {
        self.protected_branches.iter().any(|b| b == branch)
    }
}
