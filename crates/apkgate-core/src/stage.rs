//! Build step definitions and configuration.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The fixed build sequence, in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BuiltinStep {
    /// npm ci
    InstallDependencies,

    /// npm run build
    BuildFrontend,

    /// npx cap sync android
    SyncNative,

    /// ./gradlew assembleFdroidDebug
    PackageNative,
}

impl BuiltinStep {
    /// All steps in execution order.
    pub const SEQUENCE: [BuiltinStep; 4] = [
        BuiltinStep::InstallDependencies,
        BuiltinStep::BuildFrontend,
        BuiltinStep::SyncNative,
        BuiltinStep::PackageNative,
    ];

    /// Get the step name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            BuiltinStep::InstallDependencies => "install_dependencies",
            BuiltinStep::BuildFrontend => "build_frontend",
            BuiltinStep::SyncNative => "sync_native",
            BuiltinStep::PackageNative => "package_native",
        }
    }

    /// Get the step's command.
    pub fn command(&self) -> Vec<String> {
        let argv: &[&str] = match self {
            BuiltinStep::InstallDependencies => &["npm", "ci", "--prefer-offline", "--no-audit"],
            BuiltinStep::BuildFrontend => &["npm", "run", "build"],
            BuiltinStep::SyncNative => &["npx", "cap", "sync", "android"],
            BuiltinStep::PackageNative => &["./gradlew", "assembleFdroidDebug", "--build-cache"],
        };
        argv.iter().map(|s| s.to_string()).collect()
    }

    /// Directory the command runs in, relative to the workspace.
    pub fn working_dir(&self) -> Option<PathBuf> {
        match self {
            BuiltinStep::PackageNative => Some(PathBuf::from("android")),
            _ => None,
        }
    }

    /// Default per-step timeout in seconds.
    pub fn default_timeout_secs(&self) -> u64 {
        match self {
            BuiltinStep::InstallDependencies => 10 * 60,
            BuiltinStep::BuildFrontend => 10 * 60,
            BuiltinStep::SyncNative => 5 * 60,
            BuiltinStep::PackageNative => 30 * 60,
        }
    }
}

/// Configuration for a build step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepConfig {
    /// Step name, used in logs and `StepFailed` errors.
    pub name: String,

    /// Command to execute (first element is executable).
    pub command: Vec<String>,

    /// Working directory relative to the workspace root.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Extra environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Timeout in seconds (0 = bounded only by the run timeout).
    #[serde(default)]
    pub timeout_secs: u64,

    /// Whether this step is enabled.
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

fn enabled_default() -> bool {
    true
}

impl StepConfig {
    /// Create a step configuration from a builtin step.
    pub fn from_builtin(step: BuiltinStep) -> Self {
        Self {
            name: step.name().to_string(),
            command: step.command(),
            working_dir: step.working_dir(),
            env: BTreeMap::new(),
            timeout_secs: step.default_timeout_secs(),
            enabled: true,
        }
    }

    /// Create a custom step configuration.
    pub fn custom(name: impl Into<String>, command: Vec<String>, timeout_secs: u64) -> Self {
        Self {
            name: name.into(),
            command,
            working_dir: None,
            env: BTreeMap::new(),
            timeout_secs,
            enabled: true,
        }
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Disable this step.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// The stock step sequence.
pub fn default_steps() -> Vec<StepConfig> {
    BuiltinStep::SEQUENCE
        .iter()
        .map(|s| StepConfig::from_builtin(*s))
        .collect()
}
