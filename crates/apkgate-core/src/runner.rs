//! Build step execution.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::stage::StepConfig;

/// Result of a step execution.
#[derive(Debug, Clone)]
pub struct StepResult {
    /// Step name.
    pub step_name: String,

    /// Exit code (0 = success, -1 = killed by signal).
    pub exit_code: i32,

    /// Captured stdout.
    pub stdout: String,

    /// Captured stderr.
    pub stderr: String,

    /// Duration in milliseconds.
    pub duration_ms: u64,

    /// Whether execution succeeded.
    pub success: bool,
}

impl StepResult {
    /// Whether this step passed (exit code 0).
    pub fn passed(&self) -> bool {
        self.success && self.exit_code == 0
    }
}

/// Per-run inputs shared by every step.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Workspace root; step working dirs are relative to it.
    pub workspace: PathBuf,

    /// Environment added to every step (e.g. `BUILD_NUMBER`).
    pub env: BTreeMap<String, String>,
}

/// Executes one opaque build step.
///
/// Implementations must be cancel-safe: dropping the returned future stops
/// the step.
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// Run `step`. `Err` means the step could not be started at all.
    async fn run_step(&self, step: &StepConfig, ctx: &StepContext) -> std::io::Result<StepResult>;
}

/// Runs steps as child processes.
#[derive(Debug, Default, Clone)]
pub struct CommandStepRunner;

#[async_trait]
impl StepRunner for CommandStepRunner {
    async fn run_step(&self, step: &StepConfig, ctx: &StepContext) -> std::io::Result<StepResult> {
        let start = Instant::now();

        let (exe, args) = step.command.split_first().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("step {} has empty command", step.name),
            )
        })?;

        let cwd = match &step.working_dir {
            Some(dir) => ctx.workspace.join(dir),
            None => ctx.workspace.clone(),
        };
        debug!(step = %step.name, cwd = %cwd.display(), "spawning step");

        let child = Command::new(exe)
            .args(args)
            .current_dir(&cwd)
            .envs(&ctx.env)
            .envs(&step.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = child.wait_with_output().await?;

        let duration_ms = start.elapsed().as_millis() as u64;
        let exit_code = output.status.code().unwrap_or(-1);

        Ok(StepResult {
            step_name: step.name.clone(),
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms,
            success: output.status.success(),
        })
    }
}
