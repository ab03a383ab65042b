//! Build orchestration: one bounded, cancellable build attempt per event.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use apkgate_store::{BuildNumberLedger, CacheStore, RunStore, StorageError};
use chrono::{NaiveDate, Utc};
use tracing::{error, info, instrument, warn};

use crate::artifact::{locate_apk, verified_hash, BuildArtifact};
use crate::cache::{CacheAccess, CacheSession};
use crate::concurrency::{is_superseded, CancelSignal};
use crate::config::{CacheConfig, PipelineConfig};
use crate::error::{BuildError, Result};
use crate::event::{ChangeEvent, EventType};
use crate::naming::validate_release_name;
use crate::runner::{StepContext, StepResult, StepRunner};
use crate::stage::StepConfig;

/// Runs the fixed step sequence and produces a [`BuildArtifact`].
pub struct BuildOrchestrator {
    config: Arc<PipelineConfig>,
    runner: Arc<dyn StepRunner>,
    caches: Arc<dyn CacheStore>,
    ledger: Arc<dyn BuildNumberLedger>,
    runs: Arc<dyn RunStore>,
    build_date: Option<NaiveDate>,
}

impl BuildOrchestrator {
    pub fn new(
        config: Arc<PipelineConfig>,
        runner: Arc<dyn StepRunner>,
        caches: Arc<dyn CacheStore>,
        ledger: Arc<dyn BuildNumberLedger>,
        runs: Arc<dyn RunStore>,
    ) -> Self {
        Self {
            config,
            runner,
            caches,
            ledger,
            runs,
            build_date: None,
        }
    }

    /// Pin the date stamped on artifacts (defaults to today, UTC).
    pub fn with_build_date(mut self, date: NaiveDate) -> Self {
        self.build_date = Some(date);
        self
    }

    /// Input checks that must pass before anything runs.
    pub fn validate(event: &ChangeEvent) -> Result<()> {
        if event.event_type == EventType::PullRequest && event.pr_number.is_none() {
            return Err(BuildError::InvalidEvent {
                reason: "pull_request trigger without a change-request number".to_string(),
            });
        }
        if let Some(name) = &event.release_name_override {
            if event.event_type != EventType::Manual {
                return Err(BuildError::InvalidReleaseName {
                    name: name.clone(),
                    reason: "only manual triggers may set a release name".to_string(),
                });
            }
            validate_release_name(name)?;
        }
        Ok(())
    }

    /// Execute one build attempt.
    ///
    /// Order: validate, claim a build number, restore caches, run steps under
    /// the run timeout, locate and hash the APK, then commit or abandon the
    /// cache writes. A run that lost its slot in the run store to a newer run
    /// (possibly in another process) ends as `Cancelled` and commits nothing.
    #[instrument(skip_all, fields(run_id = %run_id, event = %event.event_type, branch = %event.branch))]
    pub async fn run(
        &self,
        event: &ChangeEvent,
        run_id: &str,
        mut cancel: CancelSignal,
    ) -> Result<BuildArtifact> {
        Self::validate(event)?;
        if cancel.is_cancelled() {
            return Err(BuildError::Cancelled);
        }

        let build_number = self.claim_build_number(event, run_id).await?;
        let built_on = self
            .build_date
            .unwrap_or_else(|| Utc::now().date_naive());
        info!(build_number, %built_on, "build number claimed");

        let provenance = event.provenance(&self.config.protected_branches);
        let access = CacheAccess::for_provenance(provenance);
        let mut sessions = self.open_caches(access, run_id).await?;

        let limit = self.config.run_timeout();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BuildError::Cancelled),
            res = tokio::time::timeout(limit, self.build(event, run_id, build_number, built_on)) => match res {
                Ok(inner) => inner,
                Err(_) => Err(BuildError::Timeout { limit_secs: limit.as_secs() }),
            },
        };
        // A run superseded after its last step still must not save caches.
        let outcome = match outcome {
            Ok(_) if cancel.is_cancelled() => Err(BuildError::Cancelled),
            Ok(artifact) => {
                match is_superseded(self.runs.as_ref(), &event.concurrency_key(), run_id).await {
                    Ok(false) => Ok(artifact),
                    Ok(true) => Err(BuildError::Cancelled),
                    Err(e) => Err(e),
                }
            }
            other => other,
        };

        match &outcome {
            Ok(artifact) => {
                for session in &mut sessions {
                    if let Err(e) = session.commit().await {
                        warn!(cache = %session.name(), error = %e, "cache commit failed");
                    }
                }
                info!(
                    build_number,
                    sha256 = %artifact.sha256,
                    size_bytes = artifact.size_bytes,
                    "build succeeded"
                );
            }
            Err(err) => {
                for session in &mut sessions {
                    if let Err(e) = session.abandon().await {
                        warn!(cache = %session.name(), error = %e, "cache abandon failed");
                    }
                }
                error!(build_number, kind = err.kind(), error = %err, "build failed");
            }
        }
        outcome
    }

    async fn claim_build_number(&self, event: &ChangeEvent, run_id: &str) -> Result<u64> {
        let build_number = match event.run_number {
            Some(n) => n,
            None => self.ledger.next_available().await?,
        };
        match self.ledger.claim(build_number, run_id).await {
            Ok(()) => Ok(build_number),
            Err(StorageError::NumberClaimed { build_number, .. }) => {
                Err(BuildError::NumberConflict { build_number })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Restore every cache and reserve writes. On error, locks already taken
    /// are abandoned.
    async fn open_caches(&self, access: CacheAccess, run_id: &str) -> Result<Vec<CacheSession>> {
        let mut sessions = Vec::with_capacity(self.config.caches.len());
        for cache in &self.config.caches {
            match self.open_cache(cache, access, run_id).await {
                Ok(session) => sessions.push(session),
                Err(err) => {
                    for session in &mut sessions {
                        if let Err(e) = session.abandon().await {
                            warn!(cache = %session.name(), error = %e, "cache abandon failed");
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(sessions)
    }

    async fn open_cache(
        &self,
        cache: &CacheConfig,
        access: CacheAccess,
        run_id: &str,
    ) -> Result<CacheSession> {
        let mut session = CacheSession::open(
            Arc::clone(&self.caches),
            cache,
            &self.config.cache_os,
            &self.config.workspace,
            access,
            run_id,
        )
        .await?;
        session.restore().await?;
        if !session.is_hit() {
            match session.reserve().await {
                Ok(_) => {}
                Err(e) if !e.is_fatal() => {
                    warn!(cache = %session.name(), error = %e, "running without cache write");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(session)
    }

    /// Steps, then APK discovery and hashing.
    async fn build(
        &self,
        event: &ChangeEvent,
        run_id: &str,
        build_number: u64,
        built_on: NaiveDate,
    ) -> Result<BuildArtifact> {
        let log_dir = self.config.log_root().join(format!("build-{build_number}"));
        tokio::fs::create_dir_all(&log_dir).await?;

        let ctx = StepContext {
            workspace: self.config.workspace.clone(),
            env: BTreeMap::from([
                ("CI".to_string(), "true".to_string()),
                ("BUILD_NUMBER".to_string(), build_number.to_string()),
                ("APKGATE_RUN_ID".to_string(), run_id.to_string()),
                ("APKGATE_EVENT".to_string(), event.event_type.to_string()),
                ("APKGATE_BRANCH".to_string(), event.branch.clone()),
                ("APKGATE_COMMIT".to_string(), event.commit_sha.clone()),
            ]),
        };

        for step in &self.config.steps {
            if !step.enabled {
                info!(step = %step.name, "Skipping disabled step");
                continue;
            }
            self.execute_step(step, &ctx, &log_dir).await?;
        }

        let binary_path = locate_apk(&self.config.output_root(), self.config.flavor).await?;
        let (sha256, size_bytes) = verified_hash(&binary_path).await?;

        Ok(BuildArtifact {
            binary_path,
            size_bytes,
            sha256,
            build_number,
            flavor: self.config.flavor,
            built_on,
        })
    }

    async fn execute_step(&self, step: &StepConfig, ctx: &StepContext, log_dir: &Path) -> Result<()> {
        info!(step = %step.name, "Executing step");
        let start = Instant::now();
        let log_path = log_dir.join(format!("{}.log", step.name));

        let run = self.runner.run_step(step, ctx);
        let result = if step.timeout_secs > 0 {
            match tokio::time::timeout(Duration::from_secs(step.timeout_secs), run).await {
                Ok(r) => r,
                Err(_) => {
                    write_log(&log_path, step, None, Some("step timed out")).await?;
                    return Err(BuildError::Timeout {
                        limit_secs: step.timeout_secs,
                    });
                }
            }
        } else {
            run.await
        };

        match result {
            Ok(r) if r.passed() => {
                write_log(&log_path, step, Some(&r), None).await?;
                info!(step = %step.name, duration_ms = r.duration_ms, "Step passed");
                Ok(())
            }
            Ok(r) => {
                write_log(&log_path, step, Some(&r), None).await?;
                Err(step_failed(step, &log_path))
            }
            Err(e) => {
                let reason = format!("failed to start after {}ms: {e}", start.elapsed().as_millis());
                write_log(&log_path, step, None, Some(&reason)).await?;
                Err(step_failed(step, &log_path))
            }
        }
    }
}

fn step_failed(step: &StepConfig, log_path: &Path) -> BuildError {
    BuildError::StepFailed {
        step_name: step.name.clone(),
        diagnostic_ref: log_path.display().to_string(),
    }
}

async fn write_log(
    path: &Path,
    step: &StepConfig,
    result: Option<&StepResult>,
    note: Option<&str>,
) -> Result<()> {
    let mut out = format!("$ {}\n", step.command.join(" "));
    if let Some(r) = result {
        out.push_str(&format!("exit_code: {} ({}ms)\n", r.exit_code, r.duration_ms));
        out.push_str("--- stdout ---\n");
        out.push_str(&r.stdout);
        out.push_str("\n--- stderr ---\n");
        out.push_str(&r.stderr);
        out.push('\n');
    }
    if let Some(note) = note {
        out.push_str(note);
        out.push('\n');
    }
    tokio::fs::write(path, out).await?;
    Ok(())
}
