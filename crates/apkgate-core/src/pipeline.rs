//! End-to-end handling of one trigger: gate, build, publish, report.

use std::sync::Arc;
use std::time::Instant;

use apkgate_store::{
    ArtifactStore, BuildNumberLedger, CacheStore, CommentSink, ReleaseStore, RunStore,
};
use chrono::NaiveDate;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};

use crate::artifact::BuildArtifact;
use crate::concurrency::{
    dispatch_key, is_superseded, spawn_supersession_watch, RunRegistry, RunTicket,
};
use crate::config::PipelineConfig;
use crate::error::{BuildError, ConfigError, Result};
use crate::event::{ChangeEvent, EventType};
use crate::gate::{BuildDecision, ChangeGate, RuleSet};
use crate::orchestrator::BuildOrchestrator;
use crate::router::{PublishReceipt, Router};
use crate::runner::StepRunner;

/// External collaborators a [`Pipeline`] needs.
pub struct PipelineDeps {
    pub runner: Arc<dyn StepRunner>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub releases: Arc<dyn ReleaseStore>,
    pub caches: Arc<dyn CacheStore>,
    pub ledger: Arc<dyn BuildNumberLedger>,
    pub comments: Arc<dyn CommentSink>,
    /// Shared with every other process handling triggers for this project
    pub runs: Arc<dyn RunStore>,
}

/// How a trigger was resolved.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// No path matched the rule set.
    Skipped,
    /// The same `(commit_sha, event_type)` is in flight or already published.
    Duplicate,
    Published {
        artifact: BuildArtifact,
        receipts: Vec<PublishReceipt>,
    },
    Failed {
        kind: String,
        message: String,
    },
}

/// Summary of one handled trigger.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub run_id: Option<String>,
    pub event_type: EventType,
    pub branch: String,
    pub commit_sha: String,
    pub decision: BuildDecision,
    #[serde(flatten)]
    pub outcome: RunOutcome,
    pub duration_ms: u64,
}

impl PipelineReport {
    /// False only for failed runs. Skips, duplicates and supersession are
    /// not failures.
    pub fn succeeded(&self) -> bool {
        match &self.outcome {
            RunOutcome::Failed { kind, .. } => kind == "cancelled",
            _ => true,
        }
    }

    pub fn failure_kind(&self) -> Option<&str> {
        match &self.outcome {
            RunOutcome::Failed { kind, .. } => Some(kind),
            _ => None,
        }
    }
}

/// Trigger handler.
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    rules: RuleSet,
    registry: Arc<RunRegistry>,
    // Keeps registry order and run-store order the same within a process.
    begin_lock: Mutex<()>,
    orchestrator: BuildOrchestrator,
    router: Router,
    comments: Arc<dyn CommentSink>,
    runs: Arc<dyn RunStore>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, deps: PipelineDeps) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let rules = config.rule_set()?;
        let config = Arc::new(config);

        let orchestrator = BuildOrchestrator::new(
            Arc::clone(&config),
            deps.runner,
            deps.caches,
            deps.ledger,
            Arc::clone(&deps.runs),
        );
        let router = Router::new(
            Arc::clone(&config),
            deps.artifacts,
            deps.releases,
            Arc::clone(&deps.comments),
        );

        Ok(Self {
            config,
            rules,
            registry: Arc::new(RunRegistry::new()),
            begin_lock: Mutex::new(()),
            orchestrator,
            router,
            comments: deps.comments,
            runs: deps.runs,
        })
    }

    /// Pin the build date stamped on artifacts and used in release tags.
    pub fn with_build_date(self, date: NaiveDate) -> Self {
        Self {
            orchestrator: self.orchestrator.with_build_date(date),
            ..self
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn registry(&self) -> Arc<RunRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Gate verdict for `event`. Manual triggers always build.
    pub fn evaluate(&self, event: &ChangeEvent) -> BuildDecision {
        match event.event_type {
            EventType::Manual => BuildDecision::forced(),
            _ => ChangeGate::evaluate(&event.changed_paths, &self.rules),
        }
    }

    /// Handle one trigger end to end.
    #[instrument(skip_all, fields(event = %event.event_type, branch = %event.branch, sha = %event.commit_sha))]
    pub async fn handle(&self, event: ChangeEvent) -> PipelineReport {
        let start = Instant::now();
        let decision = self.evaluate(&event);
        let report = |run_id: Option<String>, decision: BuildDecision, outcome: RunOutcome| PipelineReport {
            run_id,
            event_type: event.event_type,
            branch: event.branch.clone(),
            commit_sha: event.commit_sha.clone(),
            decision,
            outcome,
            duration_ms: start.elapsed().as_millis() as u64,
        };

        if !decision.should_build {
            info!("no relevant paths changed, skipping build");
            return report(None, decision, RunOutcome::Skipped);
        }
        info!(matched = ?decision.matched_rules, "build required");

        // Reject bad input before it can take the dispatch or supersede a
        // healthy run.
        if let Err(err) = BuildOrchestrator::validate(&event) {
            self.report_failure(&event, &err).await;
            return report(None, decision, failed(&err));
        }

        let dispatch = dispatch_key(&event.commit_sha, event.event_type);
        match self.runs.claim_dispatch(&dispatch).await {
            Ok(true) => {}
            Ok(false) => {
                info!("trigger already dispatched, ignoring");
                return report(None, decision, RunOutcome::Duplicate);
            }
            Err(e) => {
                let err = BuildError::from(e);
                self.report_failure(&event, &err).await;
                return report(None, decision, failed(&err));
            }
        }

        let (ticket, slot) = {
            let _guard = self.begin_lock.lock().await;
            let ticket = self.registry.begin(event.concurrency_key());
            let slot = self
                .runs
                .supersede(&ticket.key().to_string(), ticket.run_id())
                .await;
            (ticket, slot)
        };
        let run_id = ticket.run_id().to_string();
        let result = match slot {
            Ok(_) => self.watched_run(&event, &ticket).await,
            Err(e) => Err(e.into()),
        };
        self.registry.finish(&ticket);

        let outcome = match result {
            Ok((artifact, receipts)) => RunOutcome::Published { artifact, receipts },
            Err(err) => {
                // Re-sending a failed trigger is how a run is retried.
                if let Err(e) = self.runs.release_dispatch(&dispatch).await {
                    warn!(error = %e, "failed to release dispatch");
                }
                self.report_failure(&event, &err).await;
                failed(&err)
            }
        };
        report(Some(run_id), decision, outcome)
    }

    /// Build and publish while watching the run store for a newer run.
    async fn watched_run(
        &self,
        event: &ChangeEvent,
        ticket: &RunTicket,
    ) -> Result<(BuildArtifact, Vec<PublishReceipt>)> {
        let watch = spawn_supersession_watch(
            Arc::clone(&self.runs),
            Arc::clone(&self.registry),
            ticket.key().clone(),
            ticket.run_id().to_string(),
            self.config.supersede_poll(),
        );
        let result = self.build_and_publish(event, ticket).await;
        watch.abort();
        result
    }

    async fn build_and_publish(
        &self,
        event: &ChangeEvent,
        ticket: &RunTicket,
    ) -> Result<(BuildArtifact, Vec<PublishReceipt>)> {
        let artifact = self
            .orchestrator
            .run(event, ticket.run_id(), ticket.signal())
            .await?;

        if ticket.is_cancelled()
            || is_superseded(self.runs.as_ref(), ticket.key(), ticket.run_id()).await?
        {
            return Err(BuildError::Cancelled);
        }
        let mut cancel = ticket.signal();
        let receipts = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BuildError::Cancelled),
            res = self.router.publish(&artifact, event) => res?,
        };
        Ok((artifact, receipts))
    }

    async fn report_failure(&self, event: &ChangeEvent, err: &BuildError) {
        if matches!(err, BuildError::Cancelled) {
            info!(key = %event.concurrency_key(), "run superseded by a newer trigger");
            return;
        }
        error!(kind = err.kind(), error = %err, "pipeline run failed");

        let (EventType::PullRequest, Some(pr)) = (event.event_type, event.pr_number) else {
            return;
        };
        let body = format!(
            "### Android test build failed\n\n\
             - Commit: `{}`\n\
             - Reason: `{}`\n\n\
             {}\n",
            event.commit_sha,
            err.kind(),
            err
        );
        let key = format!("failure-{}", event.commit_sha);
        if let Err(e) = self.comments.upsert(pr, &key, &body).await {
            warn!(pr, error = %e, "failed to post failure comment");
        }
    }
}

fn failed(err: &BuildError) -> RunOutcome {
    RunOutcome::Failed {
        kind: err.kind().to_string(),
        message: err.to_string(),
    }
}
