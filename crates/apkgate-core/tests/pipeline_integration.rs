//! End-to-end pipeline tests against in-memory stores and a scripted runner.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use apkgate_core::cache::{cache_key, fingerprint};
use apkgate_core::{
    ChangeEvent, EventType, Pipeline, PipelineConfig, PipelineDeps, RunOutcome, StepConfig,
    StepContext, StepResult, StepRunner, TargetKind,
};
use apkgate_store::fakes::{
    MemoryArtifactStore, MemoryBuildLedger, MemoryCacheStore, MemoryCommentSink,
    MemoryReleaseStore, MemoryRunStore,
};
use apkgate_store::{
    ArtifactRecord, ArtifactStore, ArtifactUpload, BuildNumberLedger, CacheStore, CommentSink,
    ReleaseStore, StorageResult, Upserted,
};
use async_trait::async_trait;
use chrono::NaiveDate;
use tempfile::TempDir;
use tokio::sync::Notify;

/// Pretends to be npm/capacitor/gradle. `package_native` writes an APK whose
/// bytes depend on the commit being built. `fail_step` fails until `healed`.
#[derive(Default)]
struct ScriptedRunner {
    calls: AtomicUsize,
    fail_step: Option<String>,
    healed: AtomicBool,
    slow_commit: Option<String>,
    skip_apk: bool,
    started: Notify,
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl StepRunner for ScriptedRunner {
    async fn run_step(&self, step: &StepConfig, ctx: &StepContext) -> std::io::Result<StepResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let commit = ctx.env.get("APKGATE_COMMIT").cloned().unwrap_or_default();
        self.seen
            .lock()
            .unwrap()
            .push(format!("{commit}:{}", step.name));

        if self.slow_commit.as_deref() == Some(commit.as_str()) {
            self.started.notify_one();
            tokio::time::sleep(Duration::from_secs(120)).await;
        }

        let failed = !self.healed.load(Ordering::SeqCst)
            && self.fail_step.as_deref() == Some(step.name.as_str());
        if step.name == "package_native" && !failed && !self.skip_apk {
            let dir = ctx
                .workspace
                .join("android/app/build/outputs/apk/fdroid/debug");
            tokio::fs::create_dir_all(&dir).await?;
            tokio::fs::write(dir.join("app-fdroid-debug.apk"), format!("apk for {commit}")).await?;
        }

        Ok(StepResult {
            step_name: step.name.clone(),
            exit_code: if failed { 1 } else { 0 },
            stdout: format!("ran {}", step.name),
            stderr: if failed { "boom".to_string() } else { String::new() },
            duration_ms: 1,
            success: !failed,
        })
    }
}

struct Harness {
    _dir: TempDir,
    config: PipelineConfig,
    pipeline: Arc<Pipeline>,
    runner: Arc<ScriptedRunner>,
    artifacts: Arc<MemoryArtifactStore>,
    releases: Arc<MemoryReleaseStore>,
    caches: Arc<MemoryCacheStore>,
    ledger: Arc<MemoryBuildLedger>,
    comments: Arc<MemoryCommentSink>,
    runs: Arc<MemoryRunStore>,
}

impl Harness {
    fn new(runner: ScriptedRunner) -> Self {
        Self::with_config(runner, |_| {})
    }

    fn with_config(runner: ScriptedRunner, tweak: impl FnOnce(&mut PipelineConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        tweak(&mut config);

        let runner = Arc::new(runner);
        let artifacts = Arc::new(MemoryArtifactStore::new());
        let releases = Arc::new(MemoryReleaseStore::new());
        let caches = Arc::new(MemoryCacheStore::new());
        let ledger = Arc::new(MemoryBuildLedger::new());
        let comments = Arc::new(MemoryCommentSink::new());
        let runs = Arc::new(MemoryRunStore::new());

        let pipeline = pipeline_over(
            &config,
            PipelineDeps {
                runner: runner.clone(),
                artifacts: artifacts.clone(),
                releases: releases.clone(),
                caches: caches.clone(),
                ledger: ledger.clone(),
                comments: comments.clone(),
                runs: runs.clone(),
            },
        );

        Self {
            _dir: dir,
            config,
            pipeline: Arc::new(pipeline),
            runner,
            artifacts,
            releases,
            caches,
            ledger,
            comments,
            runs,
        }
    }

    /// Another pipeline over the same stores, like a second process working
    /// off the same state directory.
    fn pipeline_sharing_state(&self) -> Pipeline {
        pipeline_over(
            &self.config,
            PipelineDeps {
                runner: self.runner.clone(),
                artifacts: self.artifacts.clone(),
                releases: self.releases.clone(),
                caches: self.caches.clone(),
                ledger: self.ledger.clone(),
                comments: self.comments.clone(),
                runs: self.runs.clone(),
            },
        )
    }

    async fn cache_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        for cache in &self.config.caches {
            let fp = fingerprint(&self.config.workspace, &cache.fingerprint_files)
                .await
                .unwrap();
            keys.push(cache_key(&cache.name, &self.config.cache_os, &fp));
        }
        keys
    }
}

fn pipeline_over(config: &PipelineConfig, deps: PipelineDeps) -> Pipeline {
    Pipeline::new(config.clone(), deps)
        .unwrap()
        .with_build_date(NaiveDate::from_ymd_opt(2026, 10, 18).unwrap())
}

fn test_config(workspace: &std::path::Path) -> PipelineConfig {
    PipelineConfig {
        app_name: "app".to_string(),
        app_version: "1.0".to_string(),
        workspace: workspace.to_path_buf(),
        cache_os: "linux".to_string(),
        ..PipelineConfig::default()
    }
}

fn pr_event(sha: &str) -> ChangeEvent {
    ChangeEvent::new(EventType::PullRequest, "feature-x", sha)
        .with_pr(7)
        .with_paths(["src/app.ts", "README.md"])
}

fn push_event(sha: &str) -> ChangeEvent {
    ChangeEvent::new(EventType::Push, "main", sha).with_paths(["android/app/build.gradle"])
}

#[tokio::test]
async fn test_pr_publishes_artifact_only() {
    let h = Harness::new(ScriptedRunner::default());
    let report = h.pipeline.handle(pr_event("aaa111").with_run_number(3)).await;

    let RunOutcome::Published { artifact, receipts } = &report.outcome else {
        panic!("expected publish, got {:?}", report.outcome);
    };
    assert_eq!(artifact.build_number, 3);
    assert_eq!(receipts.len(), 1);
    assert_eq!(receipts[0].target.kind, TargetKind::ArtifactStore);
    assert_eq!(report.decision.matched_rules, vec!["src/**".to_string()]);

    let stored = h.artifacts.list().await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].name, "app-android-test-3");
    assert_eq!(stored[0].retention_days, 30);
    assert!(h.releases.list().await.unwrap().is_empty());

    let comments = h.comments.list(7).await.unwrap();
    assert_eq!(comments.len(), 1);
    assert_eq!(comments[0].key, "build-3");
    assert!(comments[0].body.contains(artifact.sha256.as_str()));

    // Untrusted runs read caches but never write them.
    for key in h.cache_keys().await {
        assert!(h.caches.lookup(&key).await.unwrap().is_none());
        assert!(h.caches.lock_owner(&key).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn test_push_on_main_publishes_prerelease() {
    let h = Harness::new(ScriptedRunner::default());
    let report = h.pipeline.handle(push_event("bbb222").with_run_number(42)).await;
    assert!(report.succeeded(), "{:?}", report.outcome);

    let release = h
        .releases
        .get("v1.0-test-20261018-build42")
        .await
        .unwrap()
        .expect("release published");
    assert!(release.prerelease);
    assert!(release.body.contains(release.sha256.as_str()));
    assert!(h.artifacts.get("app-android-test-42").await.unwrap().is_some());
    assert_eq!(
        h.ledger.owner_of(42).await.unwrap().as_deref(),
        report.run_id.as_deref()
    );

    // Trusted successful run saves its caches.
    for key in h.cache_keys().await {
        let entry = h.caches.lookup(&key).await.unwrap().expect("cache saved");
        assert_eq!(Some(entry.owner), report.run_id);
    }
}

#[tokio::test]
async fn test_manual_release_name_replaces_segment() {
    let h = Harness::new(ScriptedRunner::default());
    let event = ChangeEvent::new(EventType::Manual, "main", "ccc333")
        .with_release_name("qa-drop.2")
        .with_run_number(8);
    let report = h.pipeline.handle(event).await;

    assert!(report.succeeded(), "{:?}", report.outcome);
    assert!(h
        .releases
        .get("v1.0-qa-drop.2-20261018-build8")
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_invalid_release_name_runs_no_steps() {
    let h = Harness::new(ScriptedRunner::default());
    let event = ChangeEvent::new(EventType::Manual, "main", "ddd444").with_release_name("beta/1");
    let report = h.pipeline.handle(event).await;

    assert_eq!(report.failure_kind(), Some("invalid_release_name"));
    assert_eq!(h.runner.calls.load(Ordering::SeqCst), 0);
    assert!(h.artifacts.list().await.unwrap().is_empty());
    assert!(h.ledger.owner_of(1).await.unwrap().is_none());
}

#[tokio::test]
async fn test_newer_trigger_cancels_older_run() {
    let h = Harness::new(ScriptedRunner {
        slow_commit: Some("old-sha".to_string()),
        ..ScriptedRunner::default()
    });

    let first = {
        let pipeline = h.pipeline.clone();
        tokio::spawn(async move { pipeline.handle(pr_event("old-sha")).await })
    };
    h.runner.started.notified().await;

    let started = Instant::now();
    let second = h.pipeline.handle(pr_event("new-sha")).await;
    let first = first.await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(60));
    assert_eq!(first.failure_kind(), Some("cancelled"));
    assert!(first.succeeded());
    assert!(matches!(second.outcome, RunOutcome::Published { .. }));

    let stored = h.artifacts.list().await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].name, "app-android-test-2");

    // Superseded runs post nothing.
    let comments = h.comments.list(7).await.unwrap();
    assert_eq!(comments.len(), 1);
    assert_eq!(comments[0].key, "build-2");
    assert_eq!(h.pipeline.registry().active_runs(), 0);
}

#[tokio::test]
async fn test_cancelled_trusted_run_leaves_no_cache_state() {
    let h = Harness::new(ScriptedRunner {
        slow_commit: Some("old-sha".to_string()),
        ..ScriptedRunner::default()
    });

    let first = {
        let pipeline = h.pipeline.clone();
        tokio::spawn(async move { pipeline.handle(push_event("old-sha")).await })
    };
    h.runner.started.notified().await;
    let second = h.pipeline.handle(push_event("new-sha")).await;
    let first = first.await.unwrap();

    assert_eq!(first.failure_kind(), Some("cancelled"));
    for key in h.cache_keys().await {
        assert!(h.caches.lock_owner(&key).await.unwrap().is_none());
        if let Some(entry) = h.caches.lookup(&key).await.unwrap() {
            assert_eq!(Some(entry.owner), second.run_id);
        }
    }
}

#[tokio::test]
async fn test_reused_run_number_conflicts() {
    let h = Harness::new(ScriptedRunner::default());
    h.ledger.claim(5, "someone-else").await.unwrap();

    let report = h.pipeline.handle(push_event("eee555").with_run_number(5)).await;

    assert_eq!(report.failure_kind(), Some("number_conflict"));
    assert_eq!(h.runner.calls.load(Ordering::SeqCst), 0);
    assert!(h.artifacts.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_duplicate_dispatch_is_ignored() {
    let h = Harness::new(ScriptedRunner::default());
    let first = h.pipeline.handle(push_event("fff666")).await;
    let second = h.pipeline.handle(push_event("fff666")).await;

    assert!(matches!(first.outcome, RunOutcome::Published { .. }));
    assert!(matches!(second.outcome, RunOutcome::Duplicate));
    assert_eq!(h.artifacts.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_irrelevant_change_is_skipped() {
    let h = Harness::new(ScriptedRunner::default());
    let event = ChangeEvent::new(EventType::Push, "main", "ggg777")
        .with_paths(["README.md", "docs/setup.md"]);
    let report = h.pipeline.handle(event).await;

    assert!(matches!(report.outcome, RunOutcome::Skipped));
    assert!(report.decision.matched_rules.is_empty());
    assert_eq!(h.runner.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_step_failure_reports_diagnostics() {
    let h = Harness::new(ScriptedRunner {
        fail_step: Some("build_frontend".to_string()),
        ..ScriptedRunner::default()
    });
    let report = h.pipeline.handle(pr_event("hhh888")).await;

    let RunOutcome::Failed { kind, message } = &report.outcome else {
        panic!("expected failure, got {:?}", report.outcome);
    };
    assert_eq!(kind, "step_failed");
    assert!(message.contains("build_frontend"));

    // Later steps never ran.
    let seen = h.runner.seen.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            "hhh888:install_dependencies".to_string(),
            "hhh888:build_frontend".to_string()
        ]
    );

    let log = h.config.log_root().join("build-1/build_frontend.log");
    let contents = std::fs::read_to_string(&log).unwrap();
    assert!(contents.contains("boom"));

    let comments = h.comments.list(7).await.unwrap();
    assert_eq!(comments.len(), 1);
    assert_eq!(comments[0].key, "failure-hhh888");
    assert!(comments[0].body.contains("step_failed"));
    assert!(h.artifacts.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_trusted_run_abandons_cache_locks() {
    let h = Harness::new(ScriptedRunner {
        fail_step: Some("sync_native".to_string()),
        ..ScriptedRunner::default()
    });
    let report = h.pipeline.handle(push_event("iii999")).await;

    assert_eq!(report.failure_kind(), Some("step_failed"));
    for key in h.cache_keys().await {
        assert!(h.caches.lookup(&key).await.unwrap().is_none());
        assert!(h.caches.lock_owner(&key).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn test_missing_apk_fails_run() {
    let h = Harness::new(ScriptedRunner {
        skip_apk: true,
        ..ScriptedRunner::default()
    });
    let report = h.pipeline.handle(push_event("jjj000")).await;

    assert_eq!(report.failure_kind(), Some("artifact_missing"));
    assert!(h.releases.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_step_timeout_fails_run() {
    let h = Harness::with_config(
        ScriptedRunner {
            slow_commit: Some("kkk111".to_string()),
            ..ScriptedRunner::default()
        },
        |config| {
            for step in &mut config.steps {
                step.timeout_secs = 1;
            }
        },
    );
    let report = h.pipeline.handle(push_event("kkk111")).await;

    assert_eq!(report.failure_kind(), Some("timeout"));
    assert_eq!(h.runner.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_republishing_is_idempotent() {
    let h = Harness::new(ScriptedRunner::default());
    let report = h.pipeline.handle(push_event("lll222").with_run_number(9)).await;
    let RunOutcome::Published { artifact, receipts } = report.outcome else {
        panic!("expected publish");
    };
    assert!(receipts.iter().all(|r| !r.replaced));

    let event = push_event("lll222").with_run_number(9);
    let again = h.pipeline.router().publish(&artifact, &event).await.unwrap();

    assert_eq!(again.len(), 2);
    assert!(again.iter().all(|r| r.replaced));
    assert_eq!(h.artifacts.list().await.unwrap().len(), 1);
    assert_eq!(h.releases.list().await.unwrap().len(), 1);
    assert_eq!(
        h.artifacts.get("app-android-test-9").await.unwrap().unwrap().sha256,
        artifact.sha256
    );
}

#[tokio::test]
async fn test_artifact_path_follows_flavor_layout() {
    let h = Harness::new(ScriptedRunner::default());
    let report = h.pipeline.handle(push_event("mmm333")).await;
    let RunOutcome::Published { artifact, .. } = report.outcome else {
        panic!("expected publish");
    };

    let expected: PathBuf = h
        .config
        .output_root()
        .join("fdroid/debug/app-fdroid-debug.apk");
    assert_eq!(artifact.binary_path, expected);
    assert_eq!(artifact.size_bytes, "apk for mmm333".len() as u64);
}

#[tokio::test]
async fn test_corrected_release_name_can_be_retriggered() {
    let h = Harness::new(ScriptedRunner::default());
    let bad = ChangeEvent::new(EventType::Manual, "main", "abc").with_release_name("qa/1");
    let report = h.pipeline.handle(bad).await;
    assert_eq!(report.failure_kind(), Some("invalid_release_name"));

    let fixed = ChangeEvent::new(EventType::Manual, "main", "abc").with_release_name("qa-1");
    let report = h.pipeline.handle(fixed).await;

    assert!(
        matches!(report.outcome, RunOutcome::Published { .. }),
        "{:?}",
        report.outcome
    );
    assert!(h
        .releases
        .get("v1.0-qa-1-20261018-build1")
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_failed_run_can_be_retriggered() {
    let h = Harness::new(ScriptedRunner {
        fail_step: Some("build_frontend".to_string()),
        ..ScriptedRunner::default()
    });
    let first = h.pipeline.handle(push_event("ppp666")).await;
    assert_eq!(first.failure_kind(), Some("step_failed"));

    h.runner.healed.store(true, Ordering::SeqCst);
    let retry = h.pipeline.handle(push_event("ppp666")).await;
    let RunOutcome::Published { artifact, .. } = &retry.outcome else {
        panic!("expected publish, got {:?}", retry.outcome);
    };
    // The failed attempt keeps its number.
    assert_eq!(artifact.build_number, 2);

    let again = h.pipeline.handle(push_event("ppp666")).await;
    assert!(matches!(again.outcome, RunOutcome::Duplicate));
}

#[tokio::test]
async fn test_newer_trigger_in_other_process_cancels_run() {
    let h = Harness::with_config(
        ScriptedRunner {
            slow_commit: Some("old-sha".to_string()),
            ..ScriptedRunner::default()
        },
        |config| config.supersede_poll_ms = 20,
    );
    let other = h.pipeline_sharing_state();

    let first = {
        let pipeline = h.pipeline.clone();
        tokio::spawn(async move { pipeline.handle(pr_event("old-sha")).await })
    };
    h.runner.started.notified().await;

    let started = Instant::now();
    let second = other.handle(pr_event("new-sha")).await;
    let first = first.await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(60));
    assert_eq!(first.failure_kind(), Some("cancelled"));
    assert!(matches!(second.outcome, RunOutcome::Published { .. }));

    let stored = h.artifacts.list().await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].name, "app-android-test-2");
    assert_eq!(h.comments.list(7).await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_run_timeout_bounds_whole_build() {
    let h = Harness::with_config(
        ScriptedRunner {
            slow_commit: Some("nnn444".to_string()),
            ..ScriptedRunner::default()
        },
        |config| {
            config.timeout_minutes = 1;
            for step in &mut config.steps {
                step.timeout_secs = 0;
            }
        },
    );
    let report = h.pipeline.handle(push_event("nnn444")).await;

    let RunOutcome::Failed { kind, message } = &report.outcome else {
        panic!("expected failure, got {:?}", report.outcome);
    };
    assert_eq!(kind, "timeout");
    assert!(message.contains("60s"));
    assert_eq!(h.runner.calls.load(Ordering::SeqCst), 1);
    for key in h.cache_keys().await {
        assert!(h.caches.lookup(&key).await.unwrap().is_none());
        assert!(h.caches.lock_owner(&key).await.unwrap().is_none());
    }
}

/// Artifact store whose uploads hang until the run is cancelled.
#[derive(Default)]
struct StallingArtifactStore {
    inner: MemoryArtifactStore,
    entered: Notify,
}

#[async_trait]
impl ArtifactStore for StallingArtifactStore {
    async fn upload(&self, upload: ArtifactUpload) -> StorageResult<Upserted<ArtifactRecord>> {
        self.entered.notify_one();
        tokio::time::sleep(Duration::from_secs(120)).await;
        self.inner.upload(upload).await
    }

    async fn get(&self, name: &str) -> StorageResult<Option<ArtifactRecord>> {
        self.inner.get(name).await
    }

    async fn list(&self) -> StorageResult<Vec<ArtifactRecord>> {
        self.inner.list().await
    }
}

#[tokio::test]
async fn test_cancel_during_publish_stops_publishing() {
    let dir = tempfile::tempdir().unwrap();
    let artifacts = Arc::new(StallingArtifactStore::default());
    let releases = Arc::new(MemoryReleaseStore::new());
    let pipeline = Arc::new(pipeline_over(
        &test_config(dir.path()),
        PipelineDeps {
            runner: Arc::new(ScriptedRunner::default()),
            artifacts: artifacts.clone(),
            releases: releases.clone(),
            caches: Arc::new(MemoryCacheStore::new()),
            ledger: Arc::new(MemoryBuildLedger::new()),
            comments: Arc::new(MemoryCommentSink::new()),
            runs: Arc::new(MemoryRunStore::new()),
        },
    ));

    let run = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { pipeline.handle(push_event("ooo555")).await })
    };
    artifacts.entered.notified().await;
    assert!(pipeline
        .registry()
        .cancel(&push_event("ooo555").concurrency_key()));

    let report = tokio::time::timeout(Duration::from_secs(30), run)
        .await
        .expect("cancel should interrupt the publish")
        .unwrap();
    assert_eq!(report.failure_kind(), Some("cancelled"));
    assert!(artifacts.list().await.unwrap().is_empty());
    assert!(releases.list().await.unwrap().is_empty());
}
