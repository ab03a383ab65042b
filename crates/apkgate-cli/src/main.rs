//! apkgate - Android test-build pipeline CLI
//!
//! ## Commands
//!
//! - `gate`: decide whether a set of changed paths needs a build
//! - `run`: handle one trigger end to end (gate, build, publish)
//! - `tag`: print the release tag a build would get
//! - `fingerprint`: print the current cache keys
//! - `releases`: list published releases

use std::future::Future;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use apkgate_core::cache::{cache_key, fingerprint};
use apkgate_core::naming::{release_tag, validate_release_name};
use apkgate_core::{
    ChangeEvent, ChangeGate, CommandStepRunner, EventType, Pipeline, PipelineConfig,
    PipelineDeps, PipelineReport,
};
use apkgate_store::{
    FsArtifactStore, FsBuildLedger, FsCacheStore, FsCommentSink, FsReleaseStore, FsRunStore,
    ReleaseStore,
};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{debug, warn, Level};

/// Looked up in the working directory when `--config` is not given.
const DEFAULT_CONFIG_FILE: &str = "apkgate.toml";

#[derive(Parser, Debug)]
#[command(name = "apkgate")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Gate, build and publish Android test APKs", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Pipeline configuration file (TOML)
    #[arg(long, global = true, env = "APKGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding artifacts, releases, caches and build numbers
    #[arg(long, global = true, env = "APKGATE_STATE_DIR", default_value = ".apkgate/state")]
    state_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check changed paths against the configured rules
    Gate {
        /// Changed paths
        paths: Vec<String>,

        /// Read newline-separated paths from a file (`-` for stdin)
        #[arg(long)]
        paths_file: Option<PathBuf>,
    },

    /// Handle one trigger: gate, build, publish
    Run {
        /// push, pull_request or manual
        #[arg(long)]
        event: EventType,

        /// Branch the trigger refers to
        #[arg(long)]
        branch: String,

        /// Commit being built
        #[arg(long)]
        sha: String,

        /// Change-request number (pull requests)
        #[arg(long)]
        pr: Option<u64>,

        /// Build number assigned by the trigger source
        #[arg(long)]
        run_number: Option<u64>,

        /// Free-text release name (manual triggers only)
        #[arg(long)]
        release_name: Option<String>,

        /// Changed paths
        #[arg(long = "path")]
        paths: Vec<String>,

        /// Read newline-separated paths from a file (`-` for stdin)
        #[arg(long)]
        paths_file: Option<PathBuf>,
    },

    /// Print the release tag for a build number
    Tag {
        #[arg(long)]
        build_number: u64,

        #[arg(long)]
        release_name: Option<String>,

        /// Release date, YYYY-MM-DD (default: today, UTC)
        #[arg(long)]
        date: Option<NaiveDate>,
    },

    /// Print cache keys for the current workspace
    Fingerprint,

    /// List published releases, newest first
    Releases {
        /// Maximum number of releases to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    apkgate_core::init_tracing(cli.json, level);

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Gate { paths, paths_file } => {
            cmd_gate(&config, collect_paths(paths, paths_file.as_deref())?)
        }
        Commands::Run {
            event,
            branch,
            sha,
            pr,
            run_number,
            release_name,
            paths,
            paths_file,
        } => {
            let mut change = ChangeEvent::new(event, branch, sha)
                .with_paths(collect_paths(paths, paths_file.as_deref())?);
            change.pr_number = pr;
            change.run_number = run_number;
            change.release_name_override = release_name;
            cmd_run(config, &cli.state_dir, change).await
        }
        Commands::Tag {
            build_number,
            release_name,
            date,
        } => cmd_tag(&config, build_number, release_name.as_deref(), date),
        Commands::Fingerprint => cmd_fingerprint(&config).await,
        Commands::Releases { limit } => cmd_releases(&cli.state_dir, limit).await,
    }
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => PathBuf::from(DEFAULT_CONFIG_FILE),
        None => {
            debug!("no config file, using defaults");
            return Ok(PipelineConfig::default());
        }
    };
    PipelineConfig::load(&path)
        .with_context(|| format!("Failed to load config {}", path.display()))
}

/// Merge positional paths with those read from `file`.
fn collect_paths(mut paths: Vec<String>, file: Option<&Path>) -> Result<Vec<String>> {
    let Some(file) = file else {
        return Ok(paths);
    };
    let raw = if file == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read paths from stdin")?;
        buf
    } else {
        std::fs::read_to_string(file)
            .with_context(|| format!("Failed to read {}", file.display()))?
    };
    paths.extend(
        raw.lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from),
    );
    Ok(paths)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn cmd_gate(config: &PipelineConfig, paths: Vec<String>) -> Result<ExitCode> {
    let rules = config.rule_set()?;
    let decision = ChangeGate::evaluate(&paths, &rules);
    print_json(&decision)?;
    Ok(ExitCode::SUCCESS)
}

/// Resolves on ctrl-c, or SIGTERM on unix.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!(error = %e, "cannot listen for SIGTERM"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

async fn cmd_run(config: PipelineConfig, state_dir: &Path, event: ChangeEvent) -> Result<ExitCode> {
    // A lock older than a whole run belongs to a process that died.
    let stale_after = config.run_timeout();
    let deps = PipelineDeps {
        runner: Arc::new(CommandStepRunner),
        artifacts: Arc::new(FsArtifactStore::open(state_dir).await?),
        releases: Arc::new(FsReleaseStore::open(state_dir).await?),
        caches: Arc::new(FsCacheStore::open(state_dir).await?.with_stale_after(stale_after)),
        ledger: Arc::new(FsBuildLedger::open(state_dir).await?),
        comments: Arc::new(FsCommentSink::open(state_dir).await?),
        runs: Arc::new(FsRunStore::open(state_dir).await?),
    };
    let pipeline = Pipeline::new(config, deps).context("Invalid pipeline configuration")?;

    let report = handle_until(&pipeline, event, shutdown_signal()).await;
    print_json(&report)?;
    Ok(if report.succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Drive one trigger. Once `shutdown` resolves the run is cancelled and
/// driven to completion, so it abandons its cache locks. The run may not be
/// registered yet, so the cancel repeats until it returns.
async fn handle_until(
    pipeline: &Pipeline,
    event: ChangeEvent,
    shutdown: impl Future<Output = ()>,
) -> PipelineReport {
    let key = event.concurrency_key();
    let handle = pipeline.handle(event);
    tokio::pin!(handle);
    tokio::select! {
        report = &mut handle => report,
        _ = shutdown => {
            warn!(key = %key, "interrupted, cancelling run");
            let registry = pipeline.registry();
            let mut retry = tokio::time::interval(Duration::from_millis(100));
            loop {
                tokio::select! {
                    report = &mut handle => break report,
                    _ = retry.tick() => {
                        registry.cancel(&key);
                    }
                }
            }
        }
    }
}

fn cmd_tag(
    config: &PipelineConfig,
    build_number: u64,
    release_name: Option<&str>,
    date: Option<NaiveDate>,
) -> Result<ExitCode> {
    let segment = release_name.map(validate_release_name).transpose()?;
    let date = date.unwrap_or_else(|| Utc::now().date_naive());
    println!(
        "{}",
        release_tag(&config.app_version, segment, date, build_number)
    );
    Ok(ExitCode::SUCCESS)
}

#[derive(Serialize)]
struct CacheKeyLine {
    name: String,
    key: String,
}

async fn cmd_fingerprint(config: &PipelineConfig) -> Result<ExitCode> {
    let mut lines = Vec::with_capacity(config.caches.len());
    for cache in &config.caches {
        let fp = fingerprint(&config.workspace, &cache.fingerprint_files).await?;
        lines.push(CacheKeyLine {
            name: cache.name.clone(),
            key: cache_key(&cache.name, &config.cache_os, &fp),
        });
    }
    print_json(&lines)?;
    Ok(ExitCode::SUCCESS)
}

async fn cmd_releases(state_dir: &Path, limit: usize) -> Result<ExitCode> {
    let store = FsReleaseStore::open(state_dir).await?;
    let releases = store.list().await?;

    if releases.is_empty() {
        println!("No releases published");
        return Ok(ExitCode::SUCCESS);
    }
    for release in releases.into_iter().take(limit) {
        println!(
            "{} {}{} {}",
            release.published_at.to_rfc3339(),
            release.tag,
            if release.prerelease { " (prerelease)" } else { "" },
            release.sha256.short()
        );
    }
    Ok(ExitCode::SUCCESS)
}
