//! apkgate - Android test-build pipeline
//!
//! Decides whether a change needs a build, runs the build steps under a
//! timeout with last-writer-wins cancellation, and routes the resulting APK
//! to the artifact store, the release store and change-request comments.

pub mod artifact;
pub mod cache;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod event;
pub mod gate;
pub mod naming;
pub mod orchestrator;
pub mod pipeline;
pub mod router;
pub mod runner;
pub mod stage;
pub mod telemetry;

// Re-export key types
pub use artifact::{BuildArtifact, Flavor};
pub use cache::{CacheAccess, CacheSession};
pub use concurrency::{CancelHandle, CancelSignal, RunRegistry, RunTicket};
pub use config::{CacheConfig, PipelineConfig};
pub use error::{BuildError, ConfigError, GateError, Result};
pub use event::{ChangeEvent, ConcurrencyKey, EventType, Provenance};
pub use gate::{BuildDecision, ChangeGate, RuleSet};
pub use orchestrator::BuildOrchestrator;
pub use pipeline::{Pipeline, PipelineDeps, PipelineReport, RunOutcome};
pub use router::{PublishReceipt, PublishTarget, Router, TargetKind};
pub use runner::{CommandStepRunner, StepContext, StepResult, StepRunner};
pub use stage::{BuiltinStep, StepConfig};
pub use telemetry::init_tracing;
