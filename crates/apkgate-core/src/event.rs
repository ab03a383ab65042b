//! Trigger events and the keys derived from them.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// What kind of trigger started a pipeline run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Push,
    PullRequest,
    /// Operator-initiated run (`workflow_dispatch`).
    #[serde(alias = "workflow_dispatch")]
    Manual,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Push => "push",
            EventType::PullRequest => "pull_request",
            EventType::Manual => "manual",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "push" => Ok(EventType::Push),
            "pull_request" | "pr" => Ok(EventType::PullRequest),
            "manual" | "workflow_dispatch" => Ok(EventType::Manual),
            other => Err(format!(
                "unknown event type '{other}' (expected push, pull_request or manual)"
            )),
        }
    }
}

/// Trust classification of a trigger.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Push or manual run on a protected branch.
    Trusted,
    /// Everything else, notably pull requests.
    Untrusted,
}

/// Key for last-writer-wins cancellation: `(branch, pr_number)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConcurrencyKey {
    pub branch: String,
    pub pr_number: Option<u64>,
}

impl fmt::Display for ConcurrencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pr_number {
            Some(pr) => write!(f, "{}#{}", self.branch, pr),
            None => f.write_str(&self.branch),
        }
    }
}

/// An incoming trigger. Immutable once received.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeEvent {
    pub event_type: EventType,
    pub branch: String,
    pub commit_sha: String,
    /// Files modified by the triggering change
    #[serde(default)]
    pub changed_paths: BTreeSet<String>,
    /// Free-text release name, manual triggers only
    #[serde(default)]
    pub release_name_override: Option<String>,
    /// Change-request number, set for pull requests
    #[serde(default)]
    pub pr_number: Option<u64>,
    /// Build number assigned by the trigger source, if any
    #[serde(default)]
    pub run_number: Option<u64>,
}

impl ChangeEvent {
    pub fn new(event_type: EventType, branch: impl Into<String>, commit_sha: impl Into<String>) -> Self {
        Self {
            event_type,
            branch: branch.into(),
            commit_sha: commit_sha.into(),
            changed_paths: BTreeSet::new(),
            release_name_override: None,
            pr_number: None,
            run_number: None,
        }
    }

    pub fn with_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.changed_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_pr(mut self, pr_number: u64) -> Self {
        self.pr_number = Some(pr_number);
        self
    }

    pub fn with_release_name(mut self, name: impl Into<String>) -> Self {
        self.release_name_override = Some(name.into());
        self
    }

    pub fn with_run_number(mut self, run_number: u64) -> Self {
        self.run_number = Some(run_number);
        self
    }

    /// Trust level given the deployment's protected branches.
    pub fn provenance(&self, protected_branches: &[String]) -> Provenance {
        let protected = protected_branches.iter().any(|b| b == &self.branch);
        match self.event_type {
            EventType::Push | EventType::Manual if protected => Provenance::Trusted,
            _ => Provenance::Untrusted,
        }
    }

    pub fn concurrency_key(&self) -> ConcurrencyKey {
        ConcurrencyKey {
            branch: self.branch.clone(),
            pr_number: self.pr_number,
        }
    }
}
