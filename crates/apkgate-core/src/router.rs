//! Publish routing: decide where an artifact goes and put it there.
//!
//! | trigger                          | artifact store | release store |
//! |----------------------------------|----------------|---------------|
//! | pull_request                     | yes (30 days)  | no            |
//! | push / manual, protected branch  | yes            | prerelease    |
//! | push / manual, other branch      | yes            | no            |
//!
//! Every write is an upsert keyed by artifact name, tag or
//! `(pr_number, build-N)`, so retrying a publish never duplicates. The tag
//! date comes from the artifact, not the clock at publish time.

use std::sync::Arc;

use apkgate_store::{
    ArtifactStore, ArtifactUpload, CommentSink, ReleaseDraft, ReleaseStore,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::artifact::BuildArtifact;
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::event::{ChangeEvent, EventType};
use crate::naming::{artifact_name, release_tag, validate_release_name};

/// Sink kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    ArtifactStore,
    ReleaseStore,
}

/// Where and how an artifact is published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishTarget {
    pub kind: TargetKind,
    /// Set for the artifact store only
    pub retention_days: Option<u32>,
    /// Artifact name or release tag
    pub tag: String,
    pub prerelease: bool,
}

/// Proof of one completed publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub target: PublishTarget,
    pub location: String,
    pub build_number: u64,
    /// An earlier publish with the same key was overwritten
    pub replaced: bool,
}

/// Routes artifacts to the artifact store, release store and PR comments.
pub struct Router {
    config: Arc<PipelineConfig>,
    artifacts: Arc<dyn ArtifactStore>,
    releases: Arc<dyn ReleaseStore>,
    comments: Arc<dyn CommentSink>,
}

impl Router {
    pub fn new(
        config: Arc<PipelineConfig>,
        artifacts: Arc<dyn ArtifactStore>,
        releases: Arc<dyn ReleaseStore>,
        comments: Arc<dyn CommentSink>,
    ) -> Self {
        Self {
            config,
            artifacts,
            releases,
            comments,
        }
    }

    /// Compute targets without publishing.
    pub fn plan(&self, artifact: &BuildArtifact, event: &ChangeEvent) -> Result<Vec<PublishTarget>> {
        let segment = match &event.release_name_override {
            Some(name) => Some(validate_release_name(name)?),
            None => None,
        };

        let mut targets = vec![PublishTarget {
            kind: TargetKind::ArtifactStore,
            retention_days: Some(self.config.retention_days),
            tag: artifact_name(&self.config.app_name, artifact.build_number),
            prerelease: false,
        }];

        let release_eligible = matches!(event.event_type, EventType::Push | EventType::Manual)
            && self.config.is_protected(&event.branch);
        if release_eligible {
            targets.push(PublishTarget {
                kind: TargetKind::ReleaseStore,
                retention_days: None,
                tag: release_tag(
                    &self.config.app_version,
                    segment,
                    artifact.built_on,
                    artifact.build_number,
                ),
                prerelease: true,
            });
        }
        Ok(targets)
    }

    /// Publish `artifact` according to `event`'s provenance.
    #[instrument(skip_all, fields(build_number = artifact.build_number, event = %event.event_type))]
    pub async fn publish(
        &self,
        artifact: &BuildArtifact,
        event: &ChangeEvent,
    ) -> Result<Vec<PublishReceipt>> {
        let targets = self.plan(artifact, event)?;
        let mut receipts = Vec::with_capacity(targets.len());

        for target in targets {
            let receipt = match target.kind {
                TargetKind::ArtifactStore => {
                    let out = self
                        .artifacts
                        .upload(ArtifactUpload {
                            name: target.tag.clone(),
                            source_path: artifact.binary_path.clone(),
                            size_bytes: artifact.size_bytes,
                            sha256: artifact.sha256.clone(),
                            build_number: artifact.build_number,
                            retention_days: target.retention_days.unwrap_or(self.config.retention_days),
                        })
                        .await?;
                    PublishReceipt {
                        location: out.record.location,
                        build_number: artifact.build_number,
                        replaced: out.replaced,
                        target,
                    }
                }
                TargetKind::ReleaseStore => {
                    let out = self
                        .releases
                        .publish(ReleaseDraft {
                            tag: target.tag.clone(),
                            title: self.release_title(artifact, event),
                            body: self.release_body(artifact, event),
                            prerelease: target.prerelease,
                            asset_path: artifact.binary_path.clone(),
                            asset_name: format!("{}.apk", target.tag),
                            sha256: artifact.sha256.clone(),
                            build_number: artifact.build_number,
                        })
                        .await?;
                    PublishReceipt {
                        location: out.record.asset_location,
                        build_number: artifact.build_number,
                        replaced: out.replaced,
                        target,
                    }
                }
            };
            info!(
                kind = ?receipt.target.kind,
                tag = %receipt.target.tag,
                replaced = receipt.replaced,
                "published"
            );
            receipts.push(receipt);
        }

        if let (EventType::PullRequest, Some(pr)) = (event.event_type, event.pr_number) {
            let summary = self.pr_summary(artifact, &receipts);
            self.comments
                .upsert(pr, &format!("build-{}", artifact.build_number), &summary)
                .await?;
        }

        Ok(receipts)
    }

    fn release_title(&self, artifact: &BuildArtifact, event: &ChangeEvent) -> String {
        match &event.release_name_override {
            Some(name) => format!("{} {} (build {})", self.config.app_name, name, artifact.build_number),
            None => format!("{} test build {}", self.config.app_name, artifact.build_number),
        }
    }

    fn release_body(&self, artifact: &BuildArtifact, event: &ChangeEvent) -> String {
        format!(
            "Android test build for {app} {version}.\n\n\
             - Build: {build}\n\
             - Branch: `{branch}`\n\
             - Commit: `{sha}`\n\
             - Size: {size} MB\n\
             - SHA-256: `{digest}`\n\n\
             This is a debug build for testing only.\n",
            app = self.config.app_name,
            version = self.config.app_version,
            build = artifact.build_number,
            branch = event.branch,
            sha = event.commit_sha,
            size = artifact.size_mb(),
            digest = artifact.sha256,
        )
    }

    /// Markdown summary for the change request.
    pub fn pr_summary(&self, artifact: &BuildArtifact, receipts: &[PublishReceipt]) -> String {
        let name = artifact_name(&self.config.app_name, artifact.build_number);
        let link = match &self.config.artifact_base_url {
            Some(base) => format!("{}/{}", base.trim_end_matches('/'), name),
            None => receipts
                .iter()
                .find(|r| r.target.kind == TargetKind::ArtifactStore)
                .map(|r| r.location.clone())
                .unwrap_or_else(|| name.clone()),
        };
        format!(
            "### Android test APK ready\n\n\
             | | |\n|---|---|\n\
             | Artifact | [{name}]({link}) |\n\
             | Size | {size} MB |\n\
             | SHA-256 | `{digest}` |\n\
             | Retention | {days} days |\n",
            size = artifact.size_mb(),
            digest = artifact.sha256,
            days = self.config.retention_days,
        )
    }
}
