//! Artifact names, release tags and release-name validation.

use std::sync::OnceLock;

use chrono::NaiveDate;
use regex::Regex;

use crate::error::{BuildError, Result};

/// Tag segment used when no release name is supplied.
pub const DEFAULT_RELEASE_SEGMENT: &str = "test";

const MAX_RELEASE_NAME_LEN: usize = 64;

fn release_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9._-]*$").expect("static regex"))
}

/// `{app_name}-android-test-{build_number}`
pub fn artifact_name(app_name: &str, build_number: u64) -> String {
    format!("{app_name}-android-test-{build_number}")
}

/// `v{version}-{segment}-{YYYYMMDD}-build{build_number}`
///
/// `segment` is `test` unless a validated release name replaces it.
pub fn release_tag(
    version: &str,
    segment: Option<&str>,
    date: NaiveDate,
    build_number: u64,
) -> String {
    format!(
        "v{}-{}-{}-build{}",
        version,
        segment.unwrap_or(DEFAULT_RELEASE_SEGMENT),
        date.format("%Y%m%d"),
        build_number
    )
}

/// Validate a manual release name against the tag-safe character set.
///
/// Rejects instead of truncating or rewriting.
pub fn validate_release_name(name: &str) -> Result<&str> {
    let reject = |reason: &str| BuildError::InvalidReleaseName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(reject("must not be empty"));
    }
    if name.len() > MAX_RELEASE_NAME_LEN {
        return Err(reject("longer than 64 characters"));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(reject(&format!("character {bad:?} is not allowed")));
    }
    if !release_name_re().is_match(name) {
        return Err(reject("must start with a letter, digit or underscore"));
    }
    Ok(name)
}
