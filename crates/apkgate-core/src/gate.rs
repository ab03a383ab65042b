//! Change gate: decide whether a set of changed paths warrants a build.

use std::collections::BTreeSet;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

use crate::error::GateError;

/// Patterns watched by a stock Capacitor/Android project.
pub const DEFAULT_PATH_RULES: &[&str] = &[
    "android/**",
    "src/**",
    "public/**",
    "package.json",
    "package-lock.json",
    "capacitor.config.*",
    ".github/workflows/**",
];

/// Ordered, deduplicated glob patterns.
///
/// `**` crosses directory separators, `*` stays within one segment, and a
/// pattern without wildcards matches only the identical path.
#[derive(Debug, Clone)]
pub struct RuleSet {
    patterns: Vec<String>,
    set: GlobSet,
}

impl RuleSet {
    /// Compile patterns. Duplicates are dropped, first occurrence wins.
    pub fn new<I, S>(patterns: I) -> Result<Self, GateError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = BTreeSet::new();
        let mut ordered = Vec::new();
        let mut builder = GlobSetBuilder::new();

        for pattern in patterns {
            let pattern = pattern.as_ref().trim();
            if pattern.is_empty() {
                return Err(GateError::InvalidPattern {
                    pattern: pattern.to_string(),
                    reason: "pattern is empty".to_string(),
                });
            }
            if !seen.insert(pattern.to_string()) {
                continue;
            }
            let glob = GlobBuilder::new(pattern)
                .literal_separator(true)
                .build()
                .map_err(|e| GateError::InvalidPattern {
                    pattern: pattern.to_string(),
                    reason: e.to_string(),
                })?;
            builder.add(glob);
            ordered.push(pattern.to_string());
        }

        let set = builder.build().map_err(|e| GateError::InvalidPattern {
            pattern: ordered.join(","),
            reason: e.to_string(),
        })?;

        Ok(Self {
            patterns: ordered,
            set,
        })
    }

    /// The stock Android rule set.
    pub fn android_defaults() -> Result<Self, GateError> {
        Self::new(DEFAULT_PATH_RULES)
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Indices of the rules matching `path`.
    fn matching_indices(&self, path: &str) -> Vec<usize> {
        self.set.matches(normalize_path(path))
    }
}

/// Strip a leading `./` and use forward slashes.
fn normalize_path(path: &str) -> String {
    let unified = path.replace('\\', "/");
    let mut trimmed = unified.as_str();
    while let Some(rest) = trimmed.strip_prefix("./") {
        trimmed = rest;
    }
    trimmed.to_string()
}

/// Gate verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildDecision {
    pub should_build: bool,
    /// Rules that matched at least one path, in rule order.
    pub matched_rules: Vec<String>,
}

impl BuildDecision {
    /// Decision for a trigger that bypasses the gate.
    pub fn forced() -> Self {
        Self {
            should_build: true,
            matched_rules: Vec::new(),
        }
    }
}

/// Path-based change gate.
pub struct ChangeGate;

impl ChangeGate {
    /// Classify `paths` against `rules`.
    ///
    /// Pure and total: an empty path set never builds, and a rule is reported
    /// once no matter how many paths it matched.
    pub fn evaluate<I, S>(paths: I, rules: &RuleSet) -> BuildDecision
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut hit = vec![false; rules.len()];
        for path in paths {
            for idx in rules.matching_indices(path.as_ref()) {
                hit[idx] = true;
            }
        }

        let matched_rules: Vec<String> = rules
            .patterns
            .iter()
            .zip(hit)
            .filter_map(|(p, h)| h.then(|| p.clone()))
            .collect();

        BuildDecision {
            should_build: !matched_rules.is_empty(),
            matched_rules,
        }
    }
}
