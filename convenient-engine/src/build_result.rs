//! Per-rule build results

use crate::manifest_manager::{ManifestFetchResult, ManifestStoreSummary};
use crate::target::BuildTarget;
use convenient_cache::{FetchResult, RuleKey};
use convenient_executor::TaskError;
use serde::Serialize;
use std::path::PathBuf;

/// How a rule's outputs came to be
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildRuleSuccessType {
    /// Steps ran on this machine
    BuiltLocally,
    /// Outputs fetched under the default rule key
    FetchedFromCache,
    /// Outputs fetched under a dependency-file key found through the manifest
    FetchedFromCacheManifestBased,
    /// Outputs from the previous build are still up to date
    MatchingRuleKey,
}

impl BuildRuleSuccessType {
    /// Whether the outputs came from the artifact cache
    #[must_use]
    pub fn is_cache_hit(self) -> bool {
        matches!(self, Self::FetchedFromCache | Self::FetchedFromCacheManifestBased)
    }

    /// Label used in reports
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::BuiltLocally => "BUILT_LOCALLY",
            Self::FetchedFromCache => "FETCHED_FROM_CACHE",
            Self::FetchedFromCacheManifestBased => "FETCHED_FROM_CACHE_MANIFEST_BASED",
            Self::MatchingRuleKey => "MATCHING_RULE_KEY",
        }
    }
}

/// A rule that finished successfully
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleSuccess {
    /// The rule
    pub target: BuildTarget,
    /// How it succeeded
    pub success_type: BuildRuleSuccessType,
    /// Default rule key
    pub rule_key: RuleKey,
    /// Dependency-file key, when one was computed or matched
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dep_file_rule_key: Option<RuleKey>,
    /// Fetch under the default key
    pub cache_result: FetchResult,
    /// Manifest lookup, when manifests apply to the rule
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest_fetch: Option<ManifestFetchResult>,
    /// Manifest update after a local build
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest_store: Option<ManifestStoreSummary>,
    /// Wall time spent on the rule
    pub duration_ms: u64,
    /// Outputs, relative to the project root
    pub outputs: Vec<PathBuf>,
}

/// Final state of one requested rule
#[derive(Debug, Clone)]
pub enum BuildOutcome {
    /// Built or fetched
    Success(RuleSuccess),
    /// The rule or one of its dependencies failed
    Failure(TaskError),
    /// Cancelled before it started
    Canceled,
}

/// Result of one rule
#[derive(Debug, Clone)]
pub struct BuildResult {
    /// The rule
    pub target: BuildTarget,
    /// What happened
    pub outcome: BuildOutcome,
}

impl BuildResult {
    /// Wrap a task result
    #[must_use]
    pub fn from_task_result(target: BuildTarget, result: Result<RuleSuccess, TaskError>) -> Self {
        let outcome = match result {
            Ok(success) => BuildOutcome::Success(success),
            Err(e) if e.is_cancelled() => BuildOutcome::Canceled,
            Err(e) => BuildOutcome::Failure(e),
        };
        Self { target, outcome }
    }

    /// Whether the rule succeeded
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, BuildOutcome::Success(_))
    }

    /// The success, if any
    #[must_use]
    pub fn success(&self) -> Option<&RuleSuccess> {
        match &self.outcome {
            BuildOutcome::Success(success) => Some(success),
            _ => None,
        }
    }

    /// The failure, if any
    #[must_use]
    pub fn failure(&self) -> Option<&TaskError> {
        match &self.outcome {
            BuildOutcome::Failure(e) => Some(e),
            _ => None,
        }
    }
}
