//! Build report generation (console, JSON, Markdown)

use crate::build_result::{BuildOutcome, BuildResult, BuildRuleSuccessType};
use crate::orchestrator::BuildExecutionResult;
use serde::Serialize;
use std::fmt::Write as _;
use std::io;
use std::path::Path;
use std::time::Duration;

/// Build report
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub status: BuildStatus,
    pub generated_at: String,
    pub duration_s: f64,
    pub rules: Vec<RuleReport>,
    pub cache_stats: CacheStats,
    pub failures: Vec<FailureReport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BuildStatus {
    Success,
    Failed,
    Partial,
    Interrupted,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleReport {
    pub target: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dep_file_rule_key: Option<String>,
    pub duration_ms: u64,
    pub cached: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    pub target: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: usize,
    pub manifest_hits: usize,
    pub misses: usize,
    pub hit_rate: f64,
}

fn rule_report(target: String, result: Option<&BuildResult>) -> RuleReport {
    let mut report = RuleReport {
        target,
        status: "NOT_RUN".to_string(),
        rule_key: None,
        dep_file_rule_key: None,
        duration_ms: 0,
        cached: false,
    };
    match result.map(|r| &r.outcome) {
        Some(BuildOutcome::Success(success)) => {
            report.status = success.success_type.label().to_string();
            report.rule_key = Some(success.rule_key.to_string());
            report.dep_file_rule_key = success.dep_file_rule_key.map(|key| key.to_string());
            report.duration_ms = success.duration_ms;
            report.cached = success.success_type.is_cache_hit();
        }
        Some(BuildOutcome::Failure(_)) => report.status = "FAIL".to_string(),
        Some(BuildOutcome::Canceled) => report.status = "CANCELED".to_string(),
        None => {}
    }
    report
}

impl BuildReport {
    /// Report over `result`
    #[must_use]
    pub fn new(result: &BuildExecutionResult, status: BuildStatus, duration: Duration) -> Self {
        let rules: Vec<RuleReport> = result
            .results
            .iter()
            .map(|(target, result)| rule_report(target.to_string(), result.as_ref()))
            .collect();

        let mut cache_stats = CacheStats::default();
        for (_, result) in &result.results {
            if let Some(success) = result.as_ref().and_then(BuildResult::success) {
                match success.success_type {
                    BuildRuleSuccessType::FetchedFromCache => cache_stats.hits += 1,
                    BuildRuleSuccessType::FetchedFromCacheManifestBased => cache_stats.manifest_hits += 1,
                    BuildRuleSuccessType::BuiltLocally => cache_stats.misses += 1,
                    BuildRuleSuccessType::MatchingRuleKey => {}
                }
            }
        }
        let lookups = cache_stats.hits + cache_stats.manifest_hits + cache_stats.misses;
        if lookups > 0 {
            #[allow(clippy::cast_precision_loss)]
            let rate = (cache_stats.hits + cache_stats.manifest_hits) as f64 * 100.0 / lookups as f64;
            cache_stats.hit_rate = rate;
        }

        let failures = result
            .failures
            .iter()
            .filter_map(|failure| {
                failure.failure().map(|e| FailureReport {
                    target: failure.target.to_string(),
                    error: e.to_string(),
                })
            })
            .collect();

        Self {
            status,
            generated_at: chrono::Utc::now().to_rfc3339(),
            duration_s: duration.as_secs_f64(),
            rules,
            cache_stats,
            failures,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Write the JSON report to `path`, creating parent directories
    ///
    /// # Errors
    ///
    /// I/O and serialization errors
    pub fn write_json(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_json().map_err(io::Error::other)?)
    }

    /// Plain-text summary listing at most `max_entries` rules
    #[must_use]
    pub fn to_console(&self, max_entries: usize) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Build {:?} in {:.2}s", self.status, self.duration_s);
        for rule in self.rules.iter().take(max_entries) {
            let _ = writeln!(out, "  {:<34} {} ({} ms)", rule.status, rule.target, rule.duration_ms);
        }
        if self.rules.len() > max_entries {
            let _ = writeln!(out, "  ... and {} more", self.rules.len() - max_entries);
        }
        let _ = writeln!(
            out,
            "Cache: {} hits, {} manifest hits, {} misses ({:.1}%)",
            self.cache_stats.hits, self.cache_stats.manifest_hits, self.cache_stats.misses, self.cache_stats.hit_rate
        );
        for failure in &self.failures {
            let _ = writeln!(out, "FAILED {}: {}", failure.target, failure.error);
        }
        out
    }

    pub fn to_markdown(&self) -> String {
        format!(
            r"# Build Report

## Status: {:?}

- **Duration**: {:.2}s
- **Cache Hit Rate**: {:.1}%

## Rules

| Rule | Status | Duration | Cached |
|------|--------|----------|--------|
{}
",
            self.status,
            self.duration_s,
            self.cache_stats.hit_rate,
            self.rules
                .iter()
                .map(|r| format!(
                    "| {} | {} | {}ms | {} |",
                    r.target,
                    r.status,
                    r.duration_ms,
                    if r.cached { "✓" } else { "" }
                ))
                .collect::<Vec<_>>()
                .join("\n"),
        )
    }
}
