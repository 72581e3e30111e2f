//! Build orchestration
//!
//! Resolves the requested targets, submits one task per rule and waits for
//! them. Under fail-fast the first failed rule aborts the wait and cancels
//! everything that has not started; under keep-going every rule is waited
//! for and all failures are reported together.

use crate::build_result::{BuildOutcome, BuildResult, RuleSuccess};
use crate::engine::CachingBuildEngine;
use crate::error::{BuildError, EngineResult};
use crate::interrupt::InterruptHandle;
use crate::report::{BuildReport, BuildStatus};
use crate::target::BuildTarget;
use convenient_executor::TaskFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{error, info, warn};

/// Exit code of a build that was interrupted
pub const EXIT_INTERRUPTED: i32 = 130;

/// Per-target results of one build invocation
#[derive(Debug, Clone, Default)]
pub struct BuildExecutionResult {
    /// Requested targets in request order; `None` when the rule did not complete
    pub results: Vec<(BuildTarget, Option<BuildResult>)>,
    /// Failed rules, in the order they failed
    pub failures: Vec<BuildResult>,
}

impl BuildExecutionResult {
    /// Whether every requested rule succeeded
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
            && self
                .results
                .iter()
                .all(|(_, result)| result.as_ref().is_some_and(BuildResult::is_success))
    }

    /// Result for `target`, if it completed
    #[must_use]
    pub fn get(&self, target: &BuildTarget) -> Option<&BuildResult> {
        self.results
            .iter()
            .find(|(t, _)| t == target)
            .and_then(|(_, result)| result.as_ref())
    }

    fn collect(targets: &[BuildTarget], mut slots: Vec<Option<BuildResult>>, failures: Vec<BuildResult>) -> Self {
        for slot in &mut slots {
            if slot.as_ref().is_some_and(|r| matches!(r.outcome, BuildOutcome::Canceled)) {
                *slot = None;
            }
        }
        Self {
            results: targets.iter().cloned().zip(slots).collect(),
            failures,
        }
    }
}

/// Where and how the build report goes
#[derive(Debug, Clone, Default)]
pub struct ReportOptions {
    /// Print the console summary
    pub console: bool,
    /// Write the JSON report here, also for partial builds
    pub json_path: Option<PathBuf>,
}

/// One build invocation over an engine
pub struct Build<'a> {
    engine: &'a CachingBuildEngine,
    interrupt: InterruptHandle,
    keep_going: bool,
}

impl<'a> Build<'a> {
    /// Build using the engine's keep-going setting
    #[must_use]
    pub fn new(engine: &'a CachingBuildEngine, interrupt: InterruptHandle) -> Self {
        Self {
            keep_going: engine.config().keep_going,
            engine,
            interrupt,
        }
    }

    /// Override the keep-going policy
    #[must_use]
    pub fn with_keep_going(mut self, keep_going: bool) -> Self {
        self.keep_going = keep_going;
        self
    }

    /// Deduplicate `targets`, keeping the first occurrence, and check each has a rule
    ///
    /// # Errors
    ///
    /// [`BuildError::UnknownTarget`] for targets without a rule
    pub fn rules_to_build(&self, targets: &[BuildTarget]) -> EngineResult<Vec<BuildTarget>> {
        let mut seen = HashSet::new();
        let mut rules = Vec::with_capacity(targets.len());
        for target in targets {
            if seen.insert(target) {
                let _ = self.engine.graph().require_rule(target)?;
                rules.push(target.clone());
            }
        }
        Ok(rules)
    }

    /// Build `targets` and block until the build is done
    ///
    /// # Errors
    ///
    /// - [`BuildError::Execution`] on the first failure under fail-fast
    /// - [`BuildError::Interrupted`] when the interrupt handle fires
    /// - graph errors for unknown targets and cycles
    pub fn execute(&self, targets: &[BuildTarget]) -> EngineResult<BuildExecutionResult> {
        let targets = self.rules_to_build(targets)?;
        info!(
            "Building {} targets ({})",
            targets.len(),
            if self.keep_going { "keep going" } else { "fail fast" }
        );
        let futures = self.engine.build(&targets)?;
        let outcome = futures::executor::block_on(self.wait_for(&targets, futures));

        let upload_failures = self.engine.finish_build();
        if !upload_failures.is_empty() {
            warn!("{} cache uploads failed", upload_failures.len());
        }
        outcome
    }

    async fn wait_for(
        &self,
        targets: &[BuildTarget],
        futures: Vec<(BuildTarget, TaskFuture<RuleSuccess>)>,
    ) -> EngineResult<BuildExecutionResult> {
        let mut slots: Vec<Option<BuildResult>> = vec![None; targets.len()];
        let mut failures = Vec::new();
        let mut pending: FuturesUnordered<_> = futures
            .into_iter()
            .enumerate()
            .map(|(index, (target, future))| future.map(move |result| (index, target, result)))
            .collect();
        let interrupted = self.interrupt.interrupted().fuse();
        futures::pin_mut!(interrupted);

        loop {
            futures::select! {
                next = pending.next() => {
                    let Some((index, target, result)) = next else { break };
                    let result = BuildResult::from_task_result(target, result);
                    let failure = result.failure().cloned();
                    if let Some(e) = &failure {
                        error!("{} failed: {}", result.target, e);
                        failures.push(result.clone());
                    }
                    slots[index] = Some(result);
                    if let Some(first_failure) = failure.filter(|_| !self.keep_going) {
                        let _ = self.engine.cancel_pending();
                        return Err(BuildError::Execution {
                            first_failure,
                            partial: Box::new(BuildExecutionResult::collect(targets, slots, failures)),
                        });
                    }
                }
                () = interrupted => {
                    warn!("Build interrupted");
                    let _ = self.engine.cancel_pending();
                    return Err(BuildError::Interrupted {
                        partial: Box::new(BuildExecutionResult::collect(targets, slots, failures)),
                    });
                }
            }
        }

        Ok(BuildExecutionResult::collect(targets, slots, failures))
    }

    /// Build `targets`, print and persist the report, and return the exit code
    pub fn execute_and_print(&self, targets: &[BuildTarget], options: &ReportOptions) -> i32 {
        let start = Instant::now();
        let (status, result) = match self.execute(targets) {
            Ok(result) if result.is_success() => (BuildStatus::Success, result),
            Ok(result) => (BuildStatus::Failed, result),
            Err(BuildError::Execution { partial, .. }) => (BuildStatus::Partial, *partial),
            Err(BuildError::Interrupted { partial }) => (BuildStatus::Interrupted, *partial),
            Err(e) => {
                error!("Build failed: {}", e);
                eprintln!("Build failed: {e}");
                return 1;
            }
        };

        let report = BuildReport::new(&result, status, start.elapsed());
        if options.console {
            print!("{}", report.to_console(self.engine.config().max_build_report_entries));
        }
        if let Some(path) = &options.json_path {
            match report.write_json(path) {
                Ok(()) => info!("Build report written to {}", path.display()),
                Err(e) => error!("Failed to write build report to {}: {}", path.display(), e),
            }
        }

        match status {
            BuildStatus::Success => 0,
            BuildStatus::Interrupted => EXIT_INTERRUPTED,
            BuildStatus::Failed | BuildStatus::Partial => 1,
        }
    }
}
