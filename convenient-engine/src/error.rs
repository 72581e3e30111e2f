//! Engine errors

use crate::orchestrator::BuildExecutionResult;
use convenient_cache::CacheError;
use convenient_executor::TaskError;
use convenient_worker::WorkerError;
use std::io;
use thiserror::Error;

/// Errors raised while executing a single build step
#[derive(Debug, Error)]
pub enum StepError {
    /// Filesystem or process I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A command exited non-zero
    #[error("`{description}` failed with exit code {exit_code}{}", stderr_suffix(.stderr))]
    CommandFailed {
        /// Step description
        description: String,
        /// Exit status
        exit_code: i32,
        /// Captured standard error, if any
        stderr: Option<String>,
    },

    /// A command died from a signal
    #[error("`{0}` was terminated by a signal")]
    Killed(String),

    /// The worker process failed the job
    #[error("Worker process error: {0}")]
    Worker(#[from] WorkerError),
}

fn stderr_suffix(stderr: &Option<String>) -> String {
    match stderr.as_deref().map(str::trim) {
        Some(s) if !s.is_empty() => format!(":\n{s}"),
        _ => String::new(),
    }
}

/// Why a single rule failed
#[derive(Debug, Error)]
pub enum RuleError {
    /// One of the rule's steps failed
    #[error("Failed to build {target}: {source}")]
    Step {
        /// Rule target
        target: String,
        /// Failing step's error
        #[source]
        source: StepError,
    },

    /// An input could not be hashed
    #[error("Failed to compute rule key for {target}: {source}")]
    RuleKey {
        /// Rule target
        target: String,
        /// Hashing error
        #[source]
        source: io::Error,
    },

    /// Output or metadata I/O failed
    #[error("I/O error while building {target}: {source}")]
    Io {
        /// Rule target
        target: String,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// A dependency finished without a result
    #[error("Dependency {0} has no result")]
    MissingDependency(String),
}

/// Errors of the manifest (dependency-file cache) layer
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Reading or writing the manifest file failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The blob is not a valid manifest
    #[error("Corrupted manifest: {0}")]
    Decode(String),

    /// Serialization failed
    #[error("Failed to encode manifest: {0}")]
    Encode(String),

    /// Written by an incompatible format version
    #[error("Manifest format version {found} is not supported (expected {expected})")]
    Version {
        /// Version in the blob
        found: u32,
        /// Version this build reads
        expected: u32,
    },
}

/// Errors surfaced by a build as a whole
#[derive(Debug, Error)]
pub enum BuildError {
    /// The graph has no rule for this target
    #[error("No rule found for target {0}")]
    UnknownTarget(String),

    /// Not a `//package:name` label
    #[error("Invalid target {0}: expected //package:name")]
    InvalidTarget(String),

    /// A rule names a dependency missing from the graph
    #[error("Rule {rule} depends on unknown target {dep}")]
    MissingDependency {
        /// Declaring rule
        rule: String,
        /// Missing dependency
        dep: String,
    },

    /// Two rules share a target
    #[error("Duplicate rule {0}")]
    DuplicateRule(String),

    /// The graph is not acyclic
    #[error("Dependency cycle detected involving: {}", .0.join(", "))]
    Cycle(Vec<String>),

    /// I/O failed outside any rule
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Graph or config JSON is invalid
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// A cache backend could not be set up
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Fail-fast stopped at the first failed rule
    #[error("Build failed: {first_failure}")]
    Execution {
        /// Error of the first failed rule
        first_failure: TaskError,
        /// Rules completed before the abort
        partial: Box<BuildExecutionResult>,
    },

    /// The interrupt handle fired
    #[error("Build interrupted")]
    Interrupted {
        /// Rules completed before the interrupt
        partial: Box<BuildExecutionResult>,
    },
}

impl BuildError {
    /// Results gathered before a fail-fast abort or an interrupt
    #[must_use]
    pub fn partial_result(&self) -> Option<&BuildExecutionResult> {
        match self {
            Self::Execution { partial, .. } | Self::Interrupted { partial } => Some(partial),
            _ => None,
        }
    }

    /// Whether the build was interrupted rather than failed
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted { .. })
    }
}

/// Result alias for engine operations
pub type EngineResult<T> = Result<T, BuildError>;
