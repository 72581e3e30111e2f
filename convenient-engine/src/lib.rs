//! Incremental, cache-aware build engine
//!
//! Rules of an [`ActionGraph`] are turned into scheduler tasks and built by a
//! [`CachingBuildEngine`]. Before running a rule's steps the engine tries, in
//! order, the rule key recorded by the previous build, the artifact cache
//! under the default [`RuleKey`], and the rule's manifest: a record of which
//! inputs earlier builds actually read, mapping their hashes to
//! dependency-file rule keys. [`Build`] drives one invocation with fail-fast or
//! keep-going semantics and produces a [`BuildReport`].
//!
//! # Example
//!
//! ```no_run
//! use convenient_engine::{ActionGraph, Build, CachingBuildEngine, EngineConfig, InterruptHandle, ReportOptions};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! let graph = Arc::new(ActionGraph::from_json_file(Path::new("BUILD.json"))?);
//! let targets: Vec<_> = graph.rules().map(|rule| rule.target().clone()).collect();
//! let engine = CachingBuildEngine::new(graph, ".", EngineConfig::default())?;
//! let code = Build::new(&engine, InterruptHandle::new()).execute_and_print(&targets, &ReportOptions::default());
//! engine.close();
//! std::process::exit(code);
//! # Ok::<(), convenient_engine::BuildError>(())
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(unused_results)]

pub mod artifact;
mod build_result;
mod config;
mod engine;
mod error;
mod graph;
pub mod hashing;
mod interrupt;
pub mod manifest;
pub mod manifest_manager;
mod orchestrator;
pub mod report;
pub mod rulekey;
pub mod rules;
pub mod steps;
mod target;
mod uploads;
mod worker_pools;

pub use build_result::{BuildOutcome, BuildResult, BuildRuleSuccessType, RuleSuccess};
pub use config::{CacheSettings, DepFiles, EngineConfig, SchedulerKind};
pub use engine::CachingBuildEngine;
pub use error::{BuildError, EngineResult, ManifestError, RuleError, StepError};
pub use graph::{ActionGraph, GraphSpec, RuleSpec};
pub use interrupt::InterruptHandle;
pub use orchestrator::{Build, BuildExecutionResult, EXIT_INTERRUPTED, ReportOptions};
pub use report::{BuildReport, BuildStatus};
pub use target::{BuildPaths, BuildTarget};
pub use uploads::UploadTracker;
pub use worker_pools::WorkerProcessPoolFactory;

pub use convenient_cache::{ArtifactCache, FetchResult, RuleKey};
