//! Build rules
//!
//! A rule is an immutable node of the action graph. Everything the engine
//! needs from it goes through [`BuildRule`]; the per-kind logic (shell
//! commands, persistent worker jobs) lives behind that trait.

mod genrule;
mod worker_tool;

pub use genrule::GenRule;
pub use worker_tool::{WorkerToolRule, WorkerToolSpec};

use crate::rulekey::RuleKeyBuilder;
use crate::steps::Step;
use crate::target::{BuildPaths, BuildTarget};
use std::collections::BTreeSet;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

/// What a rule may look at while producing its steps
#[derive(Debug, Clone, Copy)]
pub struct BuildContext<'a> {
    /// Project and output layout
    pub paths: &'a BuildPaths,
}

/// A node of the action graph
pub trait BuildRule: Send + Sync + fmt::Debug {
    /// Target this rule builds
    fn target(&self) -> &BuildTarget;

    /// Kind of rule, part of its rule key
    fn rule_type(&self) -> &'static str;

    /// Declared dependencies
    fn deps(&self) -> &[BuildTarget];

    /// Declared input files, relative to the project root
    fn inputs(&self) -> &[PathBuf];

    /// Output files or directories, relative to the project root
    fn outputs(&self) -> &[PathBuf];

    /// Whether results may be fetched from and stored in the artifact cache
    fn is_cacheable(&self) -> bool {
        true
    }

    /// Add the rule's configuration to its key
    fn append_to_rule_key(&self, builder: &mut RuleKeyBuilder);

    /// Ordered steps producing the outputs
    fn build_steps(&self, context: &BuildContext<'_>) -> Vec<Box<dyn Step>>;

    /// Dependency-file support, if the rule can report which inputs it read
    fn dep_file_support(&self) -> Option<&dyn SupportsDependencyFileRuleKey> {
        None
    }
}

/// Rules that can report the subset of their inputs a build actually read
pub trait SupportsDependencyFileRuleKey: Send + Sync {
    /// Whether dependency-file keys are in use for this rule instance
    fn use_dependency_file_rule_keys(&self) -> bool;

    /// Whether `input` is tracked through the dependency file; other inputs
    /// always contribute to the key
    fn covered_by_dep_file(&self, input: &Path) -> bool;

    /// Inputs read by the last build, as recorded in the dependency file
    ///
    /// # Errors
    ///
    /// If the dependency file is missing or unreadable
    fn inputs_after_building(&self, context: &BuildContext<'_>) -> io::Result<BTreeSet<PathBuf>>;
}

/// Normalize a project-relative path as written by a tool: drop `./` components
pub(crate) fn normalize_relative(path: &str) -> PathBuf {
    Path::new(path.trim())
        .components()
        .filter(|c| !matches!(c, std::path::Component::CurDir))
        .collect()
}

/// Default for serde `cacheable` fields
pub(crate) fn default_true() -> bool {
    true
}
