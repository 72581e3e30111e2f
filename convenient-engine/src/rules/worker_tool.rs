use super::{BuildContext, BuildRule, default_true};
use crate::rulekey::RuleKeyBuilder;
use crate::steps::{MkdirStep, Step, WorkerJobStep};
use crate::target::BuildTarget;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// How to start a persistent worker process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerToolSpec {
    /// Program and arguments
    pub command: Vec<String>,
    /// Extra environment
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Maximum concurrent processes
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

fn default_max_workers() -> usize {
    1
}

impl WorkerToolSpec {
    /// Identity of the pool serving this tool: SHA256 over command and environment
    #[must_use]
    pub fn pool_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for arg in &self.command {
            hasher.update(arg.as_bytes());
            hasher.update([0]);
        }
        hasher.update([1]);
        for (key, value) in &self.env {
            hasher.update(key.as_bytes());
            hasher.update([b'=']);
            hasher.update(value.as_bytes());
            hasher.update([0]);
        }
        hex::encode(&hasher.finalize()[..8])
    }

    /// Pool capacity, at least one
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.max_workers.max(1)
    }
}

/// Rule whose work is a single job sent to a persistent worker process.
///
/// `$SRCS`, `$OUT` and `$OUTS` in `args` are substituted before submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerToolRule {
    #[serde(rename = "name")]
    target: BuildTarget,
    #[serde(default)]
    deps: Vec<BuildTarget>,
    #[serde(default)]
    srcs: Vec<PathBuf>,
    outs: Vec<PathBuf>,
    tool: WorkerToolSpec,
    args: String,
    #[serde(default = "default_true")]
    cacheable: bool,
}

impl WorkerToolRule {
    /// Rule sending `args` to `tool`
    pub fn new(
        target: BuildTarget,
        srcs: Vec<PathBuf>,
        outs: Vec<PathBuf>,
        tool: WorkerToolSpec,
        args: impl Into<String>,
    ) -> Self {
        Self {
            target,
            deps: Vec::new(),
            srcs,
            outs,
            tool,
            args: args.into(),
            cacheable: true,
        }
    }

    /// Set the dependencies
    #[must_use]
    pub fn with_deps(mut self, deps: Vec<BuildTarget>) -> Self {
        self.deps = deps;
        self
    }

    fn expanded_args(&self) -> String {
        let join = |paths: &[PathBuf]| {
            paths
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join(" ")
        };
        let out = self
            .outs
            .first()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        // $OUTS before $OUT, which is its prefix
        self.args
            .replace("$SRCS", &join(&self.srcs))
            .replace("$OUTS", &join(&self.outs))
            .replace("$OUT", &out)
    }
}

impl BuildRule for WorkerToolRule {
    fn target(&self) -> &BuildTarget {
        &self.target
    }

    fn rule_type(&self) -> &'static str {
        "worker_tool"
    }

    fn deps(&self) -> &[BuildTarget] {
        &self.deps
    }

    fn inputs(&self) -> &[PathBuf] {
        &self.srcs
    }

    fn outputs(&self) -> &[PathBuf] {
        &self.outs
    }

    fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    fn append_to_rule_key(&self, builder: &mut RuleKeyBuilder) {
        let _ = builder
            .set_strings("tool", &self.tool.command)
            .set_map("tool_env", &self.tool.env)
            .set_str("args", &self.args);
    }

    fn build_steps(&self, context: &BuildContext<'_>) -> Vec<Box<dyn Step>> {
        let parents: BTreeSet<PathBuf> = self
            .outs
            .iter()
            .filter_map(|out| context.paths.resolve(out).parent().map(Path::to_path_buf))
            .collect();
        let mut steps: Vec<Box<dyn Step>> = parents
            .into_iter()
            .map(|parent| Box::new(MkdirStep::new(parent)) as Box<dyn Step>)
            .collect();
        steps.push(Box::new(WorkerJobStep::new(self.tool.clone(), self.expanded_args())));
        steps
    }
}
