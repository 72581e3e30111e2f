use super::{BuildContext, BuildRule, SupportsDependencyFileRuleKey, default_true, normalize_relative};
use crate::rulekey::RuleKeyBuilder;
use crate::steps::{MkdirStep, RmStep, ShellStep, Step};
use crate::target::BuildTarget;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Rule running a shell command.
///
/// The command runs in the project root and sees:
/// - `SRCS`: space separated inputs
/// - `OUT`: the first output
/// - `OUTS`: space separated outputs
/// - `DEPFILE`: with `dep_file` set, where to list the inputs it read, one per line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenRule {
    #[serde(rename = "name")]
    target: BuildTarget,
    #[serde(default)]
    deps: Vec<BuildTarget>,
    #[serde(default)]
    srcs: Vec<PathBuf>,
    outs: Vec<PathBuf>,
    cmd: String,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    dep_file: bool,
    #[serde(default = "default_true")]
    cacheable: bool,
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

impl GenRule {
    /// Rule producing `outs` from `srcs` by running `cmd`
    pub fn new(target: BuildTarget, srcs: Vec<PathBuf>, outs: Vec<PathBuf>, cmd: impl Into<String>) -> Self {
        Self {
            target,
            deps: Vec::new(),
            srcs,
            outs,
            cmd: cmd.into(),
            env: BTreeMap::new(),
            dep_file: false,
            cacheable: true,
        }
    }

    /// Set the dependencies
    #[must_use]
    pub fn with_deps(mut self, deps: Vec<BuildTarget>) -> Self {
        self.deps = deps;
        self
    }

    /// Enable or disable the dependency file
    #[must_use]
    pub fn with_dep_file(mut self, dep_file: bool) -> Self {
        self.dep_file = dep_file;
        self
    }

    /// Add environment variables for the command
    #[must_use]
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    /// Allow or forbid caching
    #[must_use]
    pub fn with_cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = cacheable;
        self
    }

    fn command_env(&self, context: &BuildContext<'_>) -> BTreeMap<String, String> {
        let mut env = self.env.clone();
        let _ = env.insert("SRCS".to_string(), join_paths(&self.srcs));
        let _ = env.insert("OUTS".to_string(), join_paths(&self.outs));
        if let Some(out) = self.outs.first() {
            let _ = env.insert("OUT".to_string(), out.to_string_lossy().into_owned());
        }
        let _ = env.insert("TARGET".to_string(), self.target.to_string());
        if self.dep_file {
            let dep_file = context.paths.dep_file_path(&self.target);
            let _ = env.insert("DEPFILE".to_string(), dep_file.to_string_lossy().into_owned());
        }
        env
    }
}

impl BuildRule for GenRule {
    fn target(&self) -> &BuildTarget {
        &self.target
    }

    fn rule_type(&self) -> &'static str {
        "genrule"
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
            .set_str("cmd", &self.cmd)
            .set_map("env", &self.env)
            .set_bool("dep_file", self.dep_file);
    }

    fn build_steps(&self, context: &BuildContext<'_>) -> Vec<Box<dyn Step>> {
        let paths = context.paths;
        let mut steps: Vec<Box<dyn Step>> = Vec::new();

        let parents: BTreeSet<PathBuf> = self
            .outs
            .iter()
            .filter_map(|out| paths.resolve(out).parent().map(Path::to_path_buf))
            .collect();
        for parent in parents {
            steps.push(Box::new(MkdirStep::new(parent)));
        }
        if self.dep_file {
            steps.push(Box::new(MkdirStep::new(paths.metadata_dir(&self.target))));
            steps.push(Box::new(RmStep::new(paths.dep_file_path(&self.target))));
        }
        steps.push(Box::new(
            ShellStep::new(&self.cmd, paths.project_root()).with_env(self.command_env(context)),
        ));
        steps
    }

    fn dep_file_support(&self) -> Option<&dyn SupportsDependencyFileRuleKey> {
        self.dep_file.then_some(self as &dyn SupportsDependencyFileRuleKey)
    }
}

impl SupportsDependencyFileRuleKey for GenRule {
    fn use_dependency_file_rule_keys(&self) -> bool {
        self.dep_file
    }

    fn covered_by_dep_file(&self, input: &Path) -> bool {
        self.srcs.iter().any(|src| src == input)
    }

    fn inputs_after_building(&self, context: &BuildContext<'_>) -> io::Result<BTreeSet<PathBuf>> {
        let contents = fs::read_to_string(context.paths.dep_file_path(&self.target))?;
        Ok(contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(normalize_relative)
            .filter(|input| self.covered_by_dep_file(input))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::BuildPaths;

    fn rule() -> GenRule {
        GenRule::new(
            BuildTarget::parse("//gen:cat").unwrap(),
            vec![PathBuf::from("a.txt"), PathBuf::from("b.txt")],
            vec![PathBuf::from("out/cat.txt")],
            "cat $SRCS > $OUT",
        )
        .with_dep_file(true)
    }

    #[test]
    fn test_deserialize_from_graph_json() {
        let rule: GenRule = serde_json::from_str(
            r#"{"name": "//gen:cat", "srcs": ["a.txt"], "outs": ["out/cat.txt"], "cmd": "cat $SRCS > $OUT", "deps": ["//lib:x"]}"#,
        )
        .unwrap();
        assert_eq!(rule.target().to_string(), "//gen:cat");
        assert_eq!(rule.deps()[0].to_string(), "//lib:x");
        assert!(rule.is_cacheable());
        assert!(rule.dep_file_support().is_none());
    }

    #[test]
    fn test_dep_file_lists_only_declared_inputs() {
        let dir = tempfile::TempDir::new().unwrap();
        let paths = BuildPaths::new(dir.path(), Path::new("out"));
        let rule = rule();
        let dep_file = paths.dep_file_path(rule.target());
        fs::create_dir_all(dep_file.parent().unwrap()).unwrap();
        fs::write(&dep_file, "./a.txt\n\n/etc/passwd\nunknown.txt\n").unwrap();

        let used = rule.inputs_after_building(&BuildContext { paths: &paths }).unwrap();
        assert_eq!(used, [PathBuf::from("a.txt")].into());
    }

    #[test]
    fn test_missing_dep_file_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let paths = BuildPaths::new(dir.path(), Path::new("out"));
        assert!(rule().inputs_after_building(&BuildContext { paths: &paths }).is_err());
    }

    #[test]
    fn test_steps_prepare_outputs_and_dep_file() {
        let paths = BuildPaths::new("/p", Path::new("out"));
        let steps = rule().build_steps(&BuildContext { paths: &paths });
        let names: Vec<_> = steps.iter().map(|s| s.short_name()).collect();
        assert_eq!(names, ["mkdir", "mkdir", "rm", "sh"]);
    }
}
