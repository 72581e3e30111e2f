use convenient_cache::{DirArtifactCache, FetchResult};
use convenient_engine::rules::{BuildRule, GenRule, WorkerToolRule, WorkerToolSpec};
use convenient_engine::{
    ActionGraph, Build, BuildError, BuildRuleSuccessType, BuildTarget, CachingBuildEngine, EngineConfig,
    InterruptHandle,
};
use convenient_executor::TaskError;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

struct Project {
    root: TempDir,
    cache: TempDir,
}

impl Project {
    fn new() -> Self {
        Self {
            root: TempDir::new().unwrap(),
            cache: TempDir::new().unwrap(),
        }
    }

    fn write(&self, path: &str, contents: &str) {
        let path = self.root.path().join(path);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn read(&self, path: &str) -> String {
        fs::read_to_string(self.root.path().join(path)).unwrap()
    }

    fn runs(&self, log: &str) -> usize {
        fs::read_to_string(self.root.path().join(log))
            .map(|text| text.lines().count())
            .unwrap_or(0)
    }

    /// Forget everything the last build left behind except the cache
    fn clean(&self) {
        for dir in ["out", "hitzeleiter-out"] {
            let _ = fs::remove_dir_all(self.root.path().join(dir));
        }
    }

    fn engine(&self, rules: Vec<Arc<dyn BuildRule>>) -> CachingBuildEngine {
        let config = EngineConfig {
            threads: 4,
            ..EngineConfig::default()
        };
        let cache = DirArtifactCache::new(self.cache.path(), false).unwrap();
        CachingBuildEngine::with_cache(
            Arc::new(ActionGraph::new(rules).unwrap()),
            self.root.path(),
            config,
            Arc::new(cache),
        )
        .unwrap()
    }
}

fn target(name: &str) -> BuildTarget {
    BuildTarget::parse(name).unwrap()
}

fn genrule(name: &str, srcs: &[&str], out: &str, cmd: &str) -> GenRule {
    GenRule::new(
        target(name),
        srcs.iter().map(PathBuf::from).collect(),
        vec![PathBuf::from(out)],
        cmd,
    )
}

fn copy_rule() -> Arc<dyn BuildRule> {
    Arc::new(genrule(
        "//:copy",
        &["src/in.txt"],
        "out/copy.txt",
        "cat $SRCS > $OUT && echo run >> copy-runs.log",
    ))
}

fn success_type(engine: &CachingBuildEngine, name: &str) -> BuildRuleSuccessType {
    let result = Build::new(engine, InterruptHandle::new())
        .execute(&[target(name)])
        .unwrap();
    assert!(result.is_success(), "{result:?}");
    result.get(&target(name)).unwrap().success().unwrap().success_type
}

#[test]
fn test_unchanged_rule_is_not_rebuilt() {
    let project = Project::new();
    project.write("src/in.txt", "hello\n");

    let engine = project.engine(vec![copy_rule()]);
    assert_eq!(success_type(&engine, "//:copy"), BuildRuleSuccessType::BuiltLocally);
    assert_eq!(success_type(&engine, "//:copy"), BuildRuleSuccessType::MatchingRuleKey);
    engine.close();

    assert_eq!(project.read("out/copy.txt"), "hello\n");
    assert_eq!(project.runs("copy-runs.log"), 1);
}

#[test]
fn test_changed_input_rebuilds() {
    let project = Project::new();
    project.write("src/in.txt", "one\n");
    let engine = project.engine(vec![copy_rule()]);
    assert_eq!(success_type(&engine, "//:copy"), BuildRuleSuccessType::BuiltLocally);
    engine.close();

    project.write("src/in.txt", "two\n");
    let engine = project.engine(vec![copy_rule()]);
    assert_eq!(success_type(&engine, "//:copy"), BuildRuleSuccessType::BuiltLocally);
    engine.close();

    assert_eq!(project.read("out/copy.txt"), "two\n");
    assert_eq!(project.runs("copy-runs.log"), 2);
}

#[test]
fn test_input_edited_between_builds_of_one_engine_rebuilds() {
    let project = Project::new();
    project.write("src/in.txt", "v1\n");
    let engine = project.engine(vec![copy_rule()]);
    assert_eq!(success_type(&engine, "//:copy"), BuildRuleSuccessType::BuiltLocally);

    project.write("src/in.txt", "v2\n");
    assert_eq!(success_type(&engine, "//:copy"), BuildRuleSuccessType::BuiltLocally);
    engine.close();

    assert_eq!(project.read("out/copy.txt"), "v2\n");
    assert_eq!(project.runs("copy-runs.log"), 2);
}

#[test]
fn test_clean_build_fetches_from_cache() {
    let project = Project::new();
    project.write("src/in.txt", "cached\n");

    let engine = project.engine(vec![copy_rule()]);
    assert_eq!(success_type(&engine, "//:copy"), BuildRuleSuccessType::BuiltLocally);
    engine.close();

    project.clean();
    let engine = project.engine(vec![copy_rule()]);
    let result = Build::new(&engine, InterruptHandle::new())
        .execute(&[target("//:copy")])
        .unwrap();
    engine.close();

    let success = result.get(&target("//:copy")).unwrap().success().unwrap().clone();
    assert_eq!(success.success_type, BuildRuleSuccessType::FetchedFromCache);
    assert!(matches!(success.cache_result, FetchResult::Hit { .. }));
    assert_eq!(project.read("out/copy.txt"), "cached\n");
    assert_eq!(project.runs("copy-runs.log"), 1);
}

#[test]
fn test_uncacheable_rule_always_builds_after_clean() {
    let project = Project::new();
    project.write("src/in.txt", "x\n");
    let rule = || -> Vec<Arc<dyn BuildRule>> {
        vec![Arc::new(
            genrule("//:copy", &["src/in.txt"], "out/copy.txt", "cat $SRCS > $OUT && echo run >> copy-runs.log")
                .with_cacheable(false),
        )]
    };

    let engine = project.engine(rule());
    assert_eq!(success_type(&engine, "//:copy"), BuildRuleSuccessType::BuiltLocally);
    engine.close();

    project.clean();
    let engine = project.engine(rule());
    assert_eq!(success_type(&engine, "//:copy"), BuildRuleSuccessType::BuiltLocally);
    engine.close();
    assert_eq!(project.runs("copy-runs.log"), 2);
}

fn failing_graph() -> Vec<Arc<dyn BuildRule>> {
    vec![
        Arc::new(genrule("//:x", &[], "out/x.txt", "echo x > $OUT")),
        Arc::new(genrule("//:y", &[], "out/y.txt", "echo broken >&2; exit 3")),
        Arc::new(genrule("//:z", &[], "out/z.txt", "echo z > $OUT").with_deps(vec![target("//:y")])),
    ]
}

#[test]
fn test_keep_going_reports_every_failure() {
    let project = Project::new();
    let engine = project.engine(failing_graph());
    let targets = [target("//:x"), target("//:y"), target("//:z")];

    let result = Build::new(&engine, InterruptHandle::new())
        .with_keep_going(true)
        .execute(&targets)
        .unwrap();
    engine.close();

    assert!(!result.is_success());
    assert_eq!(result.failures.len(), 2);
    assert!(result.get(&target("//:x")).unwrap().is_success());
    assert!(matches!(
        result.get(&target("//:y")).unwrap().failure(),
        Some(TaskError::Failed(_))
    ));
    match result.get(&target("//:z")).unwrap().failure() {
        Some(TaskError::DependencyFailed { name, .. }) => assert_eq!(name, "//:y"),
        other => panic!("unexpected {other:?}"),
    }
    assert!(!project.root.path().join("out/z.txt").exists());
}

#[test]
fn test_fail_fast_stops_at_first_failure() {
    let project = Project::new();
    let engine = project.engine(failing_graph());
    let targets = [target("//:x"), target("//:y"), target("//:z")];

    let outcome = Build::new(&engine, InterruptHandle::new())
        .with_keep_going(false)
        .execute(&targets);
    engine.close();

    match outcome {
        Err(BuildError::Execution { first_failure, partial }) => {
            assert!(matches!(first_failure.root_cause(), TaskError::Failed(_)));
            assert_eq!(partial.failures.len(), 1);
            assert_eq!(partial.results.len(), 3);
            for (_, result) in &partial.results {
                if let Some(result) = result {
                    assert!(result.is_success() || result.failure().is_some());
                }
            }
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_dependencies_build_before_dependents() {
    let project = Project::new();
    project.write("src/in.txt", "base\n");
    let engine = project.engine(vec![
        copy_rule(),
        Arc::new(
            genrule("//:upper", &[], "out/upper.txt", "tr a-z A-Z < out/copy.txt > $OUT")
                .with_deps(vec![target("//:copy")]),
        ),
    ]);
    let result = Build::new(&engine, InterruptHandle::new())
        .execute(&[target("//:upper")])
        .unwrap();
    engine.close();

    assert!(result.is_success());
    assert_eq!(project.read("out/upper.txt"), "BASE\n");
}

#[test]
fn test_unknown_target_is_rejected() {
    let project = Project::new();
    let engine = project.engine(vec![copy_rule()]);
    let outcome = Build::new(&engine, InterruptHandle::new()).execute(&[target("//:nope")]);
    engine.close();
    assert!(matches!(outcome, Err(BuildError::UnknownTarget(_))));
}

#[cfg(unix)]
mod worker_tool {
    use super::*;
    use std::collections::BTreeMap;

    /// Worker copying the first path named in the job to the second
    const COPY_WORKER: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -E 's/.*"id":([0-9]+).*/\1/')
  case "$line" in
    *'"type":"handshake"'*)
      printf '{"type":"handshake","id":%s,"protocol_version":"0","capabilities":[]}\n' "$id"
      ;;
    *'"type":"command"'*)
      args=$(printf '%s' "$line" | sed -E 's/.*"args_path":"([^"]*)".*/\1/')
      set -- $(cat "$args")
      if cp "$1" "$2"; then code=0; else code=1; fi
      printf '{"type":"result","id":%s,"exit_code":%s}\n' "$id" "$code"
      ;;
  esac
done
"#;

    #[test]
    fn test_worker_tool_rules_share_a_process() {
        let project = Project::new();
        project.write("tools/copy-worker.sh", COPY_WORKER);
        project.write("src/a.txt", "alpha\n");
        project.write("src/b.txt", "beta\n");

        let tool = WorkerToolSpec {
            command: vec![
                "sh".to_string(),
                project.root.path().join("tools/copy-worker.sh").to_string_lossy().into_owned(),
            ],
            env: BTreeMap::new(),
            max_workers: 1,
        };
        let rule = |name: &str, src: &str, out: &str| -> Arc<dyn BuildRule> {
            Arc::new(WorkerToolRule::new(
                target(name),
                vec![PathBuf::from(src)],
                vec![PathBuf::from(out)],
                tool.clone(),
                "$SRCS $OUT",
            ))
        };

        let engine = project.engine(vec![
            rule("//:a", "src/a.txt", "out/a.txt"),
            rule("//:b", "src/b.txt", "out/b.txt"),
        ]);
        let result = Build::new(&engine, InterruptHandle::new())
            .execute(&[target("//:a"), target("//:b")])
            .unwrap();
        engine.close();

        assert!(result.is_success(), "{result:?}");
        assert_eq!(project.read("out/a.txt"), "alpha\n");
        assert_eq!(project.read("out/b.txt"), "beta\n");
    }
}
