//! Build steps
//!
//! Rules describe their work as an ordered list of steps. The engine runs
//! them in order, stops at the first failure and does not otherwise interpret
//! what a step does.

use crate::error::StepError;
use crate::rules::WorkerToolSpec;
use crate::target::{BuildPaths, BuildTarget};
use crate::worker_pools::WorkerProcessPoolFactory;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Instant;
use tracing::{debug, info};

/// Everything a step may use while executing
#[derive(Clone, Copy)]
pub struct StepContext<'a> {
    /// Rule being built
    pub target: &'a BuildTarget,
    /// Project and output layout
    pub paths: &'a BuildPaths,
    /// Persistent worker pools shared across the build
    pub worker_pools: &'a WorkerProcessPoolFactory,
}

/// Output of a successful step
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepExecutionResult {
    /// Captured standard output
    pub stdout: Option<String>,
    /// Captured standard error
    pub stderr: Option<String>,
}

/// A unit of work inside a rule
pub trait Step: Send + Sync + fmt::Debug {
    /// Short identifier, e.g. `sh` or `mkdir`
    fn short_name(&self) -> &'static str;

    /// Human readable description
    fn description(&self) -> String;

    /// Run the step
    ///
    /// # Errors
    ///
    /// Non-zero exit codes and I/O errors
    fn execute(&self, context: &StepContext<'_>) -> Result<StepExecutionResult, StepError>;
}

/// Runs a shell command through `sh -c`
#[derive(Debug, Clone)]
pub struct ShellStep {
    command: String,
    env: BTreeMap<String, String>,
    working_dir: PathBuf,
}

impl ShellStep {
    /// Shell step running `command` inside `working_dir`
    pub fn new(command: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            env: BTreeMap::new(),
            working_dir: working_dir.into(),
        }
    }

    /// Add environment variables
    #[must_use]
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }
}

impl Step for ShellStep {
    fn short_name(&self) -> &'static str {
        "sh"
    }

    fn description(&self) -> String {
        format!("sh -c {:?}", self.command)
    }

    fn execute(&self, _context: &StepContext<'_>) -> Result<StepExecutionResult, StepError> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .envs(&self.env)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        match output.status.code() {
            Some(0) => Ok(StepExecutionResult {
                stdout: Some(stdout),
                stderr: Some(stderr),
            }),
            Some(exit_code) => Err(StepError::CommandFailed {
                description: self.description(),
                exit_code,
                stderr: Some(stderr),
            }),
            None => Err(StepError::Killed(self.description())),
        }
    }
}

/// Creates a directory and its parents
#[derive(Debug, Clone)]
pub struct MkdirStep {
    path: PathBuf,
}

impl MkdirStep {
    /// Step creating `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Step for MkdirStep {
    fn short_name(&self) -> &'static str {
        "mkdir"
    }

    fn description(&self) -> String {
        format!("mkdir -p {}", self.path.display())
    }

    fn execute(&self, _context: &StepContext<'_>) -> Result<StepExecutionResult, StepError> {
        fs::create_dir_all(&self.path)?;
        Ok(StepExecutionResult::default())
    }
}

/// Removes a file if it exists
#[derive(Debug, Clone)]
pub struct RmStep {
    path: PathBuf,
}

impl RmStep {
    /// Step removing `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Step for RmStep {
    fn short_name(&self) -> &'static str {
        "rm"
    }

    fn description(&self) -> String {
        format!("rm -f {}", self.path.display())
    }

    fn execute(&self, _context: &StepContext<'_>) -> Result<StepExecutionResult, StepError> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(StepExecutionResult::default()),
        }
    }
}

/// Submits a job to a persistent worker process
#[derive(Debug, Clone)]
pub struct WorkerJobStep {
    tool: WorkerToolSpec,
    args: String,
}

impl WorkerJobStep {
    /// Step sending `args` to a process of `tool`
    pub fn new(tool: WorkerToolSpec, args: impl Into<String>) -> Self {
        Self {
            tool,
            args: args.into(),
        }
    }
}

impl Step for WorkerJobStep {
    fn short_name(&self) -> &'static str {
        "worker"
    }

    fn description(&self) -> String {
        format!("{} <<< {}", self.tool.command.join(" "), self.args)
    }

    fn execute(&self, context: &StepContext<'_>) -> Result<StepExecutionResult, StepError> {
        let pool = context.worker_pools.get_pool(&self.tool);
        let mut lease = pool.borrow()?;
        let result = lease.submit_and_wait_for_job(&self.args)?;
        if result.exit_code == 0 {
            Ok(StepExecutionResult {
                stdout: result.stdout,
                stderr: result.stderr,
            })
        } else {
            Err(StepError::CommandFailed {
                description: self.description(),
                exit_code: result.exit_code,
                stderr: result.stderr,
            })
        }
    }
}

/// Run `steps` in order, stopping at the first failure
///
/// # Errors
///
/// The first failing step's error
pub fn run_steps(steps: &[Box<dyn Step>], context: &StepContext<'_>) -> Result<(), StepError> {
    for step in steps {
        let start = Instant::now();
        debug!("{}: running {}", context.target, step.description());
        let result = step.execute(context);
        let elapsed = start.elapsed();
        match result {
            Ok(output) => {
                debug!("{}: {} finished in {:?}", context.target, step.short_name(), elapsed);
                if let Some(stdout) = output.stdout.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
                    info!("{}: {}", context.target, stdout);
                }
            }
            Err(e) => {
                debug!("{}: {} failed after {:?}", context.target, step.short_name(), elapsed);
                return Err(e);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn run(steps: Vec<Box<dyn Step>>, root: &Path) -> Result<(), StepError> {
        let paths = BuildPaths::new(root, Path::new("out"));
        let target = BuildTarget::parse("//t:t").unwrap();
        let pools = WorkerProcessPoolFactory::new(paths.clone());
        let context = StepContext {
            target: &target,
            paths: &paths,
            worker_pools: &pools,
        };
        run_steps(&steps, &context)
    }

    #[cfg(unix)]
    #[test]
    fn test_shell_step_sees_env_and_working_dir() {
        let dir = TempDir::new().unwrap();
        let mut env = BTreeMap::new();
        let _ = env.insert("GREETING".to_string(), "hello".to_string());
        let steps: Vec<Box<dyn Step>> = vec![
            Box::new(MkdirStep::new(dir.path().join("gen"))),
            Box::new(ShellStep::new("echo \"$GREETING\" > gen/out.txt", dir.path()).with_env(env)),
        ];
        run(steps, dir.path()).unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("gen/out.txt")).unwrap(), "hello\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_failure_stops_later_steps() {
        let dir = TempDir::new().unwrap();
        let steps: Vec<Box<dyn Step>> = vec![
            Box::new(ShellStep::new("echo broken >&2; exit 3", dir.path())),
            Box::new(MkdirStep::new(dir.path().join("never"))),
        ];
        match run(steps, dir.path()).unwrap_err() {
            StepError::CommandFailed { exit_code, stderr, .. } => {
                assert_eq!(exit_code, 3);
                assert_eq!(stderr.as_deref().map(str::trim), Some("broken"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!dir.path().join("never").exists());
    }

    #[test]
    fn test_rm_step_ignores_missing_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("stale");
        fs::write(&file, "x").unwrap();
        let steps: Vec<Box<dyn Step>> = vec![Box::new(RmStep::new(&file)), Box::new(RmStep::new(&file))];
        run(steps, dir.path()).unwrap();
        assert!(!file.exists());
    }
}
