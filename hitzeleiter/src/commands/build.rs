//! `hitzeleiter build`

use super::Cli;
use anyhow::Context;
use clap::{Args, ValueEnum};
use convenient_engine::{
    ActionGraph, Build, BuildTarget, CachingBuildEngine, DepFiles, EngineConfig, InterruptHandle, ReportOptions,
    SchedulerKind,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum DepFilesArg {
    Disabled,
    Enabled,
    Cache,
}

impl From<DepFilesArg> for DepFiles {
    fn from(arg: DepFilesArg) -> Self {
        match arg {
            DepFilesArg::Disabled => DepFiles::Disabled,
            DepFilesArg::Enabled => DepFiles::Enabled,
            DepFilesArg::Cache => DepFiles::Cache,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SchedulerArg {
    Default,
    Toposort,
}

impl From<SchedulerArg> for SchedulerKind {
    fn from(arg: SchedulerArg) -> Self {
        match arg {
            SchedulerArg::Default => SchedulerKind::Default,
            SchedulerArg::Toposort => SchedulerKind::Toposort,
        }
    }
}

#[derive(Debug, Args)]
pub struct BuildArgs {
    /// Targets such as //app:bin
    pub targets: Vec<String>,

    /// Continue past failed rules
    #[arg(short, long)]
    pub keep_going: bool,

    /// Scheduler threads
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Local artifact cache directory
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Remote HTTP artifact cache
    #[arg(long)]
    pub http_cache: Option<String>,

    /// Fetch from caches but never store
    #[arg(long)]
    pub read_only_cache: bool,

    /// Dependency-file rule key mode
    #[arg(long, value_enum)]
    pub dep_files: Option<DepFilesArg>,

    /// How scheduler threads wait for dependencies
    #[arg(long, value_enum)]
    pub scheduler: Option<SchedulerArg>,

    /// Write a JSON build report here
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Do not print the build summary
    #[arg(short, long)]
    pub quiet: bool,
}

impl BuildArgs {
    /// Apply command-line overrides on top of the file configuration
    pub fn apply(&self, config: &mut EngineConfig) {
        config.keep_going |= self.keep_going;
        if let Some(jobs) = self.jobs {
            config.threads = jobs.max(1);
        }
        if let Some(dir) = &self.cache_dir {
            config.cache.dir = Some(dir.clone());
        }
        if let Some(url) = &self.http_cache {
            config.cache.http_url = Some(url.clone());
        }
        config.cache.read_only |= self.read_only_cache;
        if let Some(dep_files) = self.dep_files {
            config.dep_files = dep_files.into();
        }
        if let Some(scheduler) = self.scheduler {
            config.scheduler = scheduler.into();
        }
    }
}

/// Route Ctrl-C to `interrupt`
///
/// The signal is awaited on a thread of its own so the engine's runtimes are
/// never entered from the main thread.
fn install_ctrl_c(interrupt: InterruptHandle) {
    let spawned = std::thread::Builder::new().name("ctrl-c".to_string()).spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(e) => {
                warn!("Cannot watch for Ctrl-C: {}", e);
                return;
            }
        };
        if runtime.block_on(tokio::signal::ctrl_c()).is_ok() {
            warn!("Interrupted, cancelling pending rules");
            interrupt.interrupt();
        }
    });
    if let Err(e) = spawned {
        warn!("Cannot watch for Ctrl-C: {}", e);
    }
}

/// Run the build; returns the process exit code
pub fn execute(cli: &Cli, args: &BuildArgs) -> anyhow::Result<i32> {
    let mut config = cli.load_config()?;
    args.apply(&mut config);

    let graph_path = cli.graph_path();
    let graph = ActionGraph::from_json_file(&graph_path)
        .with_context(|| format!("loading action graph {}", graph_path.display()))?;

    let targets = if args.targets.is_empty() {
        let mut all: Vec<BuildTarget> = graph.rules().map(|rule| rule.target().clone()).collect();
        all.sort();
        all
    } else {
        args.targets
            .iter()
            .map(|name| BuildTarget::parse(name))
            .collect::<Result<Vec<_>, _>>()?
    };
    info!("Building {} of {} rules", targets.len(), graph.len());

    let root = cli
        .project_root
        .canonicalize()
        .with_context(|| format!("project root {}", cli.project_root.display()))?;
    let engine = CachingBuildEngine::new(Arc::new(graph), root, config)?;
    let interrupt = InterruptHandle::new();
    install_ctrl_c(interrupt.clone());

    let options = ReportOptions {
        console: !args.quiet,
        json_path: args.report.clone(),
    };
    let code = Build::new(&engine, interrupt).execute_and_print(&targets, &options);
    engine.close();
    Ok(code)
}
