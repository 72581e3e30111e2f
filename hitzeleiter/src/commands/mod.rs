//! Hitzeleiter command-line interface
//!
//! - `build`: build targets of the project's action graph
//! - `clean`: remove the output tree and, optionally, declared outputs

use anyhow::Context;
use clap::{Parser, Subcommand};
use convenient_engine::EngineConfig;
use std::path::{Path, PathBuf};

pub mod build;
pub mod clean;

/// Name of the configuration file looked up in the project root
pub const CONFIG_FILE: &str = "hitzeleiter.json";

/// Hitzeleiter - caching build engine driver
#[derive(Parser)]
#[command(name = "hitzeleiter")]
#[command(about = "Incremental, cache-aware builds of a JSON action graph")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Project root all rule paths are relative to
    #[arg(short = 'C', long, default_value = ".", global = true)]
    pub project_root: PathBuf,

    /// Engine configuration (default: <project-root>/hitzeleiter.json if present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Action graph description, relative to the project root
    #[arg(short, long, default_value = "BUILD.json", global = true)]
    pub graph: PathBuf,

    /// Debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build targets (all rules when none are given)
    Build(build::BuildArgs),

    /// Remove build metadata and outputs
    Clean {
        /// Also remove every rule's declared outputs
        #[arg(long)]
        outputs: bool,
    },
}

impl Cli {
    /// Configuration from `--config`, or the project's config file, or defaults
    pub fn load_config(&self) -> anyhow::Result<EngineConfig> {
        let path = match &self.config {
            Some(path) => Some(path.clone()),
            None => Some(self.project_root.join(CONFIG_FILE)).filter(|path| path.exists()),
        };
        match path {
            Some(path) => {
                tracing::debug!("Loading configuration from {}", path.display());
                EngineConfig::from_file(&path).with_context(|| format!("loading {}", path.display()))
            }
            None => Ok(EngineConfig::default()),
        }
    }

    /// Absolute location of the action graph description
    #[must_use]
    pub fn graph_path(&self) -> PathBuf {
        resolve(&self.project_root, &self.graph)
    }
}

fn resolve(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_build_with_overrides() {
        let cli = Cli::try_parse_from([
            "hitzeleiter",
            "-C",
            "/work",
            "build",
            "//app:bin",
            "--keep-going",
            "-j",
            "3",
            "--dep-files",
            "enabled",
        ])
        .unwrap();
        assert_eq!(cli.graph_path(), PathBuf::from("/work/BUILD.json"));
        match cli.command {
            Commands::Build(args) => {
                assert_eq!(args.targets, ["//app:bin"]);
                assert!(args.keep_going);
                assert_eq!(args.jobs, Some(3));
            }
            Commands::Clean { .. } => panic!("expected build"),
        }
    }

    #[test]
    fn test_config_file_in_project_root_is_used() {
        let root = tempfile::TempDir::new().unwrap();
        std::fs::write(root.path().join(CONFIG_FILE), r#"{"threads": 7}"#).unwrap();
        let cli = Cli::try_parse_from([
            "hitzeleiter",
            "clean",
            "--project-root",
            root.path().to_str().unwrap(),
        ])
        .unwrap();
        assert_eq!(cli.load_config().unwrap().threads, 7);

        let cli = Cli::try_parse_from(["hitzeleiter", "clean", "--config", "/nonexistent/config.json"]).unwrap();
        assert!(cli.load_config().is_err());
    }
}
