//! `hitzeleiter clean`

use super::Cli;
use anyhow::Context;
use convenient_engine::artifact;
use convenient_engine::{ActionGraph, BuildPaths};
use std::fs;
use std::io;
use tracing::info;

/// Remove the output tree (rule keys, manifests, scratch space) and with
/// `outputs` also every declared rule output
pub fn clean(cli: &Cli, outputs: bool) -> anyhow::Result<()> {
    let config = cli.load_config()?;
    let paths = BuildPaths::new(&cli.project_root, &config.out_dir);

    match fs::remove_dir_all(paths.out_root()) {
        Ok(()) => info!("Removed {}", paths.out_root().display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("removing {}", paths.out_root().display())),
    }

    if outputs {
        let graph_path = cli.graph_path();
        let graph = ActionGraph::from_json_file(&graph_path)
            .with_context(|| format!("loading action graph {}", graph_path.display()))?;
        let mut removed = 0;
        for rule in graph.rules() {
            artifact::remove_outputs(paths.project_root(), rule.outputs())
                .with_context(|| format!("removing outputs of {}", rule.target()))?;
            removed += rule.outputs().len();
        }
        info!("Removed {} declared outputs of {} rules", removed, graph.len());
    }

    println!("Cleaned {}", paths.out_root().display());
    Ok(())
}
