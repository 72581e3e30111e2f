//! Hitzeleiter - caching build engine driver
//!
//! Usage:
//!   hitzeleiter build [targets...]      Build targets of BUILD.json
//!   hitzeleiter build -k --report r.json
//!   hitzeleiter clean [--outputs]       Remove build metadata (and outputs)

mod commands;

use clap::Parser;
use commands::{Cli, Commands};
use std::process;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "hitzeleiter=debug,convenient_engine=debug,convenient_executor=debug,convenient_worker=debug,convenient_cache=debug"
    } else {
        "hitzeleiter=info,convenient_engine=info,convenient_cache=warn"
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match &cli.command {
        Commands::Build(args) => commands::build::execute(&cli, args),
        Commands::Clean { outputs } => commands::clean::clean(&cli, *outputs).map(|()| 0),
    };

    match result {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("Error: {e:#}");
            process::exit(1);
        }
    }
}
