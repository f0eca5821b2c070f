mod cli;
mod commands;
mod config;
mod error;
mod model;
mod mongo;
mod ndcg;
mod pipeline;
mod rankings;
mod results_store;
mod scoring;
mod util;

use anyhow::Result;
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.debug_requested());

    if let Err(err) = run(cli) {
        error!(error = %err, "command failed");
        for cause in err.chain().skip(1) {
            error!(cause = %cause, "caused by");
        }
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Evaluate(args) => commands::evaluate::run(args),
        Commands::Results(args) => commands::results::run(args),
    }
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
