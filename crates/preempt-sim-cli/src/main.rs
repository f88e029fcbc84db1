//! `preempt-sim` binary entrypoint.

use std::io;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use preempt_sim_cli::{Cli, execute, write_completed};

fn main() -> ExitCode {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let summary = execute(cli)?;
    if let Some(path) = &cli.completed {
        write_completed(path, &summary.completed)?;
    }
    let mut stdout = io::stdout().lock();
    summary.write(&mut stdout, cli.format)
}
