//! Command-line argument parsing with clap.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Replays a VM trace through a priority-preemptive datacenter.
#[derive(Parser, Debug, Clone)]
#[command(name = "preempt-sim")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Simulation configuration (JSON).
    #[arg(short, long, env = "PREEMPT_SIM_CONFIG")]
    pub config: PathBuf,

    /// VM trace: a JSON array of VM requests.
    #[arg(short, long)]
    pub trace: Option<PathBuf>,

    /// Directory receiving snapshot batches. Snapshots stay in memory if unset.
    #[arg(short, long, env = "PREEMPT_SIM_OUTPUT")]
    pub output: Option<PathBuf>,

    /// Resume from the latest checkpoint found in the output directory.
    #[arg(long, requires = "output")]
    pub resume: bool,

    /// File receiving the completed-VM records (JSON).
    #[arg(long)]
    pub completed: Option<PathBuf>,

    /// Summary format.
    #[arg(short, long, value_enum, default_value_t = Format::Table)]
    pub format: Format,
}

/// Output format options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
pub enum Format {
    /// Human-readable table format.
    #[default]
    Table,
    /// JSON output for scripting.
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_arguments() {
        let cli = Cli::try_parse_from(["preempt-sim", "--config", "sim.json"]).expect("parse");
        assert_eq!(cli.config, PathBuf::from("sim.json"));
        assert!(cli.trace.is_none());
        assert!(!cli.resume);
        assert_eq!(cli.format, Format::Table);
    }

    #[test]
    fn resume_requires_output_directory() {
        let result = Cli::try_parse_from(["preempt-sim", "--config", "sim.json", "--resume"]);
        assert!(result.is_err());
    }

    #[test]
    fn parses_full_arguments() {
        let cli = Cli::try_parse_from([
            "preempt-sim",
            "-c",
            "sim.json",
            "-t",
            "trace.json",
            "-o",
            "out",
            "--resume",
            "--completed",
            "done.json",
            "--format",
            "json",
        ])
        .expect("parse");
        assert!(cli.resume);
        assert_eq!(cli.output, Some(PathBuf::from("out")));
        assert_eq!(cli.format, Format::Json);
    }
}
