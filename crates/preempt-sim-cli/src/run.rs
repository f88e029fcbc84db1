//! Builds a simulation from the command line and runs it.

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::info;

use preempt_sim::{
    Checkpoint, CompletedVm, Datacenter, DatacenterStats, JsonFileStore, MemoryStore, SimConfig,
    SimTime, Simulation, SnapshotStore, VmSpec,
};

use crate::cli::{Cli, Format};

/// Result of one run.
#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    /// Simulated time at which the run ended.
    pub end_time: SimTime,
    /// Checkpoint time the run resumed from.
    pub resumed_from: Option<SimTime>,
    /// Run counters.
    pub stats: DatacenterStats,
    /// Mean availability over completion records.
    pub mean_availability: f64,
    /// Completion records.
    #[serde(skip)]
    pub completed: Vec<CompletedVm>,
}

impl Summary {
    /// Writes the summary in `format`.
    ///
    /// # Errors
    ///
    /// Returns error if writing fails.
    pub fn write<W: Write>(&self, writer: &mut W, format: Format) -> Result<()> {
        match format {
            Format::Json => {
                serde_json::to_writer_pretty(&mut *writer, self)?;
                writeln!(writer)?;
            }
            Format::Table => {
                let s = &self.stats;
                if let Some(time) = self.resumed_from {
                    writeln!(writer, "{:<18} {time}", "resumed from")?;
                }
                for (name, value) in [
                    ("end time", self.end_time),
                    ("arrivals", s.arrivals),
                    ("rejected", s.rejected),
                    ("invalid", s.invalid),
                    ("allocations", s.allocations),
                    ("preemptions", s.preemptions),
                    ("backfills", s.backfills),
                    ("completed", s.completed),
                    ("terminated", s.terminated),
                    ("stale departures", s.stale_departures),
                    ("failed flushes", s.failed_flushes),
                ] {
                    writeln!(writer, "{name:<18} {value}")?;
                }
                writeln!(
                    writer,
                    "{:<18} {:.4}",
                    "mean availability", self.mean_availability
                )?;
            }
        }
        Ok(())
    }
}

/// Reads a JSON array of VM requests.
///
/// # Errors
///
/// Returns error if the file cannot be read or parsed.
pub fn load_trace(path: &Path) -> Result<Vec<VmSpec>> {
    let data = fs::read(path).with_context(|| format!("reading trace {}", path.display()))?;
    serde_json::from_slice(&data).with_context(|| format!("parsing trace {}", path.display()))
}

/// Requests still to be submitted after resuming from `checkpoint`.
fn remaining_after(trace: Vec<VmSpec>, checkpoint: &Checkpoint) -> Vec<VmSpec> {
    let known: HashSet<_> = checkpoint
        .running
        .iter()
        .chain(&checkpoint.waiting)
        .map(|vm| vm.id)
        .collect();
    trace
        .into_iter()
        .filter(|spec| spec.submit_time >= checkpoint.time && !known.contains(&spec.id))
        .collect()
}

/// Runs the simulation described by `cli`.
///
/// # Errors
///
/// Returns error if inputs are invalid or the simulation becomes inconsistent.
pub fn execute(cli: &Cli) -> Result<Summary> {
    let config = SimConfig::from_file(&cli.config)
        .with_context(|| format!("loading config {}", cli.config.display()))?;
    let trace = match &cli.trace {
        Some(path) => load_trace(path)?,
        None => Vec::new(),
    };

    let store: Box<dyn SnapshotStore> = match &cli.output {
        Some(dir) => Box::new(
            JsonFileStore::open(dir)
                .with_context(|| format!("opening snapshot directory {}", dir.display()))?,
        ),
        None => Box::new(MemoryStore::new()),
    };

    let (datacenter, trace, resumed_from) = if cli.resume {
        let Some(checkpoint) = store.latest_checkpoint()? else {
            bail!("no checkpoint found to resume from");
        };
        info!(time = checkpoint.time, "resuming from checkpoint");
        let trace = remaining_after(trace, &checkpoint);
        let time = checkpoint.time;
        (Datacenter::restore(&config, &checkpoint, store)?, trace, Some(time))
    } else {
        (Datacenter::new(&config, store)?, trace, None)
    };

    let mut sim = Simulation::new(datacenter);
    info!(requests = trace.len(), "submitting trace");
    sim.submit_all(trace);
    sim.run()?;

    let end_time = sim.now();
    let mut datacenter = sim.into_datacenter();
    let stats = *datacenter.stats();
    let completed = datacenter.drain_completed();
    let mean_availability = if completed.is_empty() {
        0.0
    } else {
        completed.iter().map(|r| r.availability).sum::<f64>() / completed.len() as f64
    };

    Ok(Summary {
        end_time,
        resumed_from,
        stats,
        mean_availability,
        completed,
    })
}

/// Writes completion records as a JSON array.
///
/// # Errors
///
/// Returns error if the file cannot be written.
pub fn write_completed(path: &Path, records: &[CompletedVm]) -> Result<()> {
    let json = serde_json::to_vec_pretty(records)?;
    fs::write(path, json).with_context(|| format!("writing {}", path.display()))
}
