//! Persistence collaborators for snapshot batches.
//!
//! A [`SnapshotStore`] writes a [`SnapshotBatch`] as one transaction: every
//! record lands or none does. Failures are reported, never panicked on; the
//! datacenter keeps the data buffered and retries on its next flush.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Result, SimError};
use crate::snapshot::{Checkpoint, SnapshotBatch};

/// Transactional sink for snapshot batches.
pub trait SnapshotStore: Send {
    /// Writes all records of `batch`, or none of them.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::Persistence`] if the batch was not committed.
    fn write_batch(&mut self, batch: &SnapshotBatch) -> Result<()>;

    /// Returns the most recent committed checkpoint.
    ///
    /// # Errors
    ///
    /// Returns error if stored data cannot be read.
    fn latest_checkpoint(&self) -> Result<Option<Checkpoint>>;
}

#[derive(Debug, Default)]
struct MemoryState {
    batches: Vec<SnapshotBatch>,
    failures_pending: usize,
}

/// In-memory store. Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` writes fail.
    pub fn fail_next(&self, count: usize) {
        self.state.lock().failures_pending = count;
    }

    /// Returns all committed batches.
    #[must_use]
    pub fn batches(&self) -> Vec<SnapshotBatch> {
        self.state.lock().batches.clone()
    }

    /// Number of committed batches.
    #[must_use]
    pub fn batch_count(&self) -> usize {
        self.state.lock().batches.len()
    }
}

impl SnapshotStore for MemoryStore {
    fn write_batch(&mut self, batch: &SnapshotBatch) -> Result<()> {
        let mut state = self.state.lock();
        if state.failures_pending > 0 {
            state.failures_pending -= 1;
            return Err(SimError::Persistence {
                reason: "injected write failure".into(),
            });
        }
        state.batches.push(batch.clone());
        Ok(())
    }

    fn latest_checkpoint(&self) -> Result<Option<Checkpoint>> {
        Ok(self
            .state
            .lock()
            .batches
            .iter()
            .rev()
            .find_map(|batch| batch.checkpoint.clone()))
    }
}

/// Directory of JSON batch files.
///
/// Each batch is written to a temporary file and renamed into place, so a
/// batch file is either complete or absent.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
    next_seq: u64,
}

impl JsonFileStore {
    /// Opens (creating if needed) a store rooted at `dir`.
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be created or listed.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let files = Self::batch_files(&dir)?;
        let next_seq = files.last().map_or(0, |(seq, _)| seq + 1);
        debug!(dir = %dir.display(), existing = files.len(), next_seq, "opened snapshot store");
        Ok(Self { dir, next_seq })
    }

    /// Returns the store directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Sequence number encoded in a `batch-NNNNNNNN.json` file name.
    fn batch_seq(path: &Path) -> Option<u64> {
        path.file_name()?
            .to_str()?
            .strip_prefix("batch-")?
            .strip_suffix(".json")?
            .parse()
            .ok()
    }

    /// Committed batch files, oldest first.
    fn batch_files(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
        let mut files: Vec<(u64, PathBuf)> = fs::read_dir(dir)?
            .filter_map(std::result::Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .filter_map(|path| Some((Self::batch_seq(&path)?, path)))
            .collect();
        files.sort();
        Ok(files)
    }
}

impl SnapshotStore for JsonFileStore {
    fn write_batch(&mut self, batch: &SnapshotBatch) -> Result<()> {
        let name = format!("batch-{:08}.json", self.next_seq);
        let path = self.dir.join(&name);
        let tmp = self.dir.join(format!(".{name}.tmp"));

        let json = serde_json::to_vec_pretty(batch)?;
        if let Err(e) = fs::write(&tmp, json).and_then(|()| fs::rename(&tmp, &path)) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }

        self.next_seq += 1;
        debug!(path = %path.display(), usage = batch.usage.len(), "snapshot batch committed");
        Ok(())
    }

    fn latest_checkpoint(&self) -> Result<Option<Checkpoint>> {
        for (_, path) in Self::batch_files(&self.dir)?.iter().rev() {
            let data = fs::read(path)?;
            let batch: SnapshotBatch = serde_json::from_slice(&data)?;
            if batch.checkpoint.is_some() {
                return Ok(batch.checkpoint);
            }
        }
        Ok(None)
    }
}
