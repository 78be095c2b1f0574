//! Coordinate checkpoints and abort remainders.
//!
//! While a scan runs, the not-yet-visited coordinates are periodically
//! written to a single coordinate set named `<unit>_checkpoint`. Each write
//! overwrites the previous one. Writes happen on a background task; a write
//! that fails is logged and the scan carries on.
//!
//! On clean completion the checkpoint is deleted. On abort it is deleted as
//! well, and the unvisited remainder is stored under a fresh name
//! (`<unit>_remaining_<timestamp>`) so an operator can resume from it. A run
//! that fails stores the remainder too and rewrites the checkpoint to the
//! exact point of failure instead of deleting it.

use crate::coordinates::{CoordinateHub, CoordinateSet};
use crate::error::AppResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Name of the checkpoint set for a unit.
pub fn checkpoint_name(unit_name: &str) -> String {
    format!("{unit_name}_checkpoint")
}

/// JSON sidecar describing a checkpoint file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Unit the scan writes to
    pub unit_name: String,
    /// Name of the coordinate set holding the remaining coordinates
    pub set_name: String,
    /// When the checkpoint was written
    pub created: DateTime<Utc>,
    /// Coordinates visited so far
    pub visited: usize,
    /// Coordinates in the run
    pub total: usize,
    /// Coordinates in the checkpoint set
    pub remaining: usize,
}

impl CheckpointRecord {
    /// Save as pretty JSON, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> AppResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load from JSON.
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// Decides when a periodic checkpoint is due.
#[derive(Debug, Clone)]
pub struct CadenceCounter {
    every: usize,
    since_last: usize,
}

impl CadenceCounter {
    /// Due every `every` ticks; 0 never fires.
    pub fn new(every: usize) -> Self {
        Self {
            every,
            since_last: 0,
        }
    }

    /// Count one visited unit; true when a checkpoint is due.
    pub fn tick(&mut self) -> bool {
        if self.every == 0 {
            return false;
        }
        self.since_last += 1;
        if self.since_last >= self.every {
            self.since_last = 0;
            true
        } else {
            false
        }
    }
}

/// Counters of a finished writer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckpointStats {
    /// Successful writes
    pub written: usize,
    /// Successful deletes
    pub deleted: usize,
    /// Writes or deletes that failed
    pub failed: usize,
}

#[derive(Debug)]
enum CheckpointRequest {
    Write {
        remaining: CoordinateSet,
        visited: usize,
        total: usize,
    },
    Delete,
}

/// Handle to the background checkpoint task of one run.
#[derive(Debug)]
pub struct CheckpointWriter {
    tx: mpsc::Sender<CheckpointRequest>,
    task: JoinHandle<CheckpointStats>,
    set_name: String,
}

impl CheckpointWriter {
    /// Spawn the writer for `unit_name`.
    ///
    /// With a `dir`, each checkpoint is also written to
    /// `<dir>/<unit>_checkpoint.csv` plus a JSON sidecar.
    pub fn spawn(hub: Arc<CoordinateHub>, unit_name: &str, dir: Option<PathBuf>) -> Self {
        let (tx, rx) = mpsc::channel(16);
        let set_name = checkpoint_name(unit_name);
        let task = tokio::spawn(run_writer(
            rx,
            hub,
            unit_name.to_string(),
            set_name.clone(),
            dir,
        ));
        Self { tx, task, set_name }
    }

    /// Name of the checkpoint set.
    pub fn set_name(&self) -> &str {
        &self.set_name
    }

    /// Request an overwrite with the remaining coordinates.
    pub async fn checkpoint(&self, remaining: CoordinateSet, visited: usize, total: usize) {
        let request = CheckpointRequest::Write {
            remaining,
            visited,
            total,
        };
        if self.tx.send(request).await.is_err() {
            warn!(set = %self.set_name, "Checkpoint writer is gone; checkpoint skipped");
        }
    }

    /// Request removal of the checkpoint.
    pub async fn clear(&self) {
        if self.tx.send(CheckpointRequest::Delete).await.is_err() {
            warn!(set = %self.set_name, "Checkpoint writer is gone; delete skipped");
        }
    }

    /// Process outstanding requests and stop.
    pub async fn shutdown(self) -> CheckpointStats {
        drop(self.tx);
        match self.task.await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(error = %e, "Checkpoint writer ended abnormally");
                CheckpointStats::default()
            }
        }
    }
}

async fn run_writer(
    mut rx: mpsc::Receiver<CheckpointRequest>,
    hub: Arc<CoordinateHub>,
    unit_name: String,
    set_name: String,
    dir: Option<PathBuf>,
) -> CheckpointStats {
    let mut stats = CheckpointStats::default();
    while let Some(request) = rx.recv().await {
        match request {
            CheckpointRequest::Write {
                remaining,
                visited,
                total,
            } => {
                let remaining = remaining.renamed(set_name.clone());
                let record = CheckpointRecord {
                    unit_name: unit_name.clone(),
                    set_name: set_name.clone(),
                    created: Utc::now(),
                    visited,
                    total,
                    remaining: remaining.len(),
                };
                let file_result = match &dir {
                    Some(dir) => write_files(dir, &remaining, &record),
                    None => Ok(()),
                };
                hub.upsert(remaining);
                match file_result {
                    Ok(()) => {
                        stats.written += 1;
                        debug!(set = %set_name, visited, total, "Checkpoint written");
                    }
                    Err(e) => {
                        stats.failed += 1;
                        warn!(set = %set_name, error = %e, "Checkpoint write failed; scan continues");
                    }
                }
            }
            CheckpointRequest::Delete => {
                hub.remove(&set_name);
                let file_result = match &dir {
                    Some(dir) => remove_files(dir, &set_name),
                    None => Ok(()),
                };
                match file_result {
                    Ok(()) => stats.deleted += 1,
                    Err(e) => {
                        stats.failed += 1;
                        warn!(set = %set_name, error = %e, "Checkpoint delete failed");
                    }
                }
            }
        }
    }
    stats
}

fn csv_path(dir: &Path, set_name: &str) -> PathBuf {
    dir.join(format!("{set_name}.csv"))
}

fn record_path(dir: &Path, set_name: &str) -> PathBuf {
    dir.join(format!("{set_name}.json"))
}

fn write_files(dir: &Path, set: &CoordinateSet, record: &CheckpointRecord) -> AppResult<()> {
    #[cfg(feature = "storage_csv")]
    crate::coordinates::io::save_csv(set, csv_path(dir, set.name()))?;
    #[cfg(not(feature = "storage_csv"))]
    let _ = set;
    record.save(record_path(dir, &record.set_name))
}

fn remove_files(dir: &Path, set_name: &str) -> AppResult<()> {
    for path in [csv_path(dir, set_name), record_path(dir, set_name)] {
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Store `coordinates[visited..]` as a new, uniquely named set.
///
/// Returns the new set's name, or `None` when nothing remains. Writing the
/// file copy is best effort; the in-memory set is always created.
pub fn persist_remainder(
    hub: &CoordinateHub,
    unit_name: &str,
    coordinates: &CoordinateSet,
    visited: usize,
    dir: Option<&Path>,
) -> AppResult<Option<String>> {
    if visited >= coordinates.len() {
        return Ok(None);
    }
    let name = hub.unique_name(&format!("{unit_name}_remaining"));
    let remainder = coordinates.tail(visited, name.clone());
    let count = remainder.len();

    #[cfg(feature = "storage_csv")]
    if let Some(dir) = dir {
        if let Err(e) = crate::coordinates::io::save_csv(&remainder, csv_path(dir, &name)) {
            warn!(set = %name, error = %e, "Could not write remainder file");
        }
    }
    #[cfg(not(feature = "storage_csv"))]
    let _ = dir;

    hub.insert(remainder)?;
    info!(set = %name, remaining = count, "Unvisited coordinates saved for resumption");
    Ok(Some(name))
}
