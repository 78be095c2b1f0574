//! Mapping acquisition: scan drivers and the machinery they coordinate.
//!
//! A mapping run is one driver iterating one ordered coordinate set:
//!
//! ```text
//! Sequencer ──> driver loop ──push──> AutosavePipeline ──append──> MappingUnit
//!                  │
//!                  └──every K points / on abort──> CheckpointWriter ──> CoordinateHub
//! ```
//!
//! - [`discrete::DiscreteScanDriver`]: move, settle, capture, one point at a time
//! - [`continuous::ContinuousScanDriver`]: move along lines while the
//!   spectrometer free-runs, binning captures with trigger signals
//!
//! Both drivers poll an explicit cancel flag ([`ScanControl`]) at the top of
//! every loop iteration. Cancelling never interrupts a hardware command that
//! is already in flight.
//!
//! A run ends in one of three ways ([`ScanOutcome`]). Only `Done` deletes the
//! checkpoint. `Aborted` and `Failed` both store the unvisited remainder, and
//! `Failed` also leaves the checkpoint in place.

pub mod autosave;
pub mod checkpoint;
pub mod continuous;
pub mod discrete;
pub mod progress;
pub mod state;

pub use autosave::{AutosaveItem, AutosavePipeline, AutosaveStats, QueueState};
pub use checkpoint::{CadenceCounter, CheckpointRecord, CheckpointWriter};
pub use continuous::ContinuousScanDriver;
pub use discrete::DiscreteScanDriver;
pub use progress::{ProgressTracker, ScanProgress};
pub use state::{DriverState, PointState};

use crate::coordinates::{CoordinateHub, CoordinateSet};
use crate::error::{AppResult, MappingError};
use crate::mapping::MappingUnit;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Cloneable cancel handle shared between a driver and its operators.
#[derive(Debug, Clone, Default)]
pub struct ScanControl {
    cancel: Arc<AtomicBool>,
}

impl ScanControl {
    /// New handle, not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request the running scan to stop before its next hardware command.
    pub fn abort(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Whether an abort was requested.
    pub fn is_aborted(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.cancel.store(false, Ordering::SeqCst);
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanOutcome {
    /// Every coordinate was visited
    Done,
    /// The cancel flag was observed first
    Aborted,
    /// The loop stopped on an error before the end
    Failed,
}

impl ScanOutcome {
    /// Driver state a run with this outcome ends in.
    pub fn driver_state(self) -> DriverState {
        match self {
            ScanOutcome::Done => DriverState::Done,
            ScanOutcome::Aborted => DriverState::Aborted,
            ScanOutcome::Failed => DriverState::Failed,
        }
    }
}

/// Summary of one mapping run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanReport {
    /// Outcome
    pub outcome: ScanOutcome,
    /// Unit written to
    pub unit_name: String,
    /// Coordinates visited
    pub visited: usize,
    /// Coordinates in the run
    pub total: usize,
    /// Measurements handed to the autosave pipeline
    pub enqueued: usize,
    /// Measurements stored in the unit
    pub appended: usize,
    /// Measurements the unit rejected
    pub failed_appends: usize,
    /// Indices reached without motion confirmation
    pub flagged_points: Vec<usize>,
    /// Indices with no usable capture
    pub skipped_points: Vec<usize>,
    /// Autosave drain-and-restart cycles
    pub queue_restarts: u64,
    /// Stream controller restarts (continuous mode)
    pub stream_restarts: usize,
    /// Periodic checkpoints written
    pub checkpoints_written: usize,
    /// Name of the coordinate set holding the unvisited remainder
    pub remainder: Option<String>,
    /// Error that ended a failed run
    pub error: Option<String>,
}

impl ScanReport {
    pub(crate) fn new(unit_name: &str, total: usize) -> Self {
        Self {
            outcome: ScanOutcome::Done,
            unit_name: unit_name.to_string(),
            visited: 0,
            total,
            enqueued: 0,
            appended: 0,
            failed_appends: 0,
            flagged_points: Vec::new(),
            skipped_points: Vec::new(),
            queue_restarts: 0,
            stream_restarts: 0,
            checkpoints_written: 0,
            remainder: None,
            error: None,
        }
    }

    /// Whether every coordinate was visited.
    pub fn is_complete(&self) -> bool {
        self.outcome == ScanOutcome::Done
    }
}

/// Await a hardware future with a bound, mapping device errors to
/// [`MappingError::Hardware`] and expiry to [`MappingError::Timeout`].
pub(crate) async fn bounded<T, F>(operation: &str, limit: Duration, fut: F) -> AppResult<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(MappingError::Hardware(format!("{operation}: {e:#}"))),
        Err(_) => Err(MappingError::Timeout {
            operation: operation.to_string(),
            after_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}

/// Fold the scan loop's result into `report`.
///
/// Any error ends the run as [`ScanOutcome::Failed`]. Recoverable ones are
/// only recorded; the rest are handed back so the driver returns them once
/// the bookkeeping is done.
pub(crate) fn settle_loop(result: AppResult<()>, report: &mut ScanReport) -> Option<MappingError> {
    let err = result.err()?;
    warn!(
        error = %err,
        visited = report.visited,
        total = report.total,
        "Scan loop stopped on an error; keeping recovery state"
    );
    report.outcome = ScanOutcome::Failed;
    report.error = Some(err.to_string());
    (!err.is_recoverable()).then_some(err)
}

/// End-of-run bookkeeping shared by both drivers: drain the pipeline, then
/// drop the checkpoint (clean end) or keep it and store the remainder.
pub(crate) async fn conclude_run(
    unit: &MappingUnit,
    hub: &CoordinateHub,
    pipeline: AutosavePipeline,
    checkpoints: CheckpointWriter,
    coordinates: &CoordinateSet,
    checkpoint_dir: Option<&Path>,
    report: &mut ScanReport,
) -> AppResult<()> {
    report.queue_restarts = pipeline.restarts();
    let drained = pipeline.finish().await;
    match &drained {
        Ok(stats) => {
            report.enqueued = stats.enqueued;
            report.appended = stats.appended;
            report.failed_appends = stats.failed;
        }
        Err(e) => {
            warn!(error = %e, "Autosave pipeline did not drain");
            report.outcome = ScanOutcome::Failed;
            report.error.get_or_insert_with(|| e.to_string());
        }
    }

    if report.outcome == ScanOutcome::Failed && report.visited < report.total {
        checkpoints
            .checkpoint(
                coordinates.tail(report.visited, "remaining"),
                report.visited,
                report.total,
            )
            .await;
    } else {
        checkpoints.clear().await;
    }
    let checkpoint_stats = checkpoints.shutdown().await;
    report.checkpoints_written = checkpoint_stats.written;

    if report.outcome != ScanOutcome::Done {
        match checkpoint::persist_remainder(
            hub,
            unit.unit_name(),
            coordinates,
            report.visited,
            checkpoint_dir,
        ) {
            Ok(name) => report.remainder = name,
            Err(e) => warn!(error = %e, "Could not store unvisited coordinates"),
        }
    }

    unit.mark_complete();
    info!(
        unit = %unit.unit_name(),
        outcome = ?report.outcome,
        visited = report.visited,
        total = report.total,
        appended = report.appended,
        "Mapping run finished"
    );
    drained.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_is_shared_between_clones() {
        let control = ScanControl::new();
        let clone = control.clone();
        clone.abort();
        assert!(control.is_aborted());
        control.reset();
        assert!(!clone.is_aborted());
    }

    #[test]
    fn loop_errors_fail_the_run() {
        let mut report = ScanReport::new("u", 4);
        assert!(settle_loop(Ok(()), &mut report).is_none());
        assert_eq!(report.outcome, ScanOutcome::Done);

        let kept = settle_loop(Err(MappingError::Hardware("stream gone".into())), &mut report);
        assert!(kept.is_none());
        assert_eq!(report.outcome, ScanOutcome::Failed);
        assert_eq!(report.outcome.driver_state(), DriverState::Failed);
        assert!(report.error.as_deref().unwrap().contains("stream gone"));

        let mut report = ScanReport::new("u", 4);
        let returned = settle_loop(Err(MappingError::PipelineClosed), &mut report);
        assert!(matches!(returned, Some(MappingError::PipelineClosed)));
        assert_eq!(report.outcome, ScanOutcome::Failed);
    }

    #[tokio::test]
    async fn bounded_maps_errors_and_timeouts() {
        let ok = bounded("motion", Duration::from_millis(50), async { Ok(3) }).await;
        assert_eq!(ok.unwrap(), 3);

        let failed: AppResult<()> = bounded("motion", Duration::from_millis(50), async {
            Err(anyhow::anyhow!("limit switch"))
        })
        .await;
        assert!(matches!(failed, Err(MappingError::Hardware(msg)) if msg.contains("limit switch")));

        let hung: AppResult<()> = bounded("capture", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;
        assert!(matches!(hung, Err(MappingError::Timeout { after_ms: 10, .. })));
    }
}
