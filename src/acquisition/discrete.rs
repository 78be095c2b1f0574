//! Discrete-mode scan driver: stop, measure, move on.
//!
//! Every iteration of the loop:
//!
//! 1. polls the cancel flag
//! 2. drains and restarts the autosave queue if it is backpressured
//! 3. moves to the coordinate (bounded wait, one retry, then proceeds and
//!    flags the point)
//! 4. captures `accumulations` spectra (bounded wait, one retry each; a
//!    capture that fails twice skips the point)
//! 5. pushes the measurement to the autosave pipeline
//! 6. updates progress and, every K points, the checkpoint

use super::autosave::{AutosaveItem, AutosavePipeline};
use super::checkpoint::{CadenceCounter, CheckpointWriter};
use super::progress::{progress_channel, ProgressChannel, ProgressTracker, ScanProgress};
use super::state::{DriverState, PointState, PointTracker};
use super::{bounded, conclude_run, settle_loop, ScanControl, ScanOutcome, ScanReport};
use crate::config::{AcquisitionConfig, MappingConfig, CAPTURE_RETRIES, MOTION_RETRIES};
use crate::coordinates::{Coordinate, CoordinateHub, CoordinateSet};
use crate::error::{AppResult, MappingError};
use crate::hardware::{Spectrometer, Stage};
use crate::mapping::MappingUnit;
use crate::measurement::{Measurement, MeasurementMetadata};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn, Instrument};

/// Stop-move-measure driver owning a stage and a spectrometer.
pub struct DiscreteScanDriver {
    stage: Arc<dyn Stage>,
    spectrometer: Arc<dyn Spectrometer>,
    config: AcquisitionConfig,
    checkpoint_dir: Option<PathBuf>,
    control: ScanControl,
    progress: ProgressChannel,
    state: Mutex<DriverState>,
    run_guard: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for DiscreteScanDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscreteScanDriver")
            .field("config", &self.config)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl DiscreteScanDriver {
    /// Build a driver. The configuration is validated and read once here.
    pub fn new(
        stage: Arc<dyn Stage>,
        spectrometer: Arc<dyn Spectrometer>,
        config: &MappingConfig,
    ) -> AppResult<Self> {
        config.acquisition.validate()?;
        Ok(Self {
            stage,
            spectrometer,
            config: config.acquisition.clone(),
            checkpoint_dir: config.storage.checkpoint_dir.clone(),
            control: ScanControl::new(),
            progress: progress_channel(),
            state: Mutex::new(DriverState::Idle),
            run_guard: tokio::sync::Mutex::new(()),
        })
    }

    /// Cancel handle for this driver's runs.
    pub fn control(&self) -> ScanControl {
        self.control.clone()
    }

    /// Progress snapshots of the current or last run.
    pub fn progress(&self) -> watch::Receiver<ScanProgress> {
        self.progress.subscribe()
    }

    /// Current driver state.
    pub fn state(&self) -> DriverState {
        *self.state.lock()
    }

    fn set_state(&self, next: DriverState, progress: Option<&mut ProgressTracker>) -> AppResult<()> {
        self.state.lock().transition(next)?;
        if let Some(progress) = progress {
            progress.set_state(next);
        }
        Ok(())
    }

    /// Visit `coordinates` in order, storing one measurement per point in
    /// `unit`.
    ///
    /// Returns [`MappingError::ScanInProgress`] if this driver is already
    /// running. Per-point hardware failures never fail the run; they are
    /// reported in [`ScanReport::flagged_points`] and
    /// [`ScanReport::skipped_points`]. A run whose loop breaks down keeps its
    /// checkpoint and remainder, whether it reports
    /// [`ScanOutcome::Failed`] or returns the error.
    pub async fn run(
        &self,
        unit: Arc<MappingUnit>,
        coordinates: &CoordinateSet,
        hub: Arc<CoordinateHub>,
    ) -> AppResult<ScanReport> {
        let _guard = self
            .run_guard
            .try_lock()
            .map_err(|_| MappingError::ScanInProgress)?;
        let span = info_span!(
            "mapping_run",
            mode = "discrete",
            unit = %unit.unit_name(),
            total = coordinates.len()
        );
        self.run_locked(unit, coordinates, hub).instrument(span).await
    }

    async fn run_locked(
        &self,
        unit: Arc<MappingUnit>,
        coordinates: &CoordinateSet,
        hub: Arc<CoordinateHub>,
    ) -> AppResult<ScanReport> {
        self.control.reset();
        let total = coordinates.len();

        // Fail fast, before any motion.
        bounded(
            "set integration time",
            self.config.capture_timeout(),
            self.spectrometer
                .set_integration_time(self.config.integration_time_ms),
        )
        .await?;
        let metadata = MeasurementMetadata {
            extra: self.spectrometer.metadata_extra(),
            ..MeasurementMetadata::new(self.config.accumulations, self.config.integration_time_ms)
        };
        metadata.validate()?;

        let mut pipeline = AutosavePipeline::start(
            unit.clone(),
            self.config.queue_capacity,
            self.config.buffer_threshold,
        )?;
        let checkpoints =
            CheckpointWriter::spawn(hub.clone(), unit.unit_name(), self.checkpoint_dir.clone());
        let mut progress = ProgressTracker::new(self.progress.clone(), total);
        self.set_state(DriverState::Running, Some(&mut progress))?;

        info!(points = total, accumulations = self.config.accumulations, "Discrete scan started");

        let mut report = ScanReport::new(unit.unit_name(), total);
        let loop_result = self
            .scan_loop(coordinates, &metadata, &mut pipeline, &checkpoints, &mut progress, &mut report)
            .await;

        let fatal = settle_loop(loop_result, &mut report);

        self.set_state(DriverState::Draining, Some(&mut progress))?;
        let concluded = conclude_run(
            &unit,
            &hub,
            pipeline,
            checkpoints,
            coordinates,
            self.checkpoint_dir.as_deref(),
            &mut report,
        )
        .await;
        self.set_state(report.outcome.driver_state(), Some(&mut progress))?;

        match fatal {
            Some(e) => Err(e),
            None => concluded.map(|()| report),
        }
    }

    async fn scan_loop(
        &self,
        coordinates: &CoordinateSet,
        metadata: &MeasurementMetadata,
        pipeline: &mut AutosavePipeline,
        checkpoints: &CheckpointWriter,
        progress: &mut ProgressTracker,
        report: &mut ScanReport,
    ) -> AppResult<()> {
        let total = coordinates.len();
        let mut cadence = CadenceCounter::new(self.config.checkpoint_cadence_discrete);

        for (index, &target) in coordinates.coordinates().iter().enumerate() {
            // Let observers (and a pending abort) run between points.
            tokio::task::yield_now().await;
            if self.control.is_aborted() {
                info!(index, visited = report.visited, "Abort requested; stopping scan");
                report.outcome = ScanOutcome::Aborted;
                return Ok(());
            }

            pipeline.relieve().await?;
            progress.begin_point();

            let mut point = PointTracker::new(index);
            if self.move_with_retry(&mut point, target).await? {
                report.flagged_points.push(index);
            }

            match self.acquire(index, metadata).await {
                Some(measurement) => {
                    point.transition(PointState::Triggered)?;
                    pipeline.push(AutosaveItem::new(target, measurement)).await?;
                    point.transition(PointState::Enqueued)?;
                }
                None => {
                    point.transition(PointState::Triggered)?;
                    point.transition(PointState::Skipped)?;
                    report.skipped_points.push(index);
                }
            }

            report.visited = index + 1;
            progress.end_point();

            if cadence.tick() && report.visited < total {
                checkpoints
                    .checkpoint(
                        coordinates.tail(report.visited, "remaining"),
                        report.visited,
                        total,
                    )
                    .await;
            }
        }
        Ok(())
    }

    /// Move to `target`, retrying once. Returns whether the point had to be
    /// flagged (never confirmed).
    async fn move_with_retry(&self, point: &mut PointTracker, target: Coordinate) -> AppResult<bool> {
        loop {
            point.transition(PointState::Moving)?;
            let result = bounded(
                "motion",
                self.config.motion_timeout(),
                self.stage.move_to(target),
            )
            .await;

            match result {
                Ok(true) => {
                    point.transition(PointState::OnTarget)?;
                    return Ok(false);
                }
                Ok(false) => warn!(x = target.x, y = target.y, z = target.z, "Stage did not confirm target"),
                Err(e) => warn!(x = target.x, y = target.y, z = target.z, error = %e, "Motion failed"),
            }

            point.transition(PointState::Retry)?;
            if !point.can_retry() {
                warn!(
                    retries = MOTION_RETRIES,
                    x = target.x,
                    y = target.y,
                    "Proceeding at unconfirmed position; point flagged"
                );
                return Ok(true);
            }
        }
    }

    /// Accumulate captures into one measurement. `None` if a capture failed
    /// twice.
    async fn acquire(&self, index: usize, metadata: &MeasurementMetadata) -> Option<Measurement> {
        let mut measurement: Option<Measurement> = None;

        for accumulation in 0..self.config.accumulations {
            let capture = match self.capture_with_retry().await {
                Ok(capture) => capture,
                Err(e) => {
                    warn!(index, accumulation, error = %e, "Capture failed after retry; point skipped");
                    return None;
                }
            };

            if measurement.is_none() {
                match Measurement::new(
                    capture.timestamp_us,
                    capture.integration_time_ms,
                    metadata.clone(),
                ) {
                    Ok(m) => measurement = Some(m),
                    Err(e) => {
                        warn!(index, error = %e, "Invalid measurement; point skipped");
                        return None;
                    }
                }
            }
            let current = measurement.as_mut()?;
            if let Err(e) = current.push_raw(capture.spectrum) {
                warn!(index, error = %e, "Capture rejected; point skipped");
                return None;
            }
        }

        debug!(index, "Point acquired");
        measurement
    }

    async fn capture_with_retry(&self) -> AppResult<crate::hardware::Capture> {
        let mut attempt = 0;
        loop {
            match bounded(
                "capture",
                self.config.capture_timeout(),
                self.spectrometer.capture(),
            )
            .await
            {
                Ok(capture) => return Ok(capture),
                Err(e) if attempt < CAPTURE_RETRIES => {
                    warn!(error = %e, "Capture failed; retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{FaultConfig, FaultScenario, MockSpectrometer, MockStage};
    use std::collections::BTreeMap;

    fn config() -> MappingConfig {
        let mut config = MappingConfig::default();
        config.acquisition.motion_timeout_ms = 100;
        config.acquisition.capture_timeout_ms = 100;
        config
    }

    fn grid(n: usize) -> CoordinateSet {
        CoordinateSet::grid("grid", n, 1, 1.0, Coordinate::default())
    }

    #[tokio::test]
    async fn visits_every_point_in_order() {
        let driver = DiscreteScanDriver::new(
            Arc::new(MockStage::new()),
            Arc::new(MockSpectrometer::new()),
            &config(),
        )
        .unwrap();
        let unit = Arc::new(MappingUnit::new("u", BTreeMap::new()));
        let hub = Arc::new(CoordinateHub::new());

        let report = driver.run(unit.clone(), &grid(5), hub.clone()).await.unwrap();

        assert_eq!(report.outcome, ScanOutcome::Done);
        assert_eq!(report.appended, 5);
        assert_eq!(unit.len(), 5);
        assert!(unit.is_complete());
        assert_eq!(driver.state(), DriverState::Done);
        assert!(hub.is_empty(), "checkpoint removed after completion");

        let xs: Vec<f64> = unit.rows().iter().map(|r| r.coordinate.x).collect();
        assert_eq!(xs, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
    }

    #[tokio::test]
    async fn accumulations_are_stored_as_raw_captures() {
        let mut config = config();
        config.acquisition.accumulations = 3;
        let driver = DiscreteScanDriver::new(
            Arc::new(MockStage::new()),
            Arc::new(MockSpectrometer::new()),
            &config,
        )
        .unwrap();
        let unit = Arc::new(MappingUnit::new("u", BTreeMap::new()));

        driver
            .run(unit.clone(), &grid(2), Arc::new(CoordinateHub::new()))
            .await
            .unwrap();

        let row = &unit.rows()[0];
        assert_eq!(row.raw.len(), 3);
        assert!(row.averaged.is_some());
        assert_eq!(unit.metadata().unwrap().measurement.accumulations, 3);
    }

    #[tokio::test]
    async fn hanging_motion_is_retried_once() {
        let stage = Arc::new(
            MockStage::builder()
                .faults(FaultConfig::scenario(FaultScenario::Timeout {
                    operation: "move_to",
                    calls: vec![2],
                }))
                .build(),
        );
        let driver =
            DiscreteScanDriver::new(stage.clone(), Arc::new(MockSpectrometer::new()), &config())
                .unwrap();
        let unit = Arc::new(MappingUnit::new("u", BTreeMap::new()));

        let report = driver
            .run(unit.clone(), &grid(3), Arc::new(CoordinateHub::new()))
            .await
            .unwrap();

        assert!(report.flagged_points.is_empty());
        assert_eq!(stage.faults().calls("move_to"), 4);
        assert_eq!(unit.len(), 3);
    }

    #[tokio::test]
    async fn invalid_configuration_fails_before_motion() {
        let mut config = config();
        config.acquisition.accumulations = 0;
        let err = DiscreteScanDriver::new(
            Arc::new(MockStage::new()),
            Arc::new(MockSpectrometer::new()),
            &config,
        )
        .unwrap_err();
        assert!(matches!(err, MappingError::Configuration(_)));
    }
}
