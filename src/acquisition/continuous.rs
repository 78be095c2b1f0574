//! Continuous-mode scan driver.
//!
//! Works on line-endpoint pairs from
//! [`Sequencer::continuous`](crate::coordinates::sequencer::Sequencer::continuous).
//! Half-step `k` moves the stage to endpoint `k`:
//!
//! - even `k`: reposition to the start of a line at the crawl velocity
//! - odd `k`: traverse the line at the line velocity
//!
//! The spectrometer free-runs in a stream controller task. Before each
//! half-step the driver tells the controller what to do with the captures
//! taken since the previous signal:
//!
//! ```text
//! Start ─ move(0) ─ Ignore ─ move(1) ─ Store ─ move(2) ─ Ignore ─ move(3) ─ Store ─ ... ─ Store ─ Stop
//!          repositioning      line 0            repositioning      line 1
//! ```
//!
//! Each stored capture becomes one measurement tagged with the stage position
//! interpolated at its timestamp.
//!
//! # Backpressure
//!
//! When the autosave queue is over its threshold once a line's batch has been
//! enqueued, the driver sends `Stop`, pushes every batch the old controller
//! still delivers, drains and restarts the autosave queue, then opens a fresh
//! stream and sends `Start`. The stage is stationary at a line
//! boundary during the restart, so the discontinuity costs time but no line
//! coverage.
//!
//! # Lost batches
//!
//! A `Store` that is never answered (controller closed or timed out) loses
//! that line's captures. The driver reopens the stream, crawls back to the
//! line start and scans the line once more. If the second batch is lost as
//! well, both endpoints of the line go into
//! [`ScanReport::skipped_points`].

use super::autosave::{AutosaveItem, AutosavePipeline};
use super::checkpoint::{CadenceCounter, CheckpointWriter};
use super::progress::{progress_channel, ProgressChannel, ProgressTracker, ScanProgress};
use super::state::DriverState;
use super::{bounded, conclude_run, settle_loop, ScanControl, ScanOutcome, ScanReport};
use crate::config::{AcquisitionConfig, MappingConfig, CAPTURE_RETRIES, MOTION_RETRIES};
use crate::coordinates::{Coordinate, CoordinateHub, CoordinateSet};
use crate::error::{AppResult, MappingError};
use crate::hardware::{CaptureBatch, Stage, StreamHandle, StreamSource, TriggerCommand};
use crate::mapping::MappingUnit;
use crate::measurement::{Measurement, MeasurementMetadata};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn, Instrument};

/// Signal due before half-step `k`, about the captures since the last one.
pub fn boundary_signal(k: usize) -> Option<TriggerCommand> {
    match k {
        0 => None,
        k if k % 2 == 1 => Some(TriggerCommand::Ignore),
        _ => Some(TriggerCommand::Store),
    }
}

/// Line-by-line streaming driver owning a stage and a streaming spectrometer.
pub struct ContinuousScanDriver {
    stage: Arc<dyn Stage>,
    source: Arc<dyn StreamSource>,
    config: AcquisitionConfig,
    checkpoint_dir: Option<PathBuf>,
    control: ScanControl,
    progress: ProgressChannel,
    state: Mutex<DriverState>,
    run_guard: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for ContinuousScanDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContinuousScanDriver")
            .field("config", &self.config)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

/// Mutable state of one continuous run.
struct RunState<'a> {
    unit: &'a MappingUnit,
    stream: StreamHandle,
    pipeline: AutosavePipeline,
    metadata: MeasurementMetadata,
    integration_time_ms: f64,
    report: ScanReport,
}

impl ContinuousScanDriver {
    /// Build a driver. The configuration is validated and read once here.
    pub fn new(
        stage: Arc<dyn Stage>,
        source: Arc<dyn StreamSource>,
        config: &MappingConfig,
    ) -> AppResult<Self> {
        config.acquisition.validate()?;
        Ok(Self {
            stage,
            source,
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

    /// Progress snapshots (in endpoints) of the current or last run.
    pub fn progress(&self) -> watch::Receiver<ScanProgress> {
        self.progress.subscribe()
    }

    /// Current driver state.
    pub fn state(&self) -> DriverState {
        *self.state.lock()
    }

    fn set_state(&self, next: DriverState, progress: &mut ProgressTracker) -> AppResult<()> {
        self.state.lock().transition(next)?;
        progress.set_state(next);
        Ok(())
    }

    /// Scan every line of `endpoints` (start/end pairs) into `unit`.
    pub async fn run(
        &self,
        unit: Arc<MappingUnit>,
        endpoints: &CoordinateSet,
        hub: Arc<CoordinateHub>,
    ) -> AppResult<ScanReport> {
        if endpoints.len() % 2 != 0 {
            return Err(MappingError::Configuration(format!(
                "continuous scans need line endpoint pairs, got {} coordinates",
                endpoints.len()
            )));
        }
        let _guard = self
            .run_guard
            .try_lock()
            .map_err(|_| MappingError::ScanInProgress)?;
        let span = info_span!(
            "mapping_run",
            mode = "continuous",
            unit = %unit.unit_name(),
            lines = endpoints.len() / 2
        );
        self.run_locked(unit, endpoints, hub).instrument(span).await
    }

    async fn run_locked(
        &self,
        unit: Arc<MappingUnit>,
        endpoints: &CoordinateSet,
        hub: Arc<CoordinateHub>,
    ) -> AppResult<ScanReport> {
        self.control.reset();
        let total = endpoints.len();

        bounded(
            "set integration time",
            self.config.capture_timeout(),
            self.source
                .set_integration_time(self.config.integration_time_ms),
        )
        .await?;
        let integration_time_ms = self.config.integration_time_ms;
        let metadata = MeasurementMetadata {
            extra: self.source.metadata_extra(),
            ..MeasurementMetadata::new(1, integration_time_ms)
        };
        metadata.validate()?;
        let stream = self.open_stream().await?;

        let pipeline = AutosavePipeline::start(
            unit.clone(),
            self.config.queue_capacity,
            self.config.buffer_threshold,
        )?;
        let checkpoints =
            CheckpointWriter::spawn(hub.clone(), unit.unit_name(), self.checkpoint_dir.clone());
        let mut progress = ProgressTracker::new(self.progress.clone(), total);
        self.set_state(DriverState::Running, &mut progress)?;

        info!(lines = total / 2, "Continuous scan started");

        let mut run = RunState {
            unit: &unit,
            stream,
            pipeline,
            metadata,
            integration_time_ms,
            report: ScanReport::new(unit.unit_name(), total),
        };
        let loop_result = self
            .scan_loop(endpoints, &mut run, &checkpoints, &mut progress)
            .await;

        let fatal = settle_loop(loop_result, &mut run.report);

        self.set_state(DriverState::Draining, &mut progress)?;
        let RunState {
            pipeline,
            mut report,
            ..
        } = run;
        let concluded = conclude_run(
            &unit,
            &hub,
            pipeline,
            checkpoints,
            endpoints,
            self.checkpoint_dir.as_deref(),
            &mut report,
        )
        .await;
        self.set_state(report.outcome.driver_state(), &mut progress)?;

        match fatal {
            Some(e) => Err(e),
            None => concluded.map(|()| report),
        }
    }

    async fn scan_loop(
        &self,
        endpoints: &CoordinateSet,
        run: &mut RunState<'_>,
        checkpoints: &CheckpointWriter,
        progress: &mut ProgressTracker,
    ) -> AppResult<()> {
        let total = endpoints.len();
        let mut cadence = CadenceCounter::new(self.config.checkpoint_cadence_continuous);
        let mut line_started = Instant::now();

        run.stream_send(TriggerCommand::Start).await?;

        let mut k = 0;
        while k < total {
            tokio::task::yield_now().await;
            if self.control.is_aborted() {
                info!(half_step = k, "Abort requested; stopping scan");
                run.report.outcome = ScanOutcome::Aborted;
                break;
            }

            match boundary_signal(k) {
                Some(TriggerCommand::Store) => self.finish_line(endpoints, run, k).await?,
                Some(signal) => run.stream_send(signal).await?,
                None => {}
            }

            if k > 0 && k % 2 == 0 {
                // line (k / 2 - 1) is complete and its batch enqueued
                run.report.visited = k;
                progress.advance(2, line_started.elapsed());
                if run.pipeline.is_backpressured() {
                    self.restart_stream(run).await?;
                }
                if cadence.tick() {
                    checkpoints
                        .checkpoint(endpoints.tail(k, "remaining"), k, total)
                        .await;
                }
            }
            if k % 2 == 0 {
                line_started = Instant::now();
            }

            self.move_half_step(endpoints, run, k).await;
            k += 1;
        }

        if run.report.outcome == ScanOutcome::Done {
            if total > 0 {
                self.finish_line(endpoints, run, total).await?;
                progress.advance(2, line_started.elapsed());
            }
            run.report.visited = total;
        } else {
            // Completed lines only; an aborted half-line is scanned again on resume.
            run.report.visited = k - k % 2;
            if k > 0 && k % 2 == 0 && !self.store_batch(run).await? {
                run.report.visited = k - 2;
            }
        }
        self.close_stream(run).await
    }

    /// Set the velocity for half-step `k` and move to its endpoint, flagging
    /// it if the stage never confirms.
    async fn move_half_step(&self, endpoints: &CoordinateSet, run: &mut RunState<'_>, k: usize) {
        let velocity = if k % 2 == 1 {
            self.config.line_velocity
        } else {
            self.config.crawl_velocity()
        };
        if let Err(e) = bounded(
            "set velocity",
            self.config.motion_timeout(),
            self.stage.set_velocity(velocity),
        )
        .await
        {
            warn!(half_step = k, velocity, error = %e, "Could not set velocity");
        }

        if !self.move_with_retry(endpoints.coordinates()[k]).await {
            run.report.flagged_points.push(k);
        }
    }

    /// `Store` the line that ended at endpoint `k - 1`.
    ///
    /// A lost batch reopens the stream and rescans the line; after
    /// [`CAPTURE_RETRIES`] rescans its endpoints are reported as skipped.
    async fn finish_line(
        &self,
        endpoints: &CoordinateSet,
        run: &mut RunState<'_>,
        k: usize,
    ) -> AppResult<()> {
        let line = k / 2 - 1;
        let mut rescans = 0;
        while !self.store_batch(run).await? {
            self.reopen_stream(run).await?;
            if rescans == CAPTURE_RETRIES || self.control.is_aborted() {
                warn!(line, "Line batch lost; line skipped");
                run.report.skipped_points.extend([k - 2, k - 1]);
                return Ok(());
            }
            rescans += 1;
            warn!(line, "Line batch lost; rescanning");
            self.move_half_step(endpoints, run, k - 2).await;
            run.stream_send(TriggerCommand::Ignore).await?;
            self.move_half_step(endpoints, run, k - 1).await;
        }
        Ok(())
    }

    /// Send `Store` and enqueue the batch it answers with. `false` when the
    /// controller closed or never answered; the stream is then unusable.
    async fn store_batch(&self, run: &mut RunState<'_>) -> AppResult<bool> {
        if let Err(e) = run.stream_send(TriggerCommand::Store).await {
            warn!(error = %e, "Store not delivered");
            return Ok(false);
        }
        let received = bounded(
            "stream batch",
            self.config.capture_timeout(),
            async { Ok::<_, anyhow::Error>(run.stream.batches.recv().await) },
        )
        .await;
        match received {
            Ok(Some(batch)) => {
                self.enqueue_batch(run, batch).await?;
                Ok(true)
            }
            Ok(None) => {
                warn!("Stream controller closed before delivering its batch");
                Ok(false)
            }
            Err(e) => {
                warn!(error = %e, "No batch from stream controller");
                Ok(false)
            }
        }
    }

    /// Replace an unusable stream with a fresh, started one.
    async fn reopen_stream(&self, run: &mut RunState<'_>) -> AppResult<()> {
        let stale = std::mem::replace(&mut run.stream, self.open_stream().await?);
        let _ = stale.commands.try_send(TriggerCommand::Stop);
        run.report.stream_restarts += 1;
        run.stream_send(TriggerCommand::Start).await
    }

    /// Backpressure restart at a line boundary, after the line's `Store`.
    async fn restart_stream(&self, run: &mut RunState<'_>) -> AppResult<()> {
        warn!(
            depth = run.pipeline.depth(),
            threshold = run.pipeline.threshold(),
            "Autosave backpressure; restarting stream"
        );
        self.close_stream(run).await?;
        run.pipeline.rotate().await?;
        run.stream = self.open_stream().await?;
        run.report.stream_restarts += 1;
        run.stream_send(TriggerCommand::Start).await
    }

    /// `Stop`, then enqueue everything the controller still delivers until
    /// it closes.
    async fn close_stream(&self, run: &mut RunState<'_>) -> AppResult<()> {
        if let Err(e) = run.stream_send(TriggerCommand::Stop).await {
            warn!(error = %e, "Stop not delivered");
        }
        loop {
            let next = bounded(
                "stream drain",
                self.config.capture_timeout(),
                async { Ok::<_, anyhow::Error>(run.stream.batches.recv().await) },
            )
            .await;
            match next {
                Ok(Some(batch)) => self.enqueue_batch(run, batch).await?,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Stream controller did not close in time");
                    break;
                }
            }
        }
        Ok(())
    }

    async fn enqueue_batch(&self, run: &mut RunState<'_>, batch: CaptureBatch) -> AppResult<()> {
        let count = batch.len();
        for capture in batch.captures {
            let coordinate = self.position_at(capture.timestamp_us).await;
            let measurement = match Measurement::from_capture(
                capture.timestamp_us,
                run.integration_time_ms,
                capture.spectrum,
                run.metadata.clone(),
            ) {
                Ok(m) => m,
                Err(e) => {
                    warn!(timestamp = capture.timestamp_us, error = %e, "Capture dropped");
                    continue;
                }
            };
            run.pipeline
                .push(AutosaveItem::new(coordinate, measurement))
                .await?;
        }
        debug!(unit = %run.unit.unit_name(), captures = count, "Stored stream batch");
        Ok(())
    }

    async fn position_at(&self, timestamp_us: i64) -> Coordinate {
        let interpolated = bounded(
            "position history",
            self.config.motion_timeout(),
            self.stage.position_at(timestamp_us),
        )
        .await;
        match interpolated {
            Ok(position) => position,
            Err(e) => {
                warn!(timestamp = timestamp_us, error = %e, "Falling back to current stage position");
                bounded("position", self.config.motion_timeout(), self.stage.position())
                    .await
                    .unwrap_or_default()
            }
        }
    }

    async fn open_stream(&self) -> AppResult<StreamHandle> {
        bounded(
            "open stream",
            self.config.capture_timeout(),
            self.source.open_stream(),
        )
        .await
    }

    /// Returns whether the stage confirmed the target.
    async fn move_with_retry(&self, target: Coordinate) -> bool {
        for attempt in 0..=MOTION_RETRIES {
            match bounded(
                "motion",
                self.config.motion_timeout(),
                self.stage.move_to(target),
            )
            .await
            {
                Ok(true) => return true,
                Ok(false) => warn!(attempt, x = target.x, y = target.y, "Stage did not confirm endpoint"),
                Err(e) => warn!(attempt, x = target.x, y = target.y, error = %e, "Motion failed"),
            }
        }
        warn!(x = target.x, y = target.y, "Proceeding at unconfirmed endpoint; flagged");
        false
    }
}

impl RunState<'_> {
    async fn stream_send(&self, command: TriggerCommand) -> AppResult<()> {
        self.stream
            .send(command)
            .await
            .map_err(|e| MappingError::Hardware(format!("{e:#}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signals_follow_half_step_parity() {
        assert_eq!(boundary_signal(0), None);
        assert_eq!(boundary_signal(1), Some(TriggerCommand::Ignore));
        assert_eq!(boundary_signal(2), Some(TriggerCommand::Store));
        assert_eq!(boundary_signal(3), Some(TriggerCommand::Ignore));
        assert_eq!(boundary_signal(6), Some(TriggerCommand::Store));
    }
}
