//! Progress and ETA.
//!
//! The ETA is the rolling mean of the last [`ROLLING_WINDOW`] per-point
//! durations times the number of points left. Snapshots are published on a
//! `watch` channel so any number of observers can follow a run.

use super::state::DriverState;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Point durations kept for the ETA.
pub const ROLLING_WINDOW: usize = 100;

/// Published progress snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanProgress {
    /// Coordinates visited
    pub visited: usize,
    /// Coordinates in the run
    pub total: usize,
    /// Mean duration per point over the rolling window
    pub mean_point: Option<Duration>,
    /// Estimated time remaining
    pub eta: Option<Duration>,
    /// Driver state
    pub state: DriverState,
}

impl ScanProgress {
    /// Fraction done in `[0, 1]`; an empty run counts as done.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.visited as f64 / self.total as f64
        }
    }
}

/// Progress channel owned by a driver; outlives individual runs.
pub type ProgressChannel = Arc<watch::Sender<ScanProgress>>;

/// New channel with an idle snapshot.
pub fn progress_channel() -> ProgressChannel {
    Arc::new(watch::channel(ScanProgress::default()).0)
}

/// Rolling-window tracker for one run.
#[derive(Debug)]
pub struct ProgressTracker {
    channel: ProgressChannel,
    window: VecDeque<Duration>,
    window_sum: Duration,
    mark: Option<Instant>,
    visited: usize,
    total: usize,
    state: DriverState,
}

impl ProgressTracker {
    /// Tracker for a run of `total` points, publishing on `channel`.
    pub fn new(channel: ProgressChannel, total: usize) -> Self {
        let tracker = Self {
            channel,
            window: VecDeque::with_capacity(ROLLING_WINDOW),
            window_sum: Duration::ZERO,
            mark: None,
            visited: 0,
            total,
            state: DriverState::Running,
        };
        tracker.publish();
        tracker
    }

    /// Start timing the next point.
    pub fn begin_point(&mut self) {
        self.mark = Some(Instant::now());
    }

    /// Finish the current point (`visited` increments).
    pub fn end_point(&mut self) {
        let elapsed = self.mark.take().map(|m| m.elapsed());
        self.visited += 1;
        if let Some(elapsed) = elapsed {
            self.record(elapsed);
        }
        self.publish();
    }

    /// Account for several points covered in one step (a continuous line).
    pub fn advance(&mut self, points: usize, elapsed: Duration) {
        if points == 0 {
            return;
        }
        self.visited += points;
        let per_point = elapsed / points as u32;
        for _ in 0..points.min(ROLLING_WINDOW) {
            self.record(per_point);
        }
        self.publish();
    }

    fn record(&mut self, duration: Duration) {
        if self.window.len() == ROLLING_WINDOW {
            if let Some(old) = self.window.pop_front() {
                self.window_sum -= old;
            }
        }
        self.window.push_back(duration);
        self.window_sum += duration;
    }

    /// Update the driver state in published snapshots.
    pub fn set_state(&mut self, state: DriverState) {
        self.state = state;
        self.publish();
    }

    /// Mean duration over the window.
    pub fn mean_point(&self) -> Option<Duration> {
        if self.window.is_empty() {
            None
        } else {
            Some(self.window_sum / self.window.len() as u32)
        }
    }

    /// Estimated time remaining.
    pub fn eta(&self) -> Option<Duration> {
        let remaining = self.total.saturating_sub(self.visited);
        self.mean_point()
            .map(|mean| mean.saturating_mul(remaining.min(u32::MAX as usize) as u32))
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> ScanProgress {
        ScanProgress {
            visited: self.visited,
            total: self.total,
            mean_point: self.mean_point(),
            eta: self.eta(),
            state: self.state,
        }
    }

    fn publish(&self) {
        self.channel.send_replace(self.snapshot());
    }
}
