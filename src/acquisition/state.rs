//! Point and driver state machines.
//!
//! # Per-coordinate state (discrete mode)
//!
//! ```text
//! Pending ──> Moving ──confirmed──> OnTarget ──> Triggered ──> Enqueued
//!               │  ▲                               ▲    │
//!          miss │  │ retry (once)                  │    └──> Skipped
//!               ▼  │                               │
//!              Retry ──second miss, proceed────────┘
//! ```
//!
//! # Driver state
//!
//! ```text
//! Idle ──> Running ──> Draining ──> Done | Aborted | Failed ──> Running (next run)
//! ```

use crate::config::MOTION_RETRIES;
use crate::error::{AppResult, MappingError};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::trace;

/// Lifecycle of one coordinate in a discrete scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PointState {
    /// Not yet visited
    Pending,
    /// Motion command in flight
    Moving,
    /// Stage confirmed the target
    OnTarget,
    /// Motion was not confirmed
    Retry,
    /// Capture done
    Triggered,
    /// Handed to the autosave pipeline
    Enqueued,
    /// No usable capture; nothing enqueued
    Skipped,
}

impl fmt::Display for PointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PointState::Pending => "Pending",
            PointState::Moving => "Moving",
            PointState::OnTarget => "OnTarget",
            PointState::Retry => "Retry",
            PointState::Triggered => "Triggered",
            PointState::Enqueued => "Enqueued",
            PointState::Skipped => "Skipped",
        };
        f.write_str(name)
    }
}

impl PointState {
    /// Whether the point is finished.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PointState::Enqueued | PointState::Skipped)
    }

    fn allows(self, next: PointState) -> bool {
        use PointState::*;
        matches!(
            (self, next),
            (Pending, Moving)
                | (Moving, OnTarget)
                | (Moving, Retry)
                | (Retry, Moving)
                | (Retry, Triggered)
                | (OnTarget, Triggered)
                | (Triggered, Enqueued)
                | (Triggered, Skipped)
        )
    }
}

/// Tracks one coordinate through [`PointState`].
#[derive(Debug, Clone)]
pub struct PointTracker {
    index: usize,
    state: PointState,
    misses: u32,
}

impl PointTracker {
    /// New tracker in `Pending`.
    pub fn new(index: usize) -> Self {
        Self {
            index,
            state: PointState::Pending,
            misses: 0,
        }
    }

    /// Current state.
    pub fn state(&self) -> PointState {
        self.state
    }

    /// Motion misses so far.
    pub fn misses(&self) -> u32 {
        self.misses
    }

    /// Whether the point was reached without confirmation.
    pub fn is_flagged(&self) -> bool {
        self.misses > MOTION_RETRIES
    }

    /// Whether another motion attempt is allowed.
    pub fn can_retry(&self) -> bool {
        self.misses <= MOTION_RETRIES
    }

    /// Move to `next`, refusing illegal transitions and retries beyond the
    /// budget.
    pub fn transition(&mut self, next: PointState) -> AppResult<()> {
        let retry_exhausted = self.state == PointState::Retry
            && next == PointState::Moving
            && !self.can_retry();
        if !self.state.allows(next) || retry_exhausted {
            return Err(MappingError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        if next == PointState::Retry {
            self.misses += 1;
        }
        trace!(index = self.index, from = %self.state, to = %next, "Point transition");
        self.state = next;
        Ok(())
    }
}

/// Lifecycle of a scan driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DriverState {
    /// No run yet
    #[default]
    Idle,
    /// Issuing hardware commands
    Running,
    /// No more commands; autosave finishing
    Draining,
    /// All coordinates visited
    Done,
    /// Cancel flag observed before the end
    Aborted,
    /// The loop stopped on an error; recovery state was kept
    Failed,
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DriverState::Idle => "Idle",
            DriverState::Running => "Running",
            DriverState::Draining => "Draining",
            DriverState::Done => "Done",
            DriverState::Aborted => "Aborted",
            DriverState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

impl DriverState {
    /// Whether a new run may begin.
    pub fn can_begin(&self) -> bool {
        matches!(
            self,
            DriverState::Idle | DriverState::Done | DriverState::Aborted | DriverState::Failed
        )
    }

    /// Whether hardware commands are being issued.
    pub fn is_active(&self) -> bool {
        matches!(self, DriverState::Running | DriverState::Draining)
    }

    /// Checked transition.
    pub fn transition(&mut self, next: DriverState) -> AppResult<()> {
        use DriverState::*;
        let allowed = match (*self, next) {
            (from, Running) => from.can_begin(),
            (Running, Draining) => true,
            (Draining, Done) | (Draining, Aborted) | (Draining, Failed) => true,
            _ => false,
        };
        if !allowed {
            return Err(MappingError::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            });
        }
        *self = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path() {
        let mut point = PointTracker::new(0);
        for next in [
            PointState::Moving,
            PointState::OnTarget,
            PointState::Triggered,
            PointState::Enqueued,
        ] {
            point.transition(next).unwrap();
        }
        assert!(point.state().is_terminal());
        assert!(!point.is_flagged());
    }

    #[test]
    fn one_retry_then_proceed_flagged() {
        let mut point = PointTracker::new(3);
        point.transition(PointState::Moving).unwrap();
        point.transition(PointState::Retry).unwrap();
        point.transition(PointState::Moving).unwrap();
        point.transition(PointState::Retry).unwrap();

        assert!(!point.can_retry());
        assert!(point.transition(PointState::Moving).is_err());
        point.transition(PointState::Triggered).unwrap();
        assert!(point.is_flagged());
        assert_eq!(point.misses(), 2);
    }

    #[test]
    fn illegal_point_transition() {
        let mut point = PointTracker::new(0);
        assert!(matches!(
            point.transition(PointState::Enqueued),
            Err(MappingError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn driver_lifecycle() {
        let mut state = DriverState::default();
        assert!(state.transition(DriverState::Done).is_err());
        state.transition(DriverState::Running).unwrap();
        assert!(state.transition(DriverState::Running).is_err());
        state.transition(DriverState::Draining).unwrap();
        state.transition(DriverState::Aborted).unwrap();
        assert!(state.can_begin());
        state.transition(DriverState::Running).unwrap();
        assert!(state.is_active());
    }

    #[test]
    fn failed_run_may_begin_again() {
        let mut state = DriverState::Running;
        assert!(state.transition(DriverState::Failed).is_err());
        state.transition(DriverState::Draining).unwrap();
        state.transition(DriverState::Failed).unwrap();
        assert!(state.can_begin());
        assert!(!state.is_active());
    }
}
