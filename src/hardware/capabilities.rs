//! Hardware capabilities consumed by the scan drivers.
//!
//! The drivers never talk to a concrete device. They hold trait objects for
//! the few capabilities a mapping run needs:
//!
//! - a [`Stage`] that moves to 3D coordinates and remembers where it was
//! - a [`Spectrometer`] that captures single spectra on demand
//! - a [`StreamSource`], a spectrometer that can also free-run while a
//!   separate controller task bins captures between trigger signals
//!
//! Every capability is async, `Send + Sync`, and reports failures as
//! `anyhow::Result`. The drivers translate those into
//! [`MappingError`](crate::error::MappingError) at the call site.

use crate::coordinates::Coordinate;
use crate::measurement::Spectrum;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::mpsc;

/// Capability: 3-axis motion.
///
/// # Contract
/// - `move_to` returns once motion has ended; `Ok(false)` means the stage did
///   not confirm it reached the target
/// - `position_at` interpolates the stage's own position history, so it is
///   valid for timestamps in the past
#[async_trait]
pub trait Stage: Send + Sync {
    /// Move to an absolute coordinate.
    async fn move_to(&self, target: Coordinate) -> Result<bool>;

    /// Set the travel velocity in stage units per second.
    async fn set_velocity(&self, velocity: f64) -> Result<()>;

    /// Current travel velocity.
    async fn velocity(&self) -> Result<f64>;

    /// Current position.
    async fn position(&self) -> Result<Coordinate>;

    /// Position at a capture timestamp (µs), interpolated.
    async fn position_at(&self, timestamp_us: i64) -> Result<Coordinate>;
}

/// One spectrum returned by [`Spectrometer::capture`].
#[derive(Debug, Clone, PartialEq)]
pub struct Capture {
    /// Captured intensities
    pub spectrum: Spectrum,
    /// Capture timestamp (µs), unique per device
    pub timestamp_us: i64,
    /// Integration time the device actually used
    pub integration_time_ms: f64,
}

/// Capability: on-demand spectra.
#[async_trait]
pub trait Spectrometer: Send + Sync {
    /// Acquire one spectrum.
    async fn capture(&self) -> Result<Capture>;

    /// Set the integration time in milliseconds.
    async fn set_integration_time(&self, integration_time_ms: f64) -> Result<()>;

    /// Current integration time in milliseconds.
    async fn integration_time(&self) -> Result<f64>;

    /// Device-specific metadata (laser, grating, detector...) merged into
    /// every measurement's extension keys.
    fn metadata_extra(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

/// Control signal for a free-running stream.
///
/// `Store` and `Ignore` refer to the captures taken since the previous
/// signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerCommand {
    /// Start free-running acquisition; nothing captured before is kept
    Start,
    /// Deliver captures since the last signal as one [`CaptureBatch`]
    Store,
    /// Discard captures since the last signal
    Ignore,
    /// Discard anything not yet stored and end the stream
    Stop,
}

/// One capture produced by a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamCapture {
    /// Capture timestamp (µs)
    pub timestamp_us: i64,
    /// Captured intensities
    pub spectrum: Spectrum,
}

/// Captures binned between two trigger signals.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CaptureBatch {
    /// Captures in acquisition order
    pub captures: Vec<StreamCapture>,
}

impl CaptureBatch {
    /// Number of captures.
    pub fn len(&self) -> usize {
        self.captures.len()
    }

    /// Whether the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.captures.is_empty()
    }
}

/// Driver-side end of one stream controller instance.
///
/// The controller answers every `Store` with exactly one batch and closes
/// `batches` after `Stop`.
#[derive(Debug)]
pub struct StreamHandle {
    /// Trigger signals to the controller
    pub commands: mpsc::Sender<TriggerCommand>,
    /// Batches from the controller, one per `Store`
    pub batches: mpsc::Receiver<CaptureBatch>,
}

impl StreamHandle {
    /// Send a trigger signal.
    pub async fn send(&self, command: TriggerCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| anyhow::anyhow!("stream controller is gone (sending {command:?})"))
    }
}

/// Capability: free-running, trigger-binned acquisition.
#[async_trait]
pub trait StreamSource: Spectrometer {
    /// Spawn a fresh stream controller and return its handle.
    async fn open_stream(&self) -> Result<StreamHandle>;
}
