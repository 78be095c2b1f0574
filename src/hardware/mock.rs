//! Mock hardware for tests and the CLI.
//!
//! All mocks use async-safe waiting (`tokio::time::sleep`) and share the
//! same error-injection framework, [`FaultConfig`].
//!
//! # Available Mocks
//!
//! - [`MockStage`]: 3-axis stage with position history for `position_at`
//! - [`MockSpectrometer`]: synthetic spectra, on demand or free-running
//!
//! # Modes
//!
//! - [`MockMode::Instant`]: no delays, for unit tests
//! - [`MockMode::Timed`]: moves take `distance / velocity`, captures take the
//!   integration time, streams produce a frame every `frame_interval`

use crate::coordinates::Coordinate;
use crate::hardware::capabilities::{
    Capture, CaptureBatch, Spectrometer, Stage, StreamCapture, StreamHandle, StreamSource,
    TriggerCommand,
};
use crate::measurement::{Spectrum, TimestampSource};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration, MissedTickBehavior};
use tracing::{debug, trace};

const HANG: Duration = Duration::from_secs(3600);
const HISTORY_LIMIT: usize = 100_000;

/// Timing behaviour of a mock device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MockMode {
    /// Zero delays, deterministic
    #[default]
    Instant,
    /// Hardware-like timing
    Timed,
}

// =============================================================================
// Error injection
// =============================================================================

/// A failure pattern for one named operation (`"move_to"`, `"capture"`,
/// `"open_stream"`...). Call numbers are 1-based.
#[derive(Debug, Clone, PartialEq)]
pub enum FaultScenario {
    /// Fail every call after the first `count`
    FailAfterN {
        /// Operation name
        operation: &'static str,
        /// Successful calls before failures start
        count: u32,
    },
    /// Fail every `every`-th call
    FailEvery {
        /// Operation name
        operation: &'static str,
        /// Period
        every: u32,
    },
    /// Fail exactly these calls
    FailCalls {
        /// Operation name
        operation: &'static str,
        /// Failing call numbers
        calls: Vec<u32>,
    },
    /// Never return from these calls
    Timeout {
        /// Operation name
        operation: &'static str,
        /// Hanging call numbers
        calls: Vec<u32>,
    },
    /// Complete these calls without confirmation (`Ok(false)` from a stage)
    Unconfirmed {
        /// Operation name
        operation: &'static str,
        /// Unconfirmed call numbers
        calls: Vec<u32>,
    },
}

/// What a mock should do for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Injected {
    /// Behave normally
    Proceed,
    /// Return an error
    Fail,
    /// Hang until cancelled
    Hang,
    /// Complete without confirmation
    Unconfirmed,
}

#[derive(Debug, Default)]
struct FaultState {
    calls: HashMap<&'static str, u32>,
}

/// Error-injection configuration shared by all mocks.
#[derive(Debug, Clone)]
pub struct FaultConfig {
    scenarios: Arc<Vec<FaultScenario>>,
    failure_rate: f64,
    rng: Arc<Mutex<StdRng>>,
    state: Arc<Mutex<FaultState>>,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self::none()
    }
}

impl FaultConfig {
    /// No injected faults.
    pub fn none() -> Self {
        Self::scenarios(Vec::new())
    }

    /// A single scenario.
    pub fn scenario(scenario: FaultScenario) -> Self {
        Self::scenarios(vec![scenario])
    }

    /// Several scenarios, checked in order.
    pub fn scenarios(scenarios: Vec<FaultScenario>) -> Self {
        Self {
            scenarios: Arc::new(scenarios),
            failure_rate: 0.0,
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(0))),
            state: Arc::new(Mutex::new(FaultState::default())),
        }
    }

    /// Uniform random failures on every operation.
    pub fn random_failures_seeded(rate: f64, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            scenarios: Arc::new(Vec::new()),
            failure_rate: rate.clamp(0.0, 1.0),
            rng: Arc::new(Mutex::new(rng)),
            state: Arc::new(Mutex::new(FaultState::default())),
        }
    }

    /// Count a call to `operation` and decide how it behaves.
    pub fn check_operation(&self, operation: &'static str) -> Injected {
        let call = {
            let mut state = self.state.lock();
            let counter = state.calls.entry(operation).or_insert(0);
            *counter += 1;
            *counter
        };

        for scenario in self.scenarios.iter() {
            let injected = match scenario {
                FaultScenario::FailAfterN { operation: op, count } if *op == operation => {
                    (call > *count).then_some(Injected::Fail)
                }
                FaultScenario::FailEvery { operation: op, every } if *op == operation => {
                    (*every > 0 && call % every == 0).then_some(Injected::Fail)
                }
                FaultScenario::FailCalls { operation: op, calls } if *op == operation => {
                    calls.contains(&call).then_some(Injected::Fail)
                }
                FaultScenario::Timeout { operation: op, calls } if *op == operation => {
                    calls.contains(&call).then_some(Injected::Hang)
                }
                FaultScenario::Unconfirmed { operation: op, calls } if *op == operation => {
                    calls.contains(&call).then_some(Injected::Unconfirmed)
                }
                _ => None,
            };
            if let Some(injected) = injected {
                debug!(operation, call, ?injected, "Injecting mock fault");
                return injected;
            }
        }

        if self.failure_rate > 0.0 && self.rng.lock().gen_bool(self.failure_rate) {
            return Injected::Fail;
        }
        Injected::Proceed
    }

    /// Number of calls seen for `operation`.
    pub fn calls(&self, operation: &'static str) -> u32 {
        self.state.lock().calls.get(operation).copied().unwrap_or(0)
    }
}

fn now_us() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

// =============================================================================
// MockStage
// =============================================================================

/// Simulated 3-axis stage.
///
/// Every move records its start and end in a position history; `position_at`
/// interpolates linearly between the two history entries around the
/// requested timestamp.
#[derive(Debug)]
pub struct MockStage {
    mode: MockMode,
    position: Mutex<Coordinate>,
    velocity: Mutex<f64>,
    history: Mutex<Vec<(i64, Coordinate)>>,
    faults: FaultConfig,
    velocity_log: Mutex<Vec<f64>>,
    moves: AtomicUsize,
}

impl MockStage {
    /// Instant stage at the origin.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Builder for non-default stages.
    pub fn builder() -> MockStageBuilder {
        MockStageBuilder::default()
    }

    /// Completed move commands (including unconfirmed ones).
    pub fn move_count(&self) -> usize {
        self.moves.load(Ordering::SeqCst)
    }

    /// Every velocity ever set, in order.
    pub fn velocity_log(&self) -> Vec<f64> {
        self.velocity_log.lock().clone()
    }

    /// The fault configuration, for call counts.
    pub fn faults(&self) -> &FaultConfig {
        &self.faults
    }

    fn record(&self, timestamp: i64, coordinate: Coordinate) {
        let mut history = self.history.lock();
        let timestamp = history
            .last()
            .map_or(timestamp, |&(last, _)| timestamp.max(last + 1));
        history.push((timestamp, coordinate));
        if history.len() > HISTORY_LIMIT {
            let excess = history.len() - HISTORY_LIMIT;
            history.drain(..excess);
        }
    }
}

impl Default for MockStage {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for [`MockStage`].
#[derive(Debug, Default)]
pub struct MockStageBuilder {
    mode: MockMode,
    origin: Coordinate,
    velocity: Option<f64>,
    faults: FaultConfig,
}

impl MockStageBuilder {
    /// Timing mode.
    pub fn mode(mut self, mode: MockMode) -> Self {
        self.mode = mode;
        self
    }

    /// Starting position.
    pub fn origin(mut self, origin: Coordinate) -> Self {
        self.origin = origin;
        self
    }

    /// Initial velocity (units/s).
    pub fn velocity(mut self, velocity: f64) -> Self {
        self.velocity = Some(velocity);
        self
    }

    /// Injected faults.
    pub fn faults(mut self, faults: FaultConfig) -> Self {
        self.faults = faults;
        self
    }

    /// Build the stage.
    pub fn build(self) -> MockStage {
        MockStage {
            mode: self.mode,
            position: Mutex::new(self.origin),
            velocity: Mutex::new(self.velocity.unwrap_or(10.0)),
            history: Mutex::new(vec![(now_us(), self.origin)]),
            faults: self.faults,
            velocity_log: Mutex::new(Vec::new()),
            moves: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Stage for MockStage {
    async fn move_to(&self, target: Coordinate) -> Result<bool> {
        let injected = self.faults.check_operation("move_to");
        match injected {
            Injected::Fail => return Err(anyhow!("MockStage: injected motion fault")),
            Injected::Hang => {
                sleep(HANG).await;
                return Err(anyhow!("MockStage: motion never completed"));
            }
            Injected::Proceed | Injected::Unconfirmed => {}
        }

        let from = *self.position.lock();
        self.record(now_us(), from);

        if self.mode == MockMode::Timed {
            let velocity = *self.velocity.lock();
            if velocity > 0.0 {
                let seconds = from.distance(&target) / velocity;
                sleep(Duration::from_secs_f64(seconds)).await;
            }
        }

        *self.position.lock() = target;
        self.record(now_us(), target);
        self.moves.fetch_add(1, Ordering::SeqCst);
        trace!(x = target.x, y = target.y, z = target.z, "MockStage: reached target");

        Ok(injected != Injected::Unconfirmed)
    }

    async fn set_velocity(&self, velocity: f64) -> Result<()> {
        if !(velocity > 0.0) {
            anyhow::bail!("MockStage: velocity must be positive, got {velocity}");
        }
        *self.velocity.lock() = velocity;
        self.velocity_log.lock().push(velocity);
        Ok(())
    }

    async fn velocity(&self) -> Result<f64> {
        Ok(*self.velocity.lock())
    }

    async fn position(&self) -> Result<Coordinate> {
        Ok(*self.position.lock())
    }

    async fn position_at(&self, timestamp_us: i64) -> Result<Coordinate> {
        let history = self.history.lock();
        let after = history.partition_point(|&(ts, _)| ts <= timestamp_us);
        let position = match (after.checked_sub(1).map(|i| history[i]), history.get(after)) {
            (Some((t0, c0)), Some(&(t1, c1))) => {
                let t = (timestamp_us - t0) as f64 / (t1 - t0) as f64;
                c0.lerp(&c1, t.clamp(0.0, 1.0))
            }
            (Some((_, c0)), None) => c0,
            (None, Some(&(_, c1))) => c1,
            (None, None) => *self.position.lock(),
        };
        Ok(position)
    }
}

// =============================================================================
// MockSpectrometer
// =============================================================================

/// Counters shared by every stream a [`MockSpectrometer`] opens.
#[derive(Debug, Default)]
pub struct StreamStats {
    /// Stream controllers spawned
    pub opened: AtomicUsize,
    /// Captures produced while running
    pub produced: AtomicUsize,
    /// Captures delivered in batches
    pub stored: AtomicUsize,
    /// Captures discarded by `Ignore`
    pub ignored: AtomicUsize,
    /// Captures discarded by `Stop`
    pub dropped: AtomicUsize,
}

#[derive(Debug)]
struct SyntheticSource {
    pixels: usize,
    counter: AtomicU64,
    timestamps: TimestampSource,
}

impl SyntheticSource {
    fn next(&self) -> (i64, Spectrum) {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) as f64;
        let centre = (n * 7.0) % self.pixels.max(1) as f64;
        let intensities = (0..self.pixels)
            .map(|i| {
                let d = i as f64 - centre;
                100.0 + 1000.0 * (-d * d / 50.0).exp()
            })
            .collect();
        (self.timestamps.next(), Spectrum::new(intensities))
    }
}

/// Simulated spectrometer with single-shot and streaming acquisition.
#[derive(Debug)]
pub struct MockSpectrometer {
    mode: MockMode,
    integration_time_ms: Mutex<f64>,
    frame_interval: Duration,
    source: Arc<SyntheticSource>,
    extra: BTreeMap<String, String>,
    faults: FaultConfig,
    stats: Arc<StreamStats>,
}

impl MockSpectrometer {
    /// Instant spectrometer with 64 pixels and 100 ms integration time.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Builder for non-default spectrometers.
    pub fn builder() -> MockSpectrometerBuilder {
        MockSpectrometerBuilder::default()
    }

    /// Stream counters.
    pub fn stream_stats(&self) -> Arc<StreamStats> {
        self.stats.clone()
    }

    /// The fault configuration, for call counts.
    pub fn faults(&self) -> &FaultConfig {
        &self.faults
    }
}

impl Default for MockSpectrometer {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for [`MockSpectrometer`].
#[derive(Debug)]
pub struct MockSpectrometerBuilder {
    mode: MockMode,
    pixels: usize,
    integration_time_ms: f64,
    frame_interval: Duration,
    extra: BTreeMap<String, String>,
    faults: FaultConfig,
}

impl Default for MockSpectrometerBuilder {
    fn default() -> Self {
        Self {
            mode: MockMode::Instant,
            pixels: 64,
            integration_time_ms: 100.0,
            frame_interval: Duration::from_millis(2),
            extra: BTreeMap::new(),
            faults: FaultConfig::none(),
        }
    }
}

impl MockSpectrometerBuilder {
    /// Timing mode.
    pub fn mode(mut self, mode: MockMode) -> Self {
        self.mode = mode;
        self
    }

    /// Spectrum length.
    pub fn pixels(mut self, pixels: usize) -> Self {
        self.pixels = pixels;
        self
    }

    /// Initial integration time.
    pub fn integration_time_ms(mut self, integration_time_ms: f64) -> Self {
        self.integration_time_ms = integration_time_ms;
        self
    }

    /// Period between stream frames.
    pub fn frame_interval(mut self, frame_interval: Duration) -> Self {
        self.frame_interval = frame_interval;
        self
    }

    /// Device metadata entry.
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Injected faults.
    pub fn faults(mut self, faults: FaultConfig) -> Self {
        self.faults = faults;
        self
    }

    /// Build the spectrometer.
    pub fn build(self) -> MockSpectrometer {
        MockSpectrometer {
            mode: self.mode,
            integration_time_ms: Mutex::new(self.integration_time_ms),
            frame_interval: self.frame_interval,
            source: Arc::new(SyntheticSource {
                pixels: self.pixels,
                counter: AtomicU64::new(0),
                timestamps: TimestampSource::new(),
            }),
            extra: self.extra,
            faults: self.faults,
            stats: Arc::new(StreamStats::default()),
        }
    }
}

#[async_trait]
impl Spectrometer for MockSpectrometer {
    async fn capture(&self) -> Result<Capture> {
        match self.faults.check_operation("capture") {
            Injected::Fail => return Err(anyhow!("MockSpectrometer: injected capture fault")),
            Injected::Hang => {
                sleep(HANG).await;
                return Err(anyhow!("MockSpectrometer: capture never completed"));
            }
            Injected::Proceed | Injected::Unconfirmed => {}
        }

        let integration_time_ms = *self.integration_time_ms.lock();
        if self.mode == MockMode::Timed {
            sleep(Duration::from_secs_f64(integration_time_ms / 1000.0)).await;
        }
        let (timestamp_us, spectrum) = self.source.next();
        Ok(Capture {
            spectrum,
            timestamp_us,
            integration_time_ms,
        })
    }

    async fn set_integration_time(&self, integration_time_ms: f64) -> Result<()> {
        if !(integration_time_ms > 0.0) {
            anyhow::bail!("MockSpectrometer: integration time must be positive");
        }
        *self.integration_time_ms.lock() = integration_time_ms;
        Ok(())
    }

    async fn integration_time(&self) -> Result<f64> {
        Ok(*self.integration_time_ms.lock())
    }

    fn metadata_extra(&self) -> BTreeMap<String, String> {
        self.extra.clone()
    }
}

#[async_trait]
impl StreamSource for MockSpectrometer {
    async fn open_stream(&self) -> Result<StreamHandle> {
        if self.faults.check_operation("open_stream") != Injected::Proceed {
            anyhow::bail!("MockSpectrometer: injected stream fault");
        }
        let (commands, command_rx) = mpsc::channel(16);
        let (batch_tx, batches) = mpsc::channel(16);
        self.stats.opened.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(run_stream_controller(
            command_rx,
            batch_tx,
            self.source.clone(),
            self.frame_interval,
            self.faults.clone(),
            self.stats.clone(),
        ));
        Ok(StreamHandle { commands, batches })
    }
}

/// Free-running controller: one capture per tick while started, binned by
/// trigger signals.
///
/// Faults on `"store_batch"` act on `Store`: `Fail` crashes the controller
/// without delivering, `Hang` swallows the signal.
async fn run_stream_controller(
    mut commands: mpsc::Receiver<TriggerCommand>,
    batches: mpsc::Sender<CaptureBatch>,
    source: Arc<SyntheticSource>,
    frame_interval: Duration,
    faults: FaultConfig,
    stats: Arc<StreamStats>,
) {
    let mut ticker = tokio::time::interval(frame_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut running = false;
    let mut pending: Vec<StreamCapture> = Vec::new();

    loop {
        tokio::select! {
            biased;
            command = commands.recv() => match command {
                Some(TriggerCommand::Start) => {
                    running = true;
                    stats.dropped.fetch_add(pending.len(), Ordering::SeqCst);
                    pending.clear();
                }
                Some(TriggerCommand::Ignore) => {
                    stats.ignored.fetch_add(pending.len(), Ordering::SeqCst);
                    pending.clear();
                }
                Some(TriggerCommand::Store) => match faults.check_operation("store_batch") {
                    Injected::Fail => {
                        stats.dropped.fetch_add(pending.len(), Ordering::SeqCst);
                        break;
                    }
                    Injected::Hang => {}
                    Injected::Proceed | Injected::Unconfirmed => {
                        let batch = CaptureBatch { captures: std::mem::take(&mut pending) };
                        let len = batch.len();
                        if batches.send(batch).await.is_err() {
                            stats.dropped.fetch_add(len, Ordering::SeqCst);
                            break;
                        }
                        stats.stored.fetch_add(len, Ordering::SeqCst);
                    }
                },
                Some(TriggerCommand::Stop) | None => {
                    stats.dropped.fetch_add(pending.len(), Ordering::SeqCst);
                    break;
                }
            },
            _ = ticker.tick(), if running => {
                let (timestamp_us, spectrum) = source.next();
                pending.push(StreamCapture { timestamp_us, spectrum });
                stats.produced.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
    debug!("Mock stream controller stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_scenarios_count_calls() {
        let faults = FaultConfig::scenarios(vec![
            FaultScenario::FailCalls { operation: "move_to", calls: vec![2] },
            FaultScenario::FailEvery { operation: "capture", every: 3 },
            FaultScenario::FailAfterN { operation: "open_stream", count: 1 },
        ]);

        assert_eq!(faults.check_operation("move_to"), Injected::Proceed);
        assert_eq!(faults.check_operation("move_to"), Injected::Fail);
        assert_eq!(faults.check_operation("move_to"), Injected::Proceed);

        let captures: Vec<_> = (0..6).map(|_| faults.check_operation("capture")).collect();
        assert_eq!(captures[2], Injected::Fail);
        assert_eq!(captures[5], Injected::Fail);
        assert_eq!(captures[0], Injected::Proceed);

        assert_eq!(faults.check_operation("open_stream"), Injected::Proceed);
        assert_eq!(faults.check_operation("open_stream"), Injected::Fail);
        assert_eq!(faults.calls("move_to"), 3);
    }

    #[tokio::test]
    async fn stage_moves_and_interpolates() {
        let stage = MockStage::new();
        stage.move_to(Coordinate::new(4.0, 0.0, 0.0)).await.unwrap();
        assert_eq!(stage.position().await.unwrap(), Coordinate::new(4.0, 0.0, 0.0));

        let far_future = now_us() + 1_000_000;
        assert_eq!(
            stage.position_at(far_future).await.unwrap(),
            Coordinate::new(4.0, 0.0, 0.0)
        );
        assert_eq!(stage.position_at(0).await.unwrap(), Coordinate::default());
    }

    #[tokio::test]
    async fn unconfirmed_move_still_moves() {
        let stage = MockStage::builder()
            .faults(FaultConfig::scenario(FaultScenario::Unconfirmed {
                operation: "move_to",
                calls: vec![1],
            }))
            .build();
        assert!(!stage.move_to(Coordinate::new(1.0, 1.0, 0.0)).await.unwrap());
        assert!(stage.move_to(Coordinate::new(2.0, 1.0, 0.0)).await.unwrap());
        assert_eq!(stage.move_count(), 2);
    }

    #[tokio::test]
    async fn capture_timestamps_are_unique() {
        let spectrometer = MockSpectrometer::builder().pixels(16).build();
        let a = spectrometer.capture().await.unwrap();
        let b = spectrometer.capture().await.unwrap();
        assert!(b.timestamp_us > a.timestamp_us);
        assert_eq!(a.spectrum.len(), 16);
        assert_eq!(a.integration_time_ms, 100.0);
    }

    #[tokio::test]
    async fn failed_store_closes_the_stream_without_a_batch() {
        let spectrometer = MockSpectrometer::builder()
            .frame_interval(Duration::from_millis(1))
            .faults(FaultConfig::scenario(FaultScenario::FailCalls {
                operation: "store_batch",
                calls: vec![1],
            }))
            .build();
        let mut stream = spectrometer.open_stream().await.unwrap();

        stream.send(TriggerCommand::Start).await.unwrap();
        sleep(Duration::from_millis(5)).await;
        stream.send(TriggerCommand::Store).await.unwrap();
        assert!(stream.batches.recv().await.is_none());

        let stats = spectrometer.stream_stats();
        assert_eq!(stats.stored.load(Ordering::SeqCst), 0);
        assert_eq!(
            stats.dropped.load(Ordering::SeqCst),
            stats.produced.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn stream_bins_captures_between_signals() {
        let spectrometer = MockSpectrometer::builder()
            .frame_interval(Duration::from_millis(1))
            .build();
        let mut stream = spectrometer.open_stream().await.unwrap();

        stream.send(TriggerCommand::Start).await.unwrap();
        sleep(Duration::from_millis(10)).await;
        stream.send(TriggerCommand::Ignore).await.unwrap();
        sleep(Duration::from_millis(10)).await;
        stream.send(TriggerCommand::Store).await.unwrap();
        let batch = stream.batches.recv().await.unwrap();
        stream.send(TriggerCommand::Stop).await.unwrap();
        assert!(stream.batches.recv().await.is_none());

        let stats = spectrometer.stream_stats();
        assert_eq!(stats.stored.load(Ordering::SeqCst), batch.len());
        assert_eq!(
            stats.produced.load(Ordering::SeqCst),
            stats.stored.load(Ordering::SeqCst)
                + stats.ignored.load(Ordering::SeqCst)
                + stats.dropped.load(Ordering::SeqCst)
        );
        assert!(batch
            .captures
            .windows(2)
            .all(|w| w[0].timestamp_us < w[1].timestamp_us));
    }
}
