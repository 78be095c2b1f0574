//! Autosave pipeline: bounded queue + background worker draining captured
//! measurements into a [`MappingUnit`].
//!
//! # Queue generations
//!
//! The pipeline always has at most one active queue. A backpressure restart
//! is an explicit state transition:
//!
//! ```text
//! Active(gen N) ──rotate──> Draining(gen N) ──worker empty──> Active(gen N+1)
//! ```
//!
//! The old sender is dropped first, so the old queue refuses pushes from the
//! moment draining begins. The old worker keeps receiving until its queue is
//! empty and only then is generation N+1 spawned. Items therefore reach the
//! unit in push order across any number of restarts.
//!
//! # Failures
//!
//! A single item that cannot be appended (duplicate timestamp, metadata
//! mismatch) is logged and counted. The worker moves on to the next item.

use crate::coordinates::Coordinate;
use crate::error::{AppResult, MappingError};
use crate::mapping::MappingUnit;
use crate::measurement::Measurement;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

/// One unit of work for the autosave worker.
#[derive(Debug, Clone)]
pub struct AutosaveItem {
    /// Measurement timestamp (µs), the unit's row key
    pub timestamp: i64,
    /// Stage position the measurement belongs to
    pub coordinate: Coordinate,
    /// The measurement itself; ownership moves to the worker
    pub measurement: Measurement,
}

impl AutosaveItem {
    /// Item keyed by the measurement's own timestamp.
    pub fn new(coordinate: Coordinate, measurement: Measurement) -> Self {
        Self {
            timestamp: measurement.timestamp(),
            coordinate,
            measurement,
        }
    }
}

/// Observable queue state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Accepting pushes
    Active {
        /// Generation number, starting at 0
        generation: u64,
    },
    /// Refusing pushes while the worker empties the queue
    Draining {
        /// Generation being drained
        generation: u64,
    },
    /// Finished; no further generations
    Stopped,
}

/// Totals after the pipeline finished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AutosaveStats {
    /// Items accepted by `push`
    pub enqueued: usize,
    /// Items appended to the unit
    pub appended: usize,
    /// Items the unit rejected
    pub failed: usize,
    /// Worker generations spawned
    pub generations: u64,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicUsize,
    appended: AtomicUsize,
    failed: AtomicUsize,
}

#[derive(Debug)]
struct ActiveQueue {
    generation: u64,
    tx: mpsc::Sender<AutosaveItem>,
    worker: JoinHandle<()>,
}

/// Bounded autosave queue with restartable worker generations.
#[derive(Debug)]
pub struct AutosavePipeline {
    unit: Arc<MappingUnit>,
    capacity: usize,
    threshold: usize,
    pending: Arc<AtomicUsize>,
    counters: Arc<Counters>,
    active: Option<ActiveQueue>,
    state: QueueState,
    next_generation: u64,
}

impl AutosavePipeline {
    /// Spawn generation 0 for `unit`.
    ///
    /// `capacity` bounds each queue; `threshold` is the depth above which
    /// [`is_backpressured`](Self::is_backpressured) reports true.
    pub fn start(unit: Arc<MappingUnit>, capacity: usize, threshold: usize) -> AppResult<Self> {
        if capacity == 0 {
            return Err(MappingError::Configuration(
                "autosave queue capacity must be at least 1".into(),
            ));
        }
        let mut pipeline = Self {
            unit,
            capacity,
            threshold,
            pending: Arc::new(AtomicUsize::new(0)),
            counters: Arc::new(Counters::default()),
            active: None,
            state: QueueState::Stopped,
            next_generation: 0,
        };
        pipeline.spawn_generation();
        Ok(pipeline)
    }

    fn spawn_generation(&mut self) {
        let generation = self.next_generation;
        self.next_generation += 1;

        let (tx, rx) = mpsc::channel(self.capacity);
        let span = info_span!("autosave_worker", unit = %self.unit.unit_name(), generation);
        let worker = tokio::spawn(
            run_worker(
                generation,
                self.unit.clone(),
                rx,
                self.pending.clone(),
                self.counters.clone(),
            )
            .instrument(span),
        );
        debug!(unit = %self.unit.unit_name(), generation, "Autosave generation started");
        self.active = Some(ActiveQueue {
            generation,
            tx,
            worker,
        });
        self.state = QueueState::Active { generation };
    }

    /// Enqueue one item, waiting for space if the queue is full.
    pub async fn push(&self, item: AutosaveItem) -> AppResult<()> {
        let active = self.active.as_ref().ok_or(MappingError::PipelineClosed)?;
        self.pending.fetch_add(1, Ordering::SeqCst);
        if active.tx.send(item).await.is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(MappingError::PipelineClosed);
        }
        self.counters.enqueued.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Items pushed but not yet processed by a worker.
    pub fn depth(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Backpressure threshold.
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Whether the depth exceeds the threshold.
    pub fn is_backpressured(&self) -> bool {
        self.depth() > self.threshold
    }

    /// Current queue state.
    pub fn state(&self) -> QueueState {
        self.state
    }

    /// Generation currently accepting pushes.
    pub fn generation(&self) -> Option<u64> {
        self.active.as_ref().map(|a| a.generation)
    }

    /// Completed drain-and-restart cycles.
    pub fn restarts(&self) -> u64 {
        self.next_generation.saturating_sub(1)
    }

    /// Close the active queue, wait until its worker drained it, then start
    /// the next generation.
    pub async fn rotate(&mut self) -> AppResult<()> {
        let depth = self.depth();
        self.drain_active().await?;
        self.spawn_generation();
        info!(
            unit = %self.unit.unit_name(),
            generation = self.next_generation - 1,
            drained = depth,
            "Autosave queue restarted"
        );
        Ok(())
    }

    /// Rotate if backpressured. Returns whether a restart happened.
    pub async fn relieve(&mut self) -> AppResult<bool> {
        if !self.is_backpressured() {
            return Ok(false);
        }
        warn!(
            unit = %self.unit.unit_name(),
            depth = self.depth(),
            threshold = self.threshold,
            "Autosave backpressure; draining queue"
        );
        self.rotate().await?;
        Ok(true)
    }

    /// Close the pipeline and wait until every pushed item was processed.
    pub async fn finish(mut self) -> AppResult<AutosaveStats> {
        self.drain_active().await?;
        self.state = QueueState::Stopped;
        Ok(self.stats())
    }

    /// Counters so far.
    pub fn stats(&self) -> AutosaveStats {
        AutosaveStats {
            enqueued: self.counters.enqueued.load(Ordering::SeqCst),
            appended: self.counters.appended.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
            generations: self.next_generation,
        }
    }

    async fn drain_active(&mut self) -> AppResult<()> {
        let ActiveQueue {
            generation,
            tx,
            worker,
        } = self.active.take().ok_or(MappingError::PipelineClosed)?;
        self.state = QueueState::Draining { generation };
        // Closing the channel is what refuses further pushes.
        drop(tx);
        worker
            .await
            .map_err(|e| MappingError::Worker(format!("generation {generation}: {e}")))
    }
}

async fn run_worker(
    generation: u64,
    unit: Arc<MappingUnit>,
    mut rx: mpsc::Receiver<AutosaveItem>,
    pending: Arc<AtomicUsize>,
    counters: Arc<Counters>,
) {
    while let Some(item) = rx.recv().await {
        let timestamp = item.timestamp;
        match unit.append(timestamp, item.coordinate, item.measurement) {
            Ok(_) => {
                counters.appended.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::SeqCst);
                warn!(timestamp, error = %e, "Skipping measurement that could not be appended");
            }
        }
        pending.fetch_sub(1, Ordering::SeqCst);
    }
    debug!(generation, "Autosave worker drained");
}
