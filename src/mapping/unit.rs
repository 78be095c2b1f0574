//! MappingUnit store.
//!
//! A mapping unit holds the result of one mapping run as parallel columns
//! (`timestamp`, `x`, `y`, `z`, `raw`, `averaged`). Rows are appended under a
//! single write lock so readers always see either the state before an append
//! or the state after it, never a partially written row.
//!
//! # Metadata
//!
//! The unit's metadata is written once, from the first appended
//! measurement, and merged with the scan parameters given at creation
//! (laser, objective, step size...). Every later measurement must be
//! superset-compatible with it, otherwise the append fails with
//! [`MappingError::MetadataMismatch`] and nothing is written.
//!
//! # Observers
//!
//! Appends are announced on a broadcast channel after the lock is released,
//! which is how a live plot would refresh without polling.

use crate::coordinates::Coordinate;
use crate::error::{AppResult, MappingError};
use crate::measurement::{Measurement, MeasurementMetadata, Spectrum};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tracing::debug;

const OBSERVER_CAPACITY: usize = 256;

/// Write-once unit metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitMetadata {
    /// Metadata of the first appended measurement
    pub measurement: MeasurementMetadata,
    /// Laser/objective/scan parameters supplied when the unit was created
    pub scan: BTreeMap<String, String>,
}

/// Notification sent to observers.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitEvent {
    /// A row was appended
    Appended {
        /// Measurement timestamp
        timestamp: i64,
        /// Row index of the new measurement
        row: usize,
    },
    /// The unit was marked complete
    Completed {
        /// Number of rows at completion
        len: usize,
    },
}

/// One row of the unit, cloned out of the columns.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Measurement timestamp (µs)
    pub timestamp: i64,
    /// Stage position of the measurement
    pub coordinate: Coordinate,
    /// Raw captures
    pub raw: Vec<Spectrum>,
    /// Averaged spectrum
    pub averaged: Option<Spectrum>,
}

/// A copy of one column.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    /// `timestamp`
    Timestamps(Vec<i64>),
    /// `x`, `y` or `z`
    Positions(Vec<f64>),
    /// `raw`
    Raw(Vec<Vec<Spectrum>>),
    /// `averaged`
    Averaged(Vec<Option<Spectrum>>),
}

impl Column {
    /// Number of entries.
    pub fn len(&self) -> usize {
        match self {
            Column::Timestamps(v) => v.len(),
            Column::Positions(v) => v.len(),
            Column::Raw(v) => v.len(),
            Column::Averaged(v) => v.len(),
        }
    }

    /// Whether the column is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Read-only overview of a unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitSummary {
    /// Unit id
    pub unit_id: String,
    /// Unit name
    pub unit_name: String,
    /// Number of rows
    pub len: usize,
    /// First timestamp, if any
    pub first_timestamp: Option<i64>,
    /// Last timestamp, if any
    pub last_timestamp: Option<i64>,
    /// (min, max) of x
    pub x_range: Option<(f64, f64)>,
    /// (min, max) of y
    pub y_range: Option<(f64, f64)>,
    /// (min, max) of z
    pub z_range: Option<(f64, f64)>,
    /// Whether the producing run marked the unit complete
    pub complete: bool,
    /// Write-once metadata, once set
    pub metadata: Option<UnitMetadata>,
}

#[derive(Debug, Default)]
struct Columns {
    timestamp: Vec<i64>,
    x: Vec<f64>,
    y: Vec<f64>,
    z: Vec<f64>,
    raw: Vec<Vec<Spectrum>>,
    averaged: Vec<Option<Spectrum>>,
    index: HashMap<i64, usize>,
    metadata: Option<UnitMetadata>,
}

impl Columns {
    fn len(&self) -> usize {
        self.timestamp.len()
    }
}

/// Append-only, thread-safe collection of measurements tagged with stage
/// coordinates.
#[derive(Debug)]
pub struct MappingUnit {
    unit_id: String,
    unit_name: String,
    scan_params: BTreeMap<String, String>,
    columns: RwLock<Columns>,
    complete: AtomicBool,
    events: broadcast::Sender<UnitEvent>,
}

impl MappingUnit {
    /// Create an empty unit with a fresh id.
    pub fn new(unit_name: impl Into<String>, scan_params: BTreeMap<String, String>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), unit_name, scan_params)
    }

    /// Create an empty unit with a caller-chosen id.
    pub fn with_id(
        unit_id: impl Into<String>,
        unit_name: impl Into<String>,
        scan_params: BTreeMap<String, String>,
    ) -> Self {
        let (events, _) = broadcast::channel(OBSERVER_CAPACITY);
        Self {
            unit_id: unit_id.into(),
            unit_name: unit_name.into(),
            scan_params,
            columns: RwLock::new(Columns::default()),
            complete: AtomicBool::new(false),
            events,
        }
    }

    /// Unique id.
    pub fn unit_id(&self) -> &str {
        &self.unit_id
    }

    /// Name, unique within its hub.
    pub fn unit_name(&self) -> &str {
        &self.unit_name
    }

    /// Append one measurement at `coordinate`.
    ///
    /// Fails without writing anything when the timestamp already exists or
    /// the metadata is incompatible with the unit's.
    pub fn append(&self, timestamp: i64, coordinate: Coordinate, measurement: Measurement) -> AppResult<usize> {
        let row = {
            let mut columns = self.columns.write();

            if columns.index.contains_key(&timestamp) {
                return Err(MappingError::DuplicateTimestamp {
                    unit: self.unit_name.clone(),
                    timestamp,
                });
            }

            match &columns.metadata {
                Some(existing) => {
                    if let Some((key, expected, found)) =
                        measurement.metadata().first_mismatch(&existing.measurement)
                    {
                        return Err(MappingError::MetadataMismatch {
                            unit: self.unit_name.clone(),
                            key,
                            expected,
                            found,
                        });
                    }
                }
                None => {
                    columns.metadata = Some(UnitMetadata {
                        measurement: measurement.metadata().clone(),
                        scan: self.scan_params.clone(),
                    });
                }
            }

            let averaged = measurement.averaged();
            let raw = measurement.raw().to_vec();
            let row = columns.len();
            columns.timestamp.push(timestamp);
            columns.x.push(coordinate.x);
            columns.y.push(coordinate.y);
            columns.z.push(coordinate.z);
            columns.raw.push(raw);
            columns.averaged.push(averaged);
            columns.index.insert(timestamp, row);
            row
        };

        debug!(unit = %self.unit_name, timestamp, row, "Appended measurement");
        // No subscribers is fine.
        let _ = self.events.send(UnitEvent::Appended { timestamp, row });
        Ok(row)
    }

    /// Row for a timestamp.
    pub fn get_by_id(&self, timestamp: i64) -> Option<Row> {
        let columns = self.columns.read();
        let row = *columns.index.get(&timestamp)?;
        Some(Row {
            timestamp,
            coordinate: Coordinate::new(columns.x[row], columns.y[row], columns.z[row]),
            raw: columns.raw[row].clone(),
            averaged: columns.averaged[row].clone(),
        })
    }

    /// Copy of a named column: `timestamp`, `x`, `y`, `z`, `raw`, `averaged`.
    pub fn get_column(&self, name: &str) -> AppResult<Column> {
        let columns = self.columns.read();
        let column = match name {
            "timestamp" => Column::Timestamps(columns.timestamp.clone()),
            "x" => Column::Positions(columns.x.clone()),
            "y" => Column::Positions(columns.y.clone()),
            "z" => Column::Positions(columns.z.clone()),
            "raw" => Column::Raw(columns.raw.clone()),
            "averaged" => Column::Averaged(columns.averaged.clone()),
            other => return Err(MappingError::UnknownColumn(other.to_string())),
        };
        Ok(column)
    }

    /// Timestamps in append order.
    pub fn timestamps(&self) -> Vec<i64> {
        self.columns.read().timestamp.clone()
    }

    /// All rows in append order.
    pub fn rows(&self) -> Vec<Row> {
        let columns = self.columns.read();
        (0..columns.len())
            .map(|row| Row {
                timestamp: columns.timestamp[row],
                coordinate: Coordinate::new(columns.x[row], columns.y[row], columns.z[row]),
                raw: columns.raw[row].clone(),
                averaged: columns.averaged[row].clone(),
            })
            .collect()
    }

    /// Lengths of every column, for invariant checks.
    pub fn column_lengths(&self) -> [usize; 6] {
        let c = self.columns.read();
        [
            c.timestamp.len(),
            c.x.len(),
            c.y.len(),
            c.z.len(),
            c.raw.len(),
            c.averaged.len(),
        ]
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.columns.read().len()
    }

    /// Whether the unit has no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write-once metadata, once the first measurement arrived.
    pub fn metadata(&self) -> Option<UnitMetadata> {
        self.columns.read().metadata.clone()
    }

    /// Read-only overview.
    pub fn summary(&self) -> UnitSummary {
        let columns = self.columns.read();
        UnitSummary {
            unit_id: self.unit_id.clone(),
            unit_name: self.unit_name.clone(),
            len: columns.len(),
            first_timestamp: columns.timestamp.first().copied(),
            last_timestamp: columns.timestamp.last().copied(),
            x_range: range(&columns.x),
            y_range: range(&columns.y),
            z_range: range(&columns.z),
            complete: self.is_complete(),
            metadata: columns.metadata.clone(),
        }
    }

    /// Subscribe to append/complete notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<UnitEvent> {
        self.events.subscribe()
    }

    /// Mark the unit complete after its autosave queue drained.
    ///
    /// A later scan may still append to the unit.
    pub fn mark_complete(&self) {
        self.complete.store(true, Ordering::Release);
        let _ = self.events.send(UnitEvent::Completed { len: self.len() });
    }

    /// Whether the unit was marked complete.
    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }
}

fn range(values: &[f64]) -> Option<(f64, f64)> {
    values.iter().fold(None, |acc, &v| match acc {
        None => Some((v, v)),
        Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
    })
}
