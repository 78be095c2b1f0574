//! Custom error types for the mapping subsystem.
//!
//! This module defines `MappingError`, the single error type returned by the
//! store, sequencer, pipeline and scan drivers. Using the `thiserror` crate it
//! groups failures the way the acquisition loop has to react to them:
//!
//! - **Configuration errors** (`Config`, `Configuration`): invalid scan-order
//!   policies, missing or out-of-range parameters. These fail fast before any
//!   hardware motion.
//! - **Hardware errors** (`Hardware`, `Timeout`): motion not confirmed or a
//!   capture that never arrived. Drivers retry once and then flag or skip the
//!   point.
//! - **Pipeline errors** (`DuplicateTimestamp`, `MetadataMismatch`): a single
//!   Measurement could not be appended. The autosave worker logs these and
//!   continues with the next item.
//! - **Registry errors** (`DuplicateUnit`, `UnknownUnit`,
//!   `DuplicateCoordinateSet`): name/id collisions in the hubs.
//!
//! Hardware capability traits use `anyhow::Result` at the device boundary;
//! drivers convert to `MappingError` when the failure leaves the loop.

use thiserror::Error;

/// Convenience alias for results using the mapping error type.
pub type AppResult<T> = std::result::Result<T, MappingError>;

/// Primary error type for mapping acquisition.
#[derive(Error, Debug)]
pub enum MappingError {
    /// Configuration file could not be loaded or extracted.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration values parsed but are semantically invalid.
    ///
    /// Raised for unknown scan methods/axes, zero accumulations, a queue
    /// capacity that does not exceed the backpressure threshold, and similar.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// A hardware command failed after its retry budget was spent.
    #[error("Hardware error: {0}")]
    Hardware(String),

    /// A bounded hardware wait expired.
    #[error("Timed out after {after_ms}ms waiting for {operation}")]
    Timeout {
        /// Operation that was awaited (e.g. "motion", "capture")
        operation: String,
        /// Configured bound in milliseconds
        after_ms: u64,
    },

    /// The timestamp is already present in the unit.
    #[error("Duplicate timestamp {timestamp} in mapping unit '{unit}'")]
    DuplicateTimestamp {
        /// Unit name
        unit: String,
        /// Offending timestamp (µs)
        timestamp: i64,
    },

    /// Measurement metadata does not match the unit's write-once metadata.
    #[error("Metadata mismatch in unit '{unit}' for key '{key}': expected '{expected}', found '{found}'")]
    MetadataMismatch {
        /// Unit name
        unit: String,
        /// First key that did not match
        key: String,
        /// Value recorded on the unit
        expected: String,
        /// Value carried by the rejected measurement
        found: String,
    },

    /// Measurement metadata failed creation-time validation.
    #[error("Invalid measurement metadata: {0}")]
    InvalidMetadata(String),

    /// Measurement was already analysed and can no longer take raw captures.
    #[error("Measurement {0} is already analysed")]
    AlreadyAnalysed(i64),

    /// A unit with this id or name already exists in the hub.
    #[error("Mapping unit '{0}' already exists")]
    DuplicateUnit(String),

    /// No unit with this id or name.
    #[error("Unknown mapping unit '{0}'")]
    UnknownUnit(String),

    /// Column name not recognised by `MappingUnit::get_column`.
    #[error("Unknown column '{0}'")]
    UnknownColumn(String),

    /// A coordinate set with this name already exists.
    #[error("Coordinate set '{0}' already exists")]
    DuplicateCoordinateSet(String),

    /// The autosave queue no longer accepts items.
    #[error("Autosave pipeline is closed")]
    PipelineClosed,

    /// The autosave worker task ended abnormally.
    #[error("Autosave worker failed: {0}")]
    Worker(String),

    /// A point or driver state machine was asked for an illegal transition.
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition {
        /// Current state
        from: String,
        /// Requested state
        to: String,
    },

    /// The driver already runs a scan against its hardware.
    #[error("A scan is already running on this driver")]
    ScanInProgress,

    /// Standard I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Delimited-text read/write failed.
    #[error("CSV error: {0}")]
    Csv(String),

    /// JSON serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(feature = "storage_csv")]
impl From<csv::Error> for MappingError {
    fn from(err: csv::Error) -> Self {
        MappingError::Csv(err.to_string())
    }
}

impl MappingError {
    /// Whether a failure is a device or data fault rather than a broken run.
    ///
    /// Scan drivers end a run on any loop error, but report recoverable ones
    /// as [`ScanOutcome::Failed`](crate::acquisition::ScanOutcome::Failed)
    /// instead of returning them.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            MappingError::Hardware(_)
                | MappingError::Timeout { .. }
                | MappingError::DuplicateTimestamp { .. }
                | MappingError::MetadataMismatch { .. }
                | MappingError::AlreadyAnalysed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_errors_are_recoverable() {
        let err = MappingError::DuplicateTimestamp {
            unit: "map".into(),
            timestamp: 42,
        };
        assert!(err.is_recoverable());
        assert!(err.to_string().contains("42"));
    }

    #[test]
    fn configuration_errors_are_not_recoverable() {
        let err = MappingError::Configuration("unknown axis 'w'".into());
        assert!(!err.is_recoverable());
        assert_eq!(
            err.to_string(),
            "Configuration validation error: unknown axis 'w'"
        );
    }

    #[test]
    fn timeout_message_names_operation() {
        let err = MappingError::Timeout {
            operation: "motion".into(),
            after_ms: 500,
        };
        assert_eq!(err.to_string(), "Timed out after 500ms waiting for motion");
    }
}
