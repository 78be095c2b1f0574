//! # Mapping DAQ
//!
//! Spectral mapping acquisition: a motorized XY(Z) stage and a spectrometer
//! are driven through an ordered set of sampling coordinates to build a
//! spatial map of spectra.
//!
//! ## Crate Structure
//!
//! - **`measurement`**: `Measurement`, its typed metadata and unique timestamps.
//! - **`coordinates`**: coordinates, named coordinate sets, the set hub, the
//!   sequencer (raster/snake/scramble/line endpoints) and CSV persistence.
//! - **`mapping`**: the append-only `MappingUnit` store, the `MappingHub`
//!   and export adapters.
//! - **`hardware`**: stage/spectrometer/stream capability traits and mocks.
//! - **`acquisition`**: discrete and continuous scan drivers, the autosave
//!   pipeline, checkpoints and progress.
//! - **`config`**: Figment-loaded configuration (TOML + environment).
//! - **`logging`**: tracing-subscriber setup.
//! - **`error`**: the `MappingError` enum shared by every module.

pub mod acquisition;
pub mod config;
pub mod coordinates;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod mapping;
pub mod measurement;

pub use acquisition::{
    ContinuousScanDriver, DiscreteScanDriver, ScanControl, ScanOutcome, ScanReport,
};
pub use config::MappingConfig;
pub use coordinates::sequencer::{ScanAxis, ScanMethod, ScanOrderPolicy, Scramble, Sequencer};
pub use coordinates::{Coordinate, CoordinateHub, CoordinateSet};
pub use error::{AppResult, MappingError};
pub use mapping::{MappingHub, MappingUnit};
pub use measurement::{Measurement, MeasurementMetadata, Spectrum};
