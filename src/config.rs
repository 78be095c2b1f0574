//! Configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (default `config/mapping.toml`)
//! 2. environment variables prefixed with `MAPPING_DAQ_`, nested keys split
//!    on `__` (e.g. `MAPPING_DAQ_ACQUISITION__BUFFER_THRESHOLD=8`)
//!
//! Every acquisition value has a serde default, so a file only needs the
//! keys it changes. Drivers read the values once at construction.
//!
//! # Example
//! ```no_run
//! use mapping_daq::config::MappingConfig;
//!
//! let config = MappingConfig::load()?;
//! config.validate()?;
//! # Ok::<(), mapping_daq::error::MappingError>(())
//! ```

use crate::coordinates::sequencer::ScanOrderPolicy;
use crate::error::{AppResult, MappingError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Retries after an unconfirmed or failed move. Fixed, not configurable.
pub const MOTION_RETRIES: u32 = 1;

/// Retries after a failed capture, or a stream line whose batch was lost.
pub const CAPTURE_RETRIES: u32 = 1;

/// Environment prefix for overrides.
pub const ENV_PREFIX: &str = "MAPPING_DAQ_";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct MappingConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Acquisition loop settings
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    /// Traversal order
    #[serde(default)]
    pub scan_order: ScanOrderPolicy,
    /// Output locations
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Application-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

/// Acquisition loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AcquisitionConfig {
    /// Autosave queue depth above which the driver drains and rotates
    #[serde(default = "default_buffer_threshold")]
    pub buffer_threshold: usize,
    /// Capacity of each bounded autosave queue; must exceed the threshold
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Checkpoint every K visited coordinates in discrete mode (0 = never)
    #[serde(default = "default_checkpoint_cadence_discrete")]
    pub checkpoint_cadence_discrete: usize,
    /// Checkpoint every K completed lines in continuous mode (0 = never)
    #[serde(default = "default_checkpoint_cadence_continuous")]
    pub checkpoint_cadence_continuous: usize,
    /// Velocity multiplier while repositioning between lines
    #[serde(default = "default_crawl_speed_factor")]
    pub crawl_speed_factor: f64,
    /// Stage velocity along a line in continuous mode (units/s)
    #[serde(default = "default_line_velocity")]
    pub line_velocity: f64,
    /// Bound on one motion command
    #[serde(default = "default_motion_timeout_ms")]
    pub motion_timeout_ms: u64,
    /// Bound on one capture or stream batch
    #[serde(default = "default_capture_timeout_ms")]
    pub capture_timeout_ms: u64,
    /// Captures accumulated per discrete point
    #[serde(default = "default_accumulations")]
    pub accumulations: u32,
    /// Spectrometer integration time
    #[serde(default = "default_integration_time_ms")]
    pub integration_time_ms: f64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            buffer_threshold: default_buffer_threshold(),
            queue_capacity: default_queue_capacity(),
            checkpoint_cadence_discrete: default_checkpoint_cadence_discrete(),
            checkpoint_cadence_continuous: default_checkpoint_cadence_continuous(),
            crawl_speed_factor: default_crawl_speed_factor(),
            line_velocity: default_line_velocity(),
            motion_timeout_ms: default_motion_timeout_ms(),
            capture_timeout_ms: default_capture_timeout_ms(),
            accumulations: default_accumulations(),
            integration_time_ms: default_integration_time_ms(),
        }
    }
}

impl AcquisitionConfig {
    /// Motion bound as a [`Duration`].
    pub fn motion_timeout(&self) -> Duration {
        Duration::from_millis(self.motion_timeout_ms)
    }

    /// Capture bound as a [`Duration`].
    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_timeout_ms)
    }

    /// Velocity used between lines.
    pub fn crawl_velocity(&self) -> f64 {
        self.line_velocity * self.crawl_speed_factor
    }

    /// Check invariants between fields.
    pub fn validate(&self) -> AppResult<()> {
        if self.buffer_threshold == 0 {
            return Err(MappingError::Configuration(
                "buffer_threshold must be at least 1".into(),
            ));
        }
        if self.queue_capacity <= self.buffer_threshold {
            return Err(MappingError::Configuration(format!(
                "queue_capacity ({}) must exceed buffer_threshold ({})",
                self.queue_capacity, self.buffer_threshold
            )));
        }
        if !(self.crawl_speed_factor > 0.0) {
            return Err(MappingError::Configuration(format!(
                "crawl_speed_factor must be positive, got {}",
                self.crawl_speed_factor
            )));
        }
        if !(self.line_velocity > 0.0) {
            return Err(MappingError::Configuration(format!(
                "line_velocity must be positive, got {}",
                self.line_velocity
            )));
        }
        if self.motion_timeout_ms == 0 || self.capture_timeout_ms == 0 {
            return Err(MappingError::Configuration(
                "motion and capture timeouts must be non-zero".into(),
            ));
        }
        if self.accumulations == 0 {
            return Err(MappingError::Configuration(
                "accumulations must be at least 1".into(),
            ));
        }
        if !(self.integration_time_ms > 0.0) {
            return Err(MappingError::Configuration(format!(
                "integration_time_ms must be positive, got {}",
                self.integration_time_ms
            )));
        }
        Ok(())
    }
}

/// Output locations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// Directory for exported units
    #[serde(default = "default_export_dir")]
    pub export_dir: PathBuf,
    /// Directory for checkpoint and remainder files; none keeps them in memory
    #[serde(default)]
    pub checkpoint_dir: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            export_dir: default_export_dir(),
            checkpoint_dir: None,
        }
    }
}

// Default value functions
fn default_name() -> String {
    "Mapping DAQ".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_buffer_threshold() -> usize {
    64
}

fn default_queue_capacity() -> usize {
    256
}

fn default_checkpoint_cadence_discrete() -> usize {
    25
}

fn default_checkpoint_cadence_continuous() -> usize {
    2
}

fn default_crawl_speed_factor() -> f64 {
    0.5
}

fn default_line_velocity() -> f64 {
    1.0
}

fn default_motion_timeout_ms() -> u64 {
    10_000
}

fn default_capture_timeout_ms() -> u64 {
    5_000
}

fn default_accumulations() -> u32 {
    1
}

fn default_integration_time_ms() -> f64 {
    100.0
}

fn default_export_dir() -> PathBuf {
    PathBuf::from("data")
}

impl MappingConfig {
    /// Load from `config/mapping.toml` and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from("config/mapping.toml")
    }

    /// Load from a specific file path and the environment.
    ///
    /// A missing file is not an error: defaults apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Self::figment(path.as_ref()).extract()?)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(MappingConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| MappingError::Configuration(format!("Cannot render configuration: {e}")))
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(MappingError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }
        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(MappingError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }
        self.acquisition.validate()
    }
}
