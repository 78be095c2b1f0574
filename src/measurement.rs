//! Spectrometer measurements and their metadata.
//!
//! A [`Measurement`] is one spectrometer capture, or an accumulated set of
//! captures taken at the same stage position, together with acquisition
//! metadata. It is created by the acquisition side, grows only by appending
//! raw captures, and is handed to the autosave worker by value at enqueue
//! time, so no two writers ever touch it concurrently.
//!
//! Metadata is a typed record: a fixed core schema (`version`,
//! `accumulations`, `integration_time`) plus a free string-keyed extension
//! map for editable keys such as laser power or objective name. Extension
//! keys are validated when the measurement is created.

use crate::error::{AppResult, MappingError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};

/// Metadata schema version written into every measurement.
pub const METADATA_VERSION: &str = "1.0";

/// Keys owned by the fixed schema; extension entries may not reuse them.
pub const FIXED_KEYS: [&str; 3] = ["version", "accumulations", "integration_time"];

/// A single spectrum: detector intensities ordered by pixel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Spectrum {
    /// Intensity per detector pixel
    pub intensities: Vec<f64>,
}

impl Spectrum {
    /// Wrap raw intensities.
    pub fn new(intensities: Vec<f64>) -> Self {
        Self { intensities }
    }

    /// Number of detector pixels.
    pub fn len(&self) -> usize {
        self.intensities.len()
    }

    /// Whether the spectrum holds no pixels.
    pub fn is_empty(&self) -> bool {
        self.intensities.is_empty()
    }

    /// Element-wise mean of several spectra.
    ///
    /// Spectra shorter than the longest one contribute only to the pixels
    /// they cover. Returns `None` for an empty slice.
    pub fn mean(spectra: &[Spectrum]) -> Option<Spectrum> {
        let width = spectra.iter().map(Spectrum::len).max()?;
        let mut sums = vec![0.0; width];
        let mut counts = vec![0usize; width];
        for spectrum in spectra {
            for (pixel, value) in spectrum.intensities.iter().enumerate() {
                sums[pixel] += value;
                counts[pixel] += 1;
            }
        }
        let intensities = sums
            .into_iter()
            .zip(counts)
            .map(|(sum, count)| if count == 0 { 0.0 } else { sum / count as f64 })
            .collect();
        Some(Spectrum { intensities })
    }
}

/// Typed measurement metadata: fixed core keys plus an extension map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementMetadata {
    /// Metadata schema version
    pub version: String,
    /// Number of captures accumulated into the measurement
    pub accumulations: u32,
    /// Integration time per capture in milliseconds
    pub integration_time_ms: f64,
    /// Editable keys (laser power, objective, operator notes, ...)
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl MeasurementMetadata {
    /// Create metadata with the current schema version and no extension keys.
    pub fn new(accumulations: u32, integration_time_ms: f64) -> Self {
        Self {
            version: METADATA_VERSION.to_string(),
            accumulations,
            integration_time_ms,
            extra: BTreeMap::new(),
        }
    }

    /// Builder-style extension entry.
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Set an editable key. Fixed keys are refused.
    pub fn set_extra(&mut self, key: impl Into<String>, value: impl Into<String>) -> AppResult<()> {
        let key = key.into();
        check_extension_key(&key)?;
        self.extra.insert(key, value.into());
        Ok(())
    }

    /// Validate the record as a whole.
    pub fn validate(&self) -> AppResult<()> {
        if self.accumulations == 0 {
            return Err(MappingError::InvalidMetadata(
                "accumulations must be at least 1".into(),
            ));
        }
        if !(self.integration_time_ms > 0.0) {
            return Err(MappingError::InvalidMetadata(format!(
                "integration_time must be positive, got {}",
                self.integration_time_ms
            )));
        }
        for key in self.extra.keys() {
            check_extension_key(key)?;
        }
        Ok(())
    }

    /// Flattened view with fixed keys first, used by the store's comparison
    /// and by exporters.
    pub fn flatten(&self) -> BTreeMap<String, String> {
        let mut map = self.extra.clone();
        map.insert("version".into(), self.version.clone());
        map.insert("accumulations".into(), self.accumulations.to_string());
        map.insert(
            "integration_time".into(),
            format_float(self.integration_time_ms),
        );
        map
    }

    /// Superset-compatible check against a reference record.
    ///
    /// Every key of `reference` must be present in `self` with the same
    /// value; `self` may carry additional extension keys. On mismatch the
    /// first offending `(key, expected, found)` triple is returned.
    pub fn first_mismatch(&self, reference: &MeasurementMetadata) -> Option<(String, String, String)> {
        let ours = self.flatten();
        for (key, expected) in reference.flatten() {
            match ours.get(&key) {
                Some(found) if *found == expected => {}
                Some(found) => return Some((key, expected, found.clone())),
                None => return Some((key, expected, String::from("<missing>"))),
            }
        }
        None
    }

    /// Whether `self` may be appended to a unit whose metadata is `reference`.
    pub fn is_compatible_with(&self, reference: &MeasurementMetadata) -> bool {
        self.first_mismatch(reference).is_none()
    }
}

fn check_extension_key(key: &str) -> AppResult<()> {
    if key.trim().is_empty() {
        return Err(MappingError::InvalidMetadata("empty metadata key".into()));
    }
    if FIXED_KEYS.contains(&key) {
        return Err(MappingError::InvalidMetadata(format!(
            "'{key}' is a fixed metadata key and cannot be edited"
        )));
    }
    Ok(())
}

fn format_float(value: f64) -> String {
    // Trailing zeros are irrelevant for equality of configured times.
    let text = format!("{value:.6}");
    text.trim_end_matches('0').trim_end_matches('.').to_string()
}

/// One spectrometer measurement at one stage position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Measurement {
    timestamp: i64,
    integration_time_ms: f64,
    raw: Vec<Spectrum>,
    averaged: Option<Spectrum>,
    metadata: MeasurementMetadata,
}

impl Measurement {
    /// Create an empty measurement. Metadata is validated here.
    pub fn new(timestamp: i64, integration_time_ms: f64, metadata: MeasurementMetadata) -> AppResult<Self> {
        metadata.validate()?;
        Ok(Self {
            timestamp,
            integration_time_ms,
            raw: Vec::new(),
            averaged: None,
            metadata,
        })
    }

    /// Create a measurement from a single capture.
    pub fn from_capture(
        timestamp: i64,
        integration_time_ms: f64,
        spectrum: Spectrum,
        metadata: MeasurementMetadata,
    ) -> AppResult<Self> {
        let mut measurement = Self::new(timestamp, integration_time_ms, metadata)?;
        measurement.push_raw(spectrum)?;
        Ok(measurement)
    }

    /// Unique timestamp in microseconds.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Integration time actually used, in milliseconds.
    pub fn integration_time_ms(&self) -> f64 {
        self.integration_time_ms
    }

    /// Metadata record.
    pub fn metadata(&self) -> &MeasurementMetadata {
        &self.metadata
    }

    /// Mutable access to the editable part of the metadata.
    pub fn metadata_mut(&mut self) -> &mut MeasurementMetadata {
        &mut self.metadata
    }

    /// Raw captures in acquisition order (empty once analysed).
    pub fn raw(&self) -> &[Spectrum] {
        &self.raw
    }

    /// Number of raw captures currently held.
    pub fn accumulations(&self) -> usize {
        self.raw.len()
    }

    /// Append a raw capture.
    pub fn push_raw(&mut self, spectrum: Spectrum) -> AppResult<()> {
        if self.averaged.is_some() {
            return Err(MappingError::AlreadyAnalysed(self.timestamp));
        }
        self.raw.push(spectrum);
        Ok(())
    }

    /// Averaged spectrum, computed on demand from the raw captures until the
    /// measurement is marked analysed.
    pub fn averaged(&self) -> Option<Spectrum> {
        match &self.averaged {
            Some(spectrum) => Some(spectrum.clone()),
            None => Spectrum::mean(&self.raw),
        }
    }

    /// Whether the raw→averaged transition has happened.
    pub fn is_analysed(&self) -> bool {
        self.averaged.is_some()
    }

    /// Collapse raw captures into the averaged spectrum.
    ///
    /// Happens at most once; later calls are no-ops. A measurement without
    /// raw captures stays unanalysed.
    pub fn mark_analysed(&mut self) {
        if self.averaged.is_some() {
            return;
        }
        if let Some(mean) = Spectrum::mean(&self.raw) {
            self.averaged = Some(mean);
            self.raw.clear();
        }
    }
}

/// Source of monotonically-unique microsecond timestamps.
///
/// Two calls never return the same value even when the wall clock does not
/// advance between them.
#[derive(Debug, Default)]
pub struct TimestampSource {
    last: AtomicI64,
}

impl TimestampSource {
    /// New source starting from the wall clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Next unique timestamp (µs since the Unix epoch).
    pub fn next(&self) -> i64 {
        let now = chrono::Utc::now().timestamp_micros();
        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(last + 1);
            match self
                .last
                .compare_exchange_weak(last, candidate, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return candidate,
                Err(actual) => last = actual,
            }
        }
    }
}
