//! Sampling coordinates and the named-set hub.
//!
//! A [`CoordinateSet`] is an ordered, named list of stage positions. Sets are
//! never reordered in place: the sequencer always returns a new set, so a
//! scan driver iterating one set can never observe it changing underneath.
//!
//! The [`CoordinateHub`] owns every named set in the session. Checkpoints
//! overwrite a single named set through [`CoordinateHub::upsert`]; abort
//! remainders are inserted under a fresh, collision-free name obtained from
//! [`CoordinateHub::unique_name`].

pub mod sequencer;

#[cfg(feature = "storage_csv")]
pub mod io;

use crate::error::{AppResult, MappingError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A stage position in real-world length units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Coordinate {
    /// X position
    pub x: f64,
    /// Y position
    pub y: f64,
    /// Z position
    pub z: f64,
}

impl Coordinate {
    /// Create a coordinate.
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Euclidean distance to another coordinate.
    pub fn distance(&self, other: &Coordinate) -> f64 {
        let (dx, dy, dz) = (self.x - other.x, self.y - other.y, self.z - other.z);
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    /// Linear interpolation between `self` (t = 0) and `other` (t = 1).
    pub fn lerp(&self, other: &Coordinate, t: f64) -> Coordinate {
        Coordinate {
            x: self.x + (other.x - self.x) * t,
            y: self.y + (other.y - self.y) * t,
            z: self.z + (other.z - self.z) * t,
        }
    }
}

impl From<(f64, f64, f64)> for Coordinate {
    fn from((x, y, z): (f64, f64, f64)) -> Self {
        Self { x, y, z }
    }
}

/// A named, ordered sequence of coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinateSet {
    name: String,
    coordinates: Vec<Coordinate>,
}

impl CoordinateSet {
    /// Create a set from coordinates in visitation order.
    pub fn new(name: impl Into<String>, coordinates: Vec<Coordinate>) -> Self {
        Self {
            name: name.into(),
            coordinates,
        }
    }

    /// Rectangular `nx` × `ny` grid starting at `origin`, row by row along x.
    pub fn grid(name: impl Into<String>, nx: usize, ny: usize, step: f64, origin: Coordinate) -> Self {
        let coordinates = (0..ny)
            .flat_map(|j| {
                (0..nx).map(move |i| {
                    Coordinate::new(
                        origin.x + i as f64 * step,
                        origin.y + j as f64 * step,
                        origin.z,
                    )
                })
            })
            .collect();
        Self::new(name, coordinates)
    }

    /// Set name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Coordinates in order.
    pub fn coordinates(&self) -> &[Coordinate] {
        &self.coordinates
    }

    /// Number of coordinates.
    pub fn len(&self) -> usize {
        self.coordinates.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.coordinates.is_empty()
    }

    /// Same coordinates under a different name.
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self::new(name, self.coordinates.clone())
    }

    /// New set holding `coordinates[start..]` (empty when `start >= len`).
    pub fn tail(&self, start: usize, name: impl Into<String>) -> Self {
        let rest = self.coordinates.get(start..).unwrap_or_default().to_vec();
        Self::new(name, rest)
    }

    /// Consume the set, returning its coordinates.
    pub fn into_coordinates(self) -> Vec<Coordinate> {
        self.coordinates
    }
}

/// Thread-safe registry of named coordinate sets.
#[derive(Debug, Default)]
pub struct CoordinateHub {
    sets: RwLock<BTreeMap<String, Arc<CoordinateSet>>>,
}

impl CoordinateHub {
    /// Empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new set; the name must be unused.
    pub fn insert(&self, set: CoordinateSet) -> AppResult<Arc<CoordinateSet>> {
        let mut sets = self.sets.write();
        if sets.contains_key(set.name()) {
            return Err(MappingError::DuplicateCoordinateSet(set.name().to_string()));
        }
        let set = Arc::new(set);
        sets.insert(set.name().to_string(), set.clone());
        Ok(set)
    }

    /// Insert or overwrite a set under its name.
    pub fn upsert(&self, set: CoordinateSet) -> Arc<CoordinateSet> {
        let set = Arc::new(set);
        self.sets.write().insert(set.name().to_string(), set.clone());
        set
    }

    /// Look up a set by name.
    pub fn get(&self, name: &str) -> Option<Arc<CoordinateSet>> {
        self.sets.read().get(name).cloned()
    }

    /// Remove a set, returning it if it existed.
    pub fn remove(&self, name: &str) -> Option<Arc<CoordinateSet>> {
        self.sets.write().remove(name)
    }

    /// Whether a set with this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.sets.read().contains_key(name)
    }

    /// All set names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.sets.read().keys().cloned().collect()
    }

    /// Number of sets held.
    pub fn len(&self) -> usize {
        self.sets.read().len()
    }

    /// Whether the hub is empty.
    pub fn is_empty(&self) -> bool {
        self.sets.read().is_empty()
    }

    /// A name derived from `base` that no set currently uses.
    ///
    /// The suffix is a fresh wall-clock timestamp; a counter is appended in
    /// the unlikely case two names are requested within the same second.
    pub fn unique_name(&self, base: &str) -> String {
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
        let sets = self.sets.read();
        let candidate = format!("{base}_{stamp}");
        if !sets.contains_key(&candidate) {
            return candidate;
        }
        (1..)
            .map(|n| format!("{candidate}_{n}"))
            .find(|name| !sets.contains_key(name))
            .unwrap_or(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_is_row_major() {
        let grid = CoordinateSet::grid("g", 3, 2, 1.0, Coordinate::default());
        assert_eq!(grid.len(), 6);
        assert_eq!(grid.coordinates()[1], Coordinate::new(1.0, 0.0, 0.0));
        assert_eq!(grid.coordinates()[3], Coordinate::new(0.0, 1.0, 0.0));
    }

    #[test]
    fn tail_past_end_is_empty() {
        let grid = CoordinateSet::grid("g", 2, 2, 1.0, Coordinate::default());
        assert_eq!(grid.tail(1, "rest").len(), 3);
        assert!(grid.tail(10, "rest").is_empty());
    }

    #[test]
    fn hub_enforces_unique_names_but_upsert_overwrites() {
        let hub = CoordinateHub::new();
        hub.insert(CoordinateSet::new("a", vec![Coordinate::default()]))
            .unwrap();
        assert!(matches!(
            hub.insert(CoordinateSet::new("a", vec![])),
            Err(MappingError::DuplicateCoordinateSet(_))
        ));

        hub.upsert(CoordinateSet::new("a", vec![]));
        assert!(hub.get("a").unwrap().is_empty());
        assert_eq!(hub.len(), 1);
    }

    #[test]
    fn unique_name_avoids_collisions() {
        let hub = CoordinateHub::new();
        let first = hub.unique_name("map_remaining");
        hub.insert(CoordinateSet::new(first.clone(), vec![])).unwrap();
        let second = hub.unique_name("map_remaining");
        assert_ne!(first, second);
        assert!(second.starts_with("map_remaining_"));
    }

    #[test]
    fn lerp_midpoint() {
        let a = Coordinate::new(0.0, 0.0, 0.0);
        let b = Coordinate::new(2.0, 4.0, 6.0);
        assert_eq!(a.lerp(&b, 0.5), Coordinate::new(1.0, 2.0, 3.0));
        assert!((a.distance(&b) - 56f64.sqrt()).abs() < 1e-12);
    }
}
