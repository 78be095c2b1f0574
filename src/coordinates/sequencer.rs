//! Coordinate Sequencer
//!
//! Turns a raw coordinate set into the order in which the stage visits it.
//! Every function here is pure: it takes a set (or a list of units) and a
//! policy and returns a new value.
//!
//! # Ordering
//!
//! Coordinates are grouped into lines by the *non-scan* axis. For
//! [`ScanAxis::XMajor`] the stage sweeps along x, so points sharing a y value
//! form one line. Group keys are rounded to [`GROUP_PRECISION`] decimals so
//! floating noise from generated grids does not split a line.
//!
//! ```text
//! raster:  1 2 3        snake:  1 2 3
//!          4 5 6                6 5 4
//!          7 8 9                7 8 9
//! ```
//!
//! # Continuous mode
//!
//! [`line_endpoints`] keeps only the first and last point of each line; the
//! continuous driver moves between them without stopping while the
//! spectrometer streams.
//!
//! # Scramble
//!
//! [`scramble`] optionally shuffles the top-level units (points in discrete
//! mode, line pairs in continuous mode) and then applies [`jump_remap`],
//! which interleaves the sequence by stride so that an early abort still
//! leaves a spatially spread sample.

use super::{Coordinate, CoordinateSet};
use crate::error::{AppResult, MappingError};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Decimal places kept when grouping coordinates into lines.
pub const GROUP_PRECISION: i32 = 6;

/// Traversal method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScanMethod {
    /// Every line in the same direction
    #[default]
    Raster,
    /// Alternate line direction to minimise return travel
    Snake,
}

impl FromStr for ScanMethod {
    type Err = MappingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "raster" => Ok(ScanMethod::Raster),
            "snake" => Ok(ScanMethod::Snake),
            other => Err(MappingError::Configuration(format!(
                "Unknown scan method '{other}'. Must be one of: raster, snake"
            ))),
        }
    }
}

impl fmt::Display for ScanMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanMethod::Raster => write!(f, "raster"),
            ScanMethod::Snake => write!(f, "snake"),
        }
    }
}

/// Fast (scan) axis of the traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScanAxis {
    /// Sweep along x; lines share a y value
    #[default]
    XMajor,
    /// Sweep along y; lines share an x value
    YMajor,
}

impl ScanAxis {
    /// Position along the sweep direction.
    fn scan_value(self, c: &Coordinate) -> f64 {
        match self {
            ScanAxis::XMajor => c.x,
            ScanAxis::YMajor => c.y,
        }
    }

    /// Position along the grouping (line-selecting) direction.
    fn group_value(self, c: &Coordinate) -> f64 {
        match self {
            ScanAxis::XMajor => c.y,
            ScanAxis::YMajor => c.x,
        }
    }
}

impl FromStr for ScanAxis {
    type Err = MappingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "x_major" | "x" => Ok(ScanAxis::XMajor),
            "y_major" | "y" => Ok(ScanAxis::YMajor),
            other => Err(MappingError::Configuration(format!(
                "Unknown scan axis '{other}'. Must be one of: x_major, y_major"
            ))),
        }
    }
}

impl fmt::Display for ScanAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanAxis::XMajor => write!(f, "x_major"),
            ScanAxis::YMajor => write!(f, "y_major"),
        }
    }
}

/// Optional reordering applied after the geometric order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Scramble {
    /// Randomly shuffle the units
    #[serde(default)]
    pub shuffle: bool,
    /// Stride interleave: stride = `jump + 1`, 0 disables
    #[serde(default)]
    pub jump: usize,
    /// RNG seed for reproducible shuffles
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Scramble {
    /// Whether this scramble changes anything.
    pub fn is_identity(&self) -> bool {
        !self.shuffle && self.jump == 0
    }
}

/// Complete traversal policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ScanOrderPolicy {
    /// Raster or snake
    #[serde(default)]
    pub method: ScanMethod,
    /// Fast axis
    #[serde(default)]
    pub axis: ScanAxis,
    /// Shuffle/jump options
    #[serde(default)]
    pub scramble: Scramble,
}

impl ScanOrderPolicy {
    /// Policy without scramble.
    pub fn new(method: ScanMethod, axis: ScanAxis) -> Self {
        Self {
            method,
            axis,
            scramble: Scramble::default(),
        }
    }

    /// Parse method and axis names; unknown names are configuration errors.
    pub fn parse(method: &str, axis: &str) -> AppResult<Self> {
        Ok(Self::new(method.parse()?, axis.parse()?))
    }

    /// Builder-style scramble.
    pub fn with_scramble(mut self, scramble: Scramble) -> Self {
        self.scramble = scramble;
        self
    }
}

fn group_key(value: f64) -> i64 {
    let scale = 10f64.powi(GROUP_PRECISION);
    (value * scale).round() as i64
}

/// Split coordinates into lines keyed by the rounded grouping-axis value,
/// sorted ascending. Members keep arrival order.
fn group_lines(coordinates: &[Coordinate], axis: ScanAxis) -> Vec<Vec<Coordinate>> {
    let mut groups: BTreeMap<i64, Vec<Coordinate>> = BTreeMap::new();
    for c in coordinates {
        groups
            .entry(group_key(axis.group_value(c)))
            .or_default()
            .push(*c);
    }
    groups.into_values().collect()
}

/// Lines in traversal order with their members in traversal order.
fn ordered_lines(coordinates: &[Coordinate], policy: &ScanOrderPolicy) -> Vec<Vec<Coordinate>> {
    let mut lines = group_lines(coordinates, policy.axis);
    if policy.method == ScanMethod::Snake {
        for (index, line) in lines.iter_mut().enumerate() {
            // Direction is a function of position, not arrival order, so
            // re-ordering an already snaked set is stable.
            line.sort_by(|a, b| policy.axis.scan_value(a).total_cmp(&policy.axis.scan_value(b)));
            if index % 2 == 1 {
                line.reverse();
            }
        }
    }
    lines
}

/// Geometric traversal order of a set. Scramble is not applied here.
pub fn order(set: &CoordinateSet, policy: &ScanOrderPolicy) -> CoordinateSet {
    let ordered = ordered_lines(set.coordinates(), policy)
        .into_iter()
        .flatten()
        .collect();
    CoordinateSet::new(set.name(), ordered)
}

/// First and last coordinate of each line, lines sorted by grouping axis.
///
/// Always returns pairs: a line with a single point yields that point twice.
pub fn line_endpoints(set: &CoordinateSet, policy: &ScanOrderPolicy) -> CoordinateSet {
    let endpoints = group_lines(set.coordinates(), policy.axis)
        .into_iter()
        .filter_map(|line| Some([*line.first()?, *line.last()?]))
        .flatten()
        .collect();
    CoordinateSet::new(set.name(), endpoints)
}

/// Stride interleave with stride `jump + 1`.
///
/// `[0, 1, 2, 3, 4, 5]` with jump 1 becomes `[0, 2, 4, 1, 3, 5]`. A stride of
/// at least the sequence length leaves the order unchanged.
pub fn jump_remap<T>(items: Vec<T>, jump: usize) -> Vec<T> {
    let stride = jump.saturating_add(1);
    let len = items.len();
    if stride <= 1 || stride >= len {
        return items;
    }
    let mut slots: Vec<Option<T>> = items.into_iter().map(Some).collect();
    let mut remapped = Vec::with_capacity(len);
    for offset in 0..stride {
        for index in (offset..len).step_by(stride) {
            if let Some(item) = slots[index].take() {
                remapped.push(item);
            }
        }
    }
    remapped
}

/// Apply shuffle then jump to a list of top-level units.
pub fn scramble<T>(mut units: Vec<T>, options: &Scramble) -> Vec<T> {
    if options.shuffle {
        let mut rng = match options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        units.shuffle(&mut rng);
    }
    jump_remap(units, options.jump)
}

/// Entry points combining ordering and scramble for each scan mode.
pub struct Sequencer;

impl Sequencer {
    /// Discrete-mode sequence: geometric order, then scramble of single points.
    pub fn discrete(set: &CoordinateSet, policy: &ScanOrderPolicy) -> CoordinateSet {
        let ordered = order(set, policy).into_coordinates();
        CoordinateSet::new(set.name(), scramble(ordered, &policy.scramble))
    }

    /// Continuous-mode sequence: line endpoints in traversal direction, then
    /// scramble of whole line pairs. Pairs are never split.
    pub fn continuous(set: &CoordinateSet, policy: &ScanOrderPolicy) -> CoordinateSet {
        let pairs: Vec<[Coordinate; 2]> = ordered_lines(set.coordinates(), policy)
            .into_iter()
            .filter_map(|line| Some([*line.first()?, *line.last()?]))
            .collect();
        let endpoints = scramble(pairs, &policy.scramble)
            .into_iter()
            .flatten()
            .collect();
        CoordinateSet::new(set.name(), endpoints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid3() -> CoordinateSet {
        CoordinateSet::grid("g", 3, 3, 1.0, Coordinate::default())
    }

    fn xs(set: &CoordinateSet) -> Vec<f64> {
        set.coordinates().iter().map(|c| c.x).collect()
    }

    #[test]
    fn unknown_method_or_axis_is_configuration_error() {
        assert!(matches!(
            ScanOrderPolicy::parse("spiral", "x_major"),
            Err(MappingError::Configuration(_))
        ));
        assert!(matches!(
            ScanOrderPolicy::parse("raster", "diagonal"),
            Err(MappingError::Configuration(_))
        ));
        let policy = ScanOrderPolicy::parse("Snake", "y-major").unwrap();
        assert_eq!(policy.method, ScanMethod::Snake);
        assert_eq!(policy.axis, ScanAxis::YMajor);
    }

    #[test]
    fn empty_input_is_empty_output() {
        let empty = CoordinateSet::new("e", vec![]);
        let policy = ScanOrderPolicy::new(ScanMethod::Snake, ScanAxis::XMajor);
        assert!(order(&empty, &policy).is_empty());
        assert!(line_endpoints(&empty, &policy).is_empty());
        assert!(Sequencer::continuous(&empty, &policy).is_empty());
    }

    #[test]
    fn raster_groups_by_rounded_non_scan_axis() {
        let noisy = CoordinateSet::new(
            "n",
            vec![
                Coordinate::new(0.0, 1.0 + 1e-9, 0.0),
                Coordinate::new(1.0, 0.0, 0.0),
                Coordinate::new(1.0, 1.0, 0.0),
                Coordinate::new(0.0, 0.0, 0.0),
            ],
        );
        let ordered = order(&noisy, &ScanOrderPolicy::default());
        let ys: Vec<f64> = ordered.coordinates().iter().map(|c| c.y.round()).collect();
        assert_eq!(ys, vec![0.0, 0.0, 1.0, 1.0]);
        // arrival order inside each line
        assert_eq!(xs(&ordered), vec![1.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn y_major_groups_by_x() {
        let policy = ScanOrderPolicy::new(ScanMethod::Raster, ScanAxis::YMajor);
        let ordered = order(&grid3(), &policy);
        assert_eq!(xs(&ordered), vec![0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 2.0, 2.0, 2.0]);
    }

    #[test]
    fn endpoints_emit_single_point_lines_twice() {
        let set = CoordinateSet::new(
            "s",
            vec![Coordinate::new(0.0, 0.0, 0.0), Coordinate::new(5.0, 1.0, 0.0)],
        );
        let endpoints = line_endpoints(&set, &ScanOrderPolicy::default());
        assert_eq!(endpoints.len(), 4);
        assert_eq!(endpoints.coordinates()[2], endpoints.coordinates()[3]);
    }

    #[test]
    fn jump_remap_edge_cases() {
        assert_eq!(jump_remap(vec![0, 1, 2], 0), vec![0, 1, 2]);
        assert_eq!(jump_remap(vec![0, 1, 2], 2), vec![0, 1, 2]);
        assert_eq!(jump_remap(vec![0, 1, 2, 3, 4], 2), vec![0, 3, 1, 4, 2]);
        assert!(jump_remap(Vec::<u8>::new(), 3).is_empty());
    }

    #[test]
    fn seeded_shuffle_is_reproducible() {
        let options = Scramble {
            shuffle: true,
            jump: 0,
            seed: Some(7),
        };
        let a = scramble((0..20).collect::<Vec<_>>(), &options);
        let b = scramble((0..20).collect::<Vec<_>>(), &options);
        assert_eq!(a, b);
        let mut sorted = a.clone();
        sorted.sort();
        assert_eq!(sorted, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn continuous_scramble_keeps_pairs_together() {
        let policy = ScanOrderPolicy::new(ScanMethod::Snake, ScanAxis::XMajor).with_scramble(Scramble {
            shuffle: true,
            jump: 1,
            seed: Some(3),
        });
        let set = CoordinateSet::grid("g", 4, 6, 1.0, Coordinate::default());
        let endpoints = Sequencer::continuous(&set, &policy);
        assert_eq!(endpoints.len(), 12);
        for pair in endpoints.coordinates().chunks(2) {
            assert_eq!(pair[0].y, pair[1].y);
            assert_ne!(pair[0].x, pair[1].x);
        }
    }

    #[test]
    fn continuous_snake_alternates_direction() {
        let policy = ScanOrderPolicy::new(ScanMethod::Snake, ScanAxis::XMajor);
        let endpoints = Sequencer::continuous(&grid3(), &policy);
        assert_eq!(xs(&endpoints), vec![0.0, 2.0, 2.0, 0.0, 0.0, 2.0]);
    }
}
