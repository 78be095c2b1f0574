//! Delimited-text persistence for coordinate sets.
//!
//! Files carry a `x,y,z` header and one coordinate per row. The set name is
//! taken from the file stem on load.

use super::{Coordinate, CoordinateSet};
use crate::error::AppResult;
use std::path::Path;

/// Write a set to `path`, creating parent directories as needed.
pub fn save_csv(set: &CoordinateSet, path: impl AsRef<Path>) -> AppResult<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)?;
    for coordinate in set.coordinates() {
        writer.serialize(coordinate)?;
    }
    writer.flush()?;
    Ok(())
}

/// Read a set from `path`; the file stem becomes the set name.
pub fn load_csv(path: impl AsRef<Path>) -> AppResult<CoordinateSet> {
    let path = path.as_ref();
    let name = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "coordinates".to_string());
    let mut reader = csv::Reader::from_path(path)?;
    let coordinates = reader
        .deserialize::<Coordinate>()
        .collect::<Result<Vec<_>, _>>()?;
    Ok(CoordinateSet::new(name, coordinates))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn csv_round_trip_keeps_order_and_name() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("area_51.csv");
        let set = CoordinateSet::new(
            "area_51",
            vec![Coordinate::new(2.0, 0.5, -1.0), Coordinate::new(0.0, 0.5, -1.0)],
        );

        save_csv(&set, &path).unwrap();
        let loaded = load_csv(&path).unwrap();

        assert_eq!(loaded, set);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(load_csv(dir.path().join("absent.csv")).is_err());
    }
}
