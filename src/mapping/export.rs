//! Export adapters for finished mapping units.
//!
//! These are plain serialize functions at the store boundary: they take a
//! consistent snapshot of the unit through its read API and write it out.

use super::unit::MappingUnit;
use crate::error::AppResult;
use std::path::Path;

/// Write one row per measurement:
/// `timestamp,x,y,z,accumulations,intensity_0..intensity_N`.
///
/// Rows use the averaged spectrum. The header width follows the longest
/// spectrum; shorter rows are padded with empty cells.
#[cfg(feature = "storage_csv")]
pub fn export_csv(unit: &MappingUnit, path: impl AsRef<Path>) -> AppResult<usize> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let rows = unit.rows();
    let width = rows
        .iter()
        .filter_map(|row| row.averaged.as_ref().map(|s| s.len()))
        .max()
        .unwrap_or(0);

    let mut writer = csv::Writer::from_path(path)?;
    let mut header: Vec<String> = ["timestamp", "x", "y", "z", "accumulations"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    header.extend((0..width).map(|i| format!("intensity_{i}")));
    writer.write_record(&header)?;

    for row in &rows {
        let mut record = vec![
            row.timestamp.to_string(),
            row.coordinate.x.to_string(),
            row.coordinate.y.to_string(),
            row.coordinate.z.to_string(),
            row.raw.len().to_string(),
        ];
        let intensities = row
            .averaged
            .as_ref()
            .map(|s| s.intensities.as_slice())
            .unwrap_or_default();
        record.extend((0..width).map(|i| {
            intensities
                .get(i)
                .map(|v| v.to_string())
                .unwrap_or_default()
        }));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(rows.len())
}

/// Write the unit summary as pretty JSON.
pub fn write_summary_json(unit: &MappingUnit, path: impl AsRef<Path>) -> AppResult<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(&unit.summary())?;
    std::fs::write(path, json)?;
    Ok(())
}
