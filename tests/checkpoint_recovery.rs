//! Abort, remainder persistence and resumption of discrete scans.

use mapping_daq::acquisition::checkpoint::checkpoint_name;
use mapping_daq::acquisition::{DriverState, ScanOutcome};
use mapping_daq::coordinates::io::load_csv;
use mapping_daq::hardware::mock::{MockSpectrometer, MockStage};
use mapping_daq::{
    Coordinate, CoordinateHub, CoordinateSet, DiscreteScanDriver, MappingConfig, MappingHub,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

const POINTS: usize = 10;

fn config(checkpoint_dir: &Path) -> MappingConfig {
    let mut config = MappingConfig::default();
    config.acquisition.checkpoint_cadence_discrete = 2;
    config.storage.checkpoint_dir = Some(checkpoint_dir.to_path_buf());
    config
}

fn coordinates() -> CoordinateSet {
    CoordinateSet::grid("strip", POINTS, 1, 0.25, Coordinate::new(1.0, 2.0, 0.0))
}

fn driver(config: &MappingConfig) -> DiscreteScanDriver {
    DiscreteScanDriver::new(
        Arc::new(MockStage::new()),
        Arc::new(MockSpectrometer::new()),
        config,
    )
    .unwrap()
}

/// Abort `driver` once `points` points were visited.
fn abort_after(driver: &DiscreteScanDriver, points: usize) -> tokio::task::JoinHandle<()> {
    let control = driver.control();
    let mut progress = driver.progress();
    tokio::spawn(async move {
        while progress.borrow_and_update().visited < points {
            if progress.changed().await.is_err() {
                return;
            }
        }
        control.abort();
    })
}

#[tokio::test]
async fn abort_keeps_visited_points_and_stores_the_rest() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    let driver = driver(&config);
    let units = MappingHub::new();
    let unit = units.create_unit("strip", BTreeMap::new()).unwrap();
    let hub = Arc::new(CoordinateHub::new());
    let coordinates = coordinates();

    let watcher = abort_after(&driver, 4);
    let report = driver.run(unit.clone(), &coordinates, hub.clone()).await.unwrap();
    watcher.await.unwrap();

    assert_eq!(report.outcome, ScanOutcome::Aborted);
    assert_eq!(driver.state(), DriverState::Aborted);
    assert_eq!(report.visited, 4);
    assert_eq!(report.appended, 4);
    assert_eq!(unit.len(), 4);
    assert!(unit.is_complete());
    assert_eq!(report.checkpoints_written, 2);

    // the periodic checkpoint is gone, in memory and on disk
    let checkpoint = checkpoint_name("strip");
    assert!(!hub.contains(&checkpoint));
    assert!(!dir.path().join(format!("{checkpoint}.csv")).exists());
    assert!(!dir.path().join(format!("{checkpoint}.json")).exists());

    let name = report.remainder.clone().unwrap();
    assert!(name.starts_with("strip_remaining_"));
    let remainder = hub.get(&name).unwrap();
    assert_eq!(remainder.len(), POINTS - 4);
    assert_eq!(remainder.coordinates(), &coordinates.coordinates()[4..]);

    let on_disk = load_csv(dir.path().join(format!("{name}.csv"))).unwrap();
    assert_eq!(on_disk.name(), name);
    assert_eq!(on_disk.len(), POINTS - 4);
    for (a, b) in on_disk.coordinates().iter().zip(remainder.coordinates()) {
        assert!(a.distance(b) < 1e-9);
    }
}

#[tokio::test]
async fn resuming_from_the_remainder_completes_the_map() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    let driver = driver(&config);
    let units = MappingHub::new();
    let hub = Arc::new(CoordinateHub::new());
    let coordinates = coordinates();

    let first = units.create_unit("strip", BTreeMap::new()).unwrap();
    let watcher = abort_after(&driver, 3);
    let aborted = driver.run(first.clone(), &coordinates, hub.clone()).await.unwrap();
    watcher.await.unwrap();
    assert_eq!(aborted.visited, 3);

    let remainder = load_csv(
        dir.path()
            .join(format!("{}.csv", aborted.remainder.as_deref().unwrap())),
    )
    .unwrap();

    // same driver; an aborted driver may begin again
    let second = units.create_unit(units.unique_name("strip"), BTreeMap::new()).unwrap();
    assert_eq!(second.unit_name(), "strip_1");
    let resumed = driver.run(second.clone(), &remainder, hub.clone()).await.unwrap();

    assert_eq!(resumed.outcome, ScanOutcome::Done);
    assert!(resumed.remainder.is_none());
    assert_eq!(first.len() + second.len(), POINTS);

    let mut visited: Vec<f64> = first
        .rows()
        .iter()
        .chain(second.rows().iter())
        .map(|r| r.coordinate.x)
        .collect();
    visited.sort_by(f64::total_cmp);
    let mut expected: Vec<f64> = coordinates.coordinates().iter().map(|c| c.x).collect();
    expected.sort_by(f64::total_cmp);
    for (a, b) in visited.iter().zip(&expected) {
        assert!((a - b).abs() < 1e-9);
    }
}
