//! Discrete scans against mock hardware with injected faults.

use mapping_daq::acquisition::{DriverState, ScanOutcome};
use mapping_daq::hardware::mock::{FaultConfig, FaultScenario, MockMode, MockSpectrometer, MockStage};
use mapping_daq::{
    Coordinate, CoordinateHub, CoordinateSet, DiscreteScanDriver, MappingConfig, MappingError,
    MappingHub, ScanAxis, ScanMethod, ScanOrderPolicy, Sequencer,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

fn fast_config() -> MappingConfig {
    let mut config = MappingConfig::default();
    config.acquisition.motion_timeout_ms = 200;
    config.acquisition.capture_timeout_ms = 200;
    config.acquisition.checkpoint_cadence_discrete = 2;
    config
}

fn snake(nx: usize, ny: usize) -> CoordinateSet {
    let policy = ScanOrderPolicy::new(ScanMethod::Snake, ScanAxis::XMajor);
    Sequencer::discrete(
        &CoordinateSet::grid("grid", nx, ny, 0.5, Coordinate::default()),
        &policy,
    )
}

#[tokio::test]
async fn full_scan_stores_one_row_per_point_in_visit_order() {
    let units = MappingHub::new();
    let unit = units.create_unit("map", BTreeMap::new()).unwrap();
    let driver = DiscreteScanDriver::new(
        Arc::new(MockStage::new()),
        Arc::new(MockSpectrometer::builder().metadata("objective", "50x").build()),
        &fast_config(),
    )
    .unwrap();
    let mut progress = driver.progress();
    let coordinates = snake(4, 3);

    let report = driver
        .run(unit.clone(), &coordinates, Arc::new(CoordinateHub::new()))
        .await
        .unwrap();

    assert!(report.is_complete());
    assert_eq!(report.visited, 12);
    assert_eq!(report.appended, 12);
    assert!(report.checkpoints_written >= 1);
    assert!(report.remainder.is_none());

    let stored: Vec<Coordinate> = unit.rows().iter().map(|r| r.coordinate).collect();
    assert_eq!(stored, coordinates.coordinates());

    let timestamps = unit.timestamps();
    assert!(timestamps.windows(2).all(|w| w[0] < w[1]));

    let metadata = unit.metadata().unwrap();
    assert_eq!(metadata.measurement.extra.get("objective").map(String::as_str), Some("50x"));

    let last = progress.borrow_and_update().clone();
    assert_eq!(last.visited, 12);
    assert_eq!(last.state, DriverState::Done);
    assert_eq!(last.fraction(), 1.0);
    assert!(last.mean_point.is_some());
}

#[tokio::test]
async fn unconfirmed_motion_is_flagged_and_failed_capture_is_skipped() {
    let stage = Arc::new(
        MockStage::builder()
            .faults(FaultConfig::scenario(FaultScenario::Unconfirmed {
                operation: "move_to",
                calls: vec![2, 3],
            }))
            .build(),
    );
    let spectrometer = Arc::new(
        MockSpectrometer::builder()
            .faults(FaultConfig::scenario(FaultScenario::FailCalls {
                operation: "capture",
                calls: vec![3, 4],
            }))
            .build(),
    );
    let driver = DiscreteScanDriver::new(stage.clone(), spectrometer.clone(), &fast_config()).unwrap();
    let unit = Arc::new(mapping_daq::MappingUnit::new("faults", BTreeMap::new()));
    let coordinates = CoordinateSet::grid("line", 5, 1, 1.0, Coordinate::default());

    let report = driver
        .run(unit.clone(), &coordinates, Arc::new(CoordinateHub::new()))
        .await
        .unwrap();

    assert_eq!(report.outcome, ScanOutcome::Done);
    assert_eq!(report.flagged_points, vec![1]);
    assert_eq!(report.skipped_points, vec![2]);
    assert_eq!(report.visited, 5);
    assert_eq!(report.appended, 4);
    assert_eq!(stage.faults().calls("move_to"), 6);
    assert_eq!(spectrometer.faults().calls("capture"), 6);

    // the flagged point is still measured; the skipped one is not
    let xs: Vec<f64> = unit.rows().iter().map(|r| r.coordinate.x).collect();
    assert_eq!(xs, vec![0.0, 1.0, 3.0, 4.0]);
}

#[tokio::test]
async fn hanging_capture_is_retried_once() {
    let stage = Arc::new(MockStage::new());
    let spectrometer = Arc::new(
        MockSpectrometer::builder()
            .faults(FaultConfig::scenario(FaultScenario::Timeout {
                operation: "capture",
                calls: vec![1],
            }))
            .build(),
    );
    let driver = DiscreteScanDriver::new(stage.clone(), spectrometer, &fast_config()).unwrap();
    let unit = Arc::new(mapping_daq::MappingUnit::new("hang", BTreeMap::new()));

    let report = driver
        .run(
            unit.clone(),
            &CoordinateSet::grid("g", 2, 1, 1.0, Coordinate::default()),
            Arc::new(CoordinateHub::new()),
        )
        .await
        .unwrap();

    // capture 1 hangs and times out, the retry succeeds
    assert!(report.skipped_points.is_empty());
    assert_eq!(unit.len(), 2);
    assert_eq!(stage.move_count(), 2);
}

#[tokio::test]
async fn second_run_on_a_busy_driver_is_refused() {
    let stage = Arc::new(MockStage::builder().mode(MockMode::Timed).velocity(10.0).build());
    let driver = Arc::new(
        DiscreteScanDriver::new(stage, Arc::new(MockSpectrometer::new()), &fast_config()).unwrap(),
    );
    let control = driver.control();
    let hub = Arc::new(CoordinateHub::new());
    let coordinates = CoordinateSet::grid("slow", 10, 1, 1.0, Coordinate::default());

    let first = {
        let driver = driver.clone();
        let hub = hub.clone();
        let unit = Arc::new(mapping_daq::MappingUnit::new("first", BTreeMap::new()));
        let coordinates = coordinates.clone();
        tokio::spawn(async move { driver.run(unit, &coordinates, hub).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(driver.state(), DriverState::Running);

    let second = driver
        .run(
            Arc::new(mapping_daq::MappingUnit::new("second", BTreeMap::new())),
            &coordinates,
            hub.clone(),
        )
        .await;
    assert!(matches!(second, Err(MappingError::ScanInProgress)));

    control.abort();
    let report = first.await.unwrap().unwrap();
    assert_eq!(report.outcome, ScanOutcome::Aborted);
    assert!(report.visited < 10);
    assert_eq!(driver.state(), DriverState::Aborted);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn backpressure_restart_keeps_every_point() {
    let mut config = fast_config();
    config.acquisition.buffer_threshold = 4;
    config.acquisition.queue_capacity = 64;
    config.acquisition.checkpoint_cadence_discrete = 0;
    let driver = DiscreteScanDriver::new(
        Arc::new(MockStage::new()),
        Arc::new(MockSpectrometer::new()),
        &config,
    )
    .unwrap();
    let unit = Arc::new(mapping_daq::MappingUnit::new("stalled", BTreeMap::new()));
    let coordinates = snake(5, 4);

    // Park the only runtime worker so the autosave task cannot run while
    // the scan, driven from the test thread, fills the queue.
    let (started_tx, started_rx) = std::sync::mpsc::channel();
    let stall = tokio::spawn(async move {
        started_tx.send(()).unwrap();
        std::thread::sleep(Duration::from_millis(200));
    });
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let report = driver
        .run(unit.clone(), &coordinates, Arc::new(CoordinateHub::new()))
        .await
        .unwrap();
    stall.await.unwrap();

    assert_eq!(report.outcome, ScanOutcome::Done);
    assert!(report.queue_restarts >= 1);
    assert_eq!(report.enqueued, 20);
    assert_eq!(report.appended, 20);
    assert_eq!(unit.len(), report.enqueued);

    let stored: Vec<Coordinate> = unit.rows().iter().map(|r| r.coordinate).collect();
    assert_eq!(stored, coordinates.coordinates());
    assert!(unit.timestamps().windows(2).all(|w| w[0] < w[1]));
}
