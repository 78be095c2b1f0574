//! Autosave pipeline behaviour across queue generations.

use mapping_daq::acquisition::{AutosaveItem, AutosavePipeline, QueueState};
use mapping_daq::measurement::{Measurement, MeasurementMetadata, Spectrum};
use mapping_daq::{Coordinate, MappingUnit};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing_test::traced_test;

fn measurement(timestamp: i64) -> Measurement {
    Measurement::from_capture(
        timestamp,
        50.0,
        Spectrum::new(vec![1.0, 2.0, timestamp as f64]),
        MeasurementMetadata::new(1, 50.0),
    )
    .unwrap()
}

fn item(timestamp: i64) -> AutosaveItem {
    AutosaveItem::new(Coordinate::new(timestamp as f64, 0.0, 0.0), measurement(timestamp))
}

fn unit() -> Arc<MappingUnit> {
    Arc::new(MappingUnit::new("autosave", BTreeMap::new()))
}

#[tokio::test]
async fn order_is_preserved_across_a_restart() {
    let unit = unit();
    let mut pipeline = AutosavePipeline::start(unit.clone(), 16, 8).unwrap();

    pipeline.push(item(1)).await.unwrap();
    pipeline.push(item(2)).await.unwrap();
    pipeline.rotate().await.unwrap();
    pipeline.push(item(3)).await.unwrap();
    let stats = pipeline.finish().await.unwrap();

    assert_eq!(unit.timestamps(), vec![1, 2, 3]);
    assert_eq!(stats.generations, 2);
    assert_eq!(stats.appended, 3);
}

#[tokio::test]
async fn backpressure_restarts_without_losing_items() {
    let unit = unit();
    let mut pipeline = AutosavePipeline::start(unit.clone(), 16, 1).unwrap();

    let mut restarts = 0;
    for ts in 1..=5 {
        if pipeline.relieve().await.unwrap() {
            restarts += 1;
        }
        pipeline.push(item(ts)).await.unwrap();
        pipeline.push(item(ts + 100)).await.unwrap();
    }
    assert!(restarts >= 1);
    assert_eq!(pipeline.restarts(), restarts);

    let stats = pipeline.finish().await.unwrap();
    assert_eq!(stats.enqueued, 10);
    assert_eq!(stats.appended, 10);
    assert_eq!(stats.failed, 0);
    assert_eq!(
        unit.timestamps(),
        vec![1, 101, 2, 102, 3, 103, 4, 104, 5, 105]
    );
}

#[tokio::test]
async fn pushes_are_refused_after_finish_starts() {
    let unit = unit();
    let mut pipeline = AutosavePipeline::start(unit.clone(), 4, 2).unwrap();
    assert_eq!(pipeline.state(), QueueState::Active { generation: 0 });
    assert_eq!(pipeline.generation(), Some(0));

    pipeline.rotate().await.unwrap();
    assert_eq!(pipeline.generation(), Some(1));

    let stats = pipeline.finish().await.unwrap();
    assert_eq!(stats.enqueued, 0);
    assert!(unit.is_empty());
}

#[tokio::test]
async fn queue_full_waits_instead_of_dropping() {
    let unit = unit();
    let pipeline = AutosavePipeline::start(unit.clone(), 2, 1).unwrap();
    for ts in 1..=20 {
        pipeline.push(item(ts)).await.unwrap();
    }
    let stats = pipeline.finish().await.unwrap();
    assert_eq!(stats.appended, 20);
    assert_eq!(unit.len(), 20);
}

#[tokio::test]
#[traced_test]
async fn rejected_items_are_logged_and_skipped() {
    let unit = unit();
    let pipeline = AutosavePipeline::start(unit.clone(), 8, 4).unwrap();

    pipeline.push(item(7)).await.unwrap();
    pipeline.push(item(7)).await.unwrap();

    let mismatched = Measurement::from_capture(
        8,
        50.0,
        Spectrum::new(vec![0.0]),
        MeasurementMetadata::new(4, 50.0),
    )
    .unwrap();
    pipeline
        .push(AutosaveItem::new(Coordinate::default(), mismatched))
        .await
        .unwrap();
    pipeline.push(item(9)).await.unwrap();

    let stats = pipeline.finish().await.unwrap();
    assert_eq!(stats.failed, 2);
    assert_eq!(unit.timestamps(), vec![7, 9]);
    assert!(logs_contain("Skipping measurement that could not be appended"));
}
