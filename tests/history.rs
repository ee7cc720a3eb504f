use std::path::PathBuf;

use rusqlite::Connection;
use tbm_monitor::catalog::FEATURE_COUNT;
use tbm_monitor::reconcile::{Batch, Engine, FeatureInput, RawFeatureValue};
use tbm_monitor::storage::HistoryStore;
use tempfile::TempDir;

fn db_path(dir: &TempDir) -> PathBuf {
    dir.path().join("history.sqlite")
}

fn open(dir: &TempDir) -> HistoryStore {
    let mut store = HistoryStore::new(db_path(dir).to_str().unwrap()).unwrap();
    store.init().unwrap();
    store
}

fn count(dir: &TempDir, table: &str) -> i64 {
    let conn = Connection::open(db_path(dir)).unwrap();
    conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
        .unwrap()
}

#[test]
fn records_one_row_per_feature() {
    let dir = TempDir::new().unwrap();
    let mut store = open(&dir);
    let mut engine = Engine::default();

    let mut features = vec![FeatureInput::absent(); FEATURE_COUNT];
    features[0] = FeatureInput::new(RawFeatureValue::Bare(1.0), Some(1.2));
    features[1] = FeatureInput::new(RawFeatureValue::Bare(2.0), Some(2.2));
    let ready = Batch::upstream(features, 6, true);
    let report = engine.reconcile_tick(&ready).unwrap();
    store.record_tick(1_000, &report).unwrap();

    assert_eq!(count(&dir, "observations"), FEATURE_COUNT as i64);
    assert_eq!(count(&dir, "predictions"), 2);
}

#[test]
fn warming_ticks_record_no_predictions() {
    let dir = TempDir::new().unwrap();
    let mut store = open(&dir);
    let mut engine = Engine::default();

    let mut features = vec![FeatureInput::absent(); FEATURE_COUNT];
    features[0] = FeatureInput::new(RawFeatureValue::Bare(1.0), Some(1.2));
    let warming = Batch::upstream(features, 1, false);
    for ts in 0..3 {
        let report = engine.reconcile_tick(&warming).unwrap();
        store.record_tick(ts, &report).unwrap();
    }

    assert_eq!(count(&dir, "observations"), 3 * FEATURE_COUNT as i64);
    assert_eq!(count(&dir, "predictions"), 0);
}

#[test]
fn init_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let mut store = open(&dir);
    store.init().unwrap();
    assert_eq!(count(&dir, "observations"), 0);
}
