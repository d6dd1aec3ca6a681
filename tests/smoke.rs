//! Workspace smoke test: the facade crate alone is enough to run the
//! full write → flush → restart → read cycle.

use tempfile::TempDir;
use tephra::{Labels, Storage, StorageConfig, StorageEngine, TimeSeries};

#[test]
fn test_quick_start_cycle() {
    let dir = TempDir::new().unwrap();
    let config = StorageConfig::for_testing(dir.path());

    let labels = Labels::from_pairs([("metric", "cpu"), ("host", "a")]).unwrap();

    {
        let engine = StorageEngine::open(&config).unwrap();
        let mut series = TimeSeries::new(labels.clone());
        series.push(1000, 0.42).unwrap();
        engine.write(&series).unwrap();
        engine.flush().unwrap();
        engine.close().unwrap();
    }

    let engine = StorageEngine::open(&config).unwrap();
    let got = engine.read(&labels, 0, i64::MAX).unwrap().unwrap();
    assert_eq!(got.samples().len(), 1);
    assert_eq!(got.samples()[0].value, 0.42);
    engine.close().unwrap();
}
