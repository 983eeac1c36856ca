//! Cache manager behaviour with real results

use chrono::Duration;
use std::sync::Arc;
use std::thread;
use visitlens_cache::{validate, CacheEntry, CacheManager, CacheStore, CacheTier, MemoryCacheStore};
use visitlens_core::{FieldValue, RawVisitBatch};
use visitlens_query::{AnalysisResult, ComputationConfig, Executor, TerminalStage};

const BATCH: &str = r#"[
    {"id": 1, "username": "amina", "status": "approved", "visit_date": "2024-04-02T10:00:00Z",
     "form_json": {"form": {"age": 10, "muac": "11.2"}}},
    {"id": 2, "username": "amina", "status": "approved", "visit_date": "2024-04-01T10:00:00Z",
     "form_json": {"form": {}}},
    {"id": 3, "username": "amina", "status": "pending", "visit_date": "2024-04-03T10:00:00Z",
     "form_json": {"form": {"age": 20, "muac": 12.0}}}
]"#;

fn config() -> ComputationConfig {
    ComputationConfig::from_json(
        r#"{"grouping_key": "username",
            "fields": [
                {"name": "avg_age", "path": "form.age", "aggregation": "avg"},
                {"name": "ages", "path": "form.age", "aggregation": "list"}
            ],
            "histograms": [
                {"name": "muac", "path": "form.muac", "lower_bound": 9.5, "upper_bound": 13.5, "num_bins": 4}
            ]}"#,
    )
    .unwrap()
}

fn computed(dataset: &str) -> AnalysisResult {
    let batch = RawVisitBatch::new(BATCH.as_bytes().to_vec(), false);
    let parsed = batch.parse_full().unwrap();
    let config = config();
    let rows = Executor::new().execute(&config, &parsed.records).unwrap();
    AnalysisResult::new(dataset, &config, 3, parsed.excluded as u64, rows)
}

#[test]
fn test_count_validation_property() {
    let now = chrono::Utc::now();
    let entry = CacheEntry {
        record_count: 50,
        computed_at: now - Duration::minutes(3),
        payload: (),
    };
    assert!(validate(50, &entry, None, now));
    assert!(!validate(51, &entry, None, now));
    assert!(validate(51, &entry, Some(Duration::minutes(15)), now));
}

#[test]
fn test_cached_result_survives_roundtrip() {
    let manager = CacheManager::with_defaults(Arc::new(MemoryCacheStore::new()));
    let result = computed("opp-1");
    manager.put_result(&result).unwrap();

    let cached = manager
        .get_valid_result("opp-1", &config().config_hash(), CacheTier::WorkerResults, 3, None)
        .unwrap()
        .unwrap();
    assert_eq!(cached, result);
    let amina = cached.worker("amina").unwrap();
    assert_eq!(amina.custom_fields["avg_age"], Some(FieldValue::Float(15.0)));
    assert_eq!(
        amina.custom_fields["ages"],
        Some(FieldValue::List(vec![FieldValue::Integer(10), FieldValue::Integer(20)]))
    );
}

#[test]
fn test_backend_identity_not_in_keys() {
    let store = Arc::new(MemoryCacheStore::new());
    let manager = CacheManager::with_defaults(store.clone());
    manager.put_result(&computed("opp-1")).unwrap();

    let keys = store.keys_with_prefix("").unwrap();
    assert_eq!(keys, vec![format!("visitlens:opp-1:workers:{}", config().config_hash())]);
}

#[test]
fn test_concurrent_writers_last_write_wins() {
    let manager = Arc::new(CacheManager::with_defaults(Arc::new(MemoryCacheStore::new())));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let manager = Arc::clone(&manager);
            thread::spawn(move || {
                let result = computed("opp-1");
                manager.put_result(&result).unwrap();
                manager
                    .get_result("opp-1", &result.config_hash, CacheTier::WorkerResults)
                    .unwrap()
                    .is_some()
            })
        })
        .collect();

    for handle in handles {
        assert!(handle.join().unwrap());
    }
    let report = manager.report("opp-1").unwrap();
    assert_eq!(report.entries.len(), 1);
    assert_eq!(report.entries[0].tier, CacheTier::for_stage(TerminalStage::Aggregated));
}
