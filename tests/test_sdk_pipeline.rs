// End-to-end pipeline tests wiring real storage, the evaluator, the
// recorders, and the synchronizer's instant-update path together (no network
// involved; the HTTP layer is constructed but never exercised).

use std::sync::Arc;

use flagstream_sdk::api::{HttpClient, RecordingApi, SplitsApi};
use flagstream_sdk::evaluator::Evaluator;
use flagstream_sdk::hashing::HashAlgorithm;
use flagstream_sdk::impressions::ImpressionsManager;
use flagstream_sdk::recorder::ImpressionsRecorder;
use flagstream_sdk::settings::{ImpressionsMode, Settings};
use flagstream_sdk::splitter;
use flagstream_sdk::storage::{
    InMemorySegmentStorage, InMemorySplitStorage, SegmentStorage, SplitStorage,
};
use flagstream_sdk::synchronizer::SplitSynchronizer;
use flagstream_sdk::telemetry::TelemetryStorage;
use flagstream_sdk::types::events::Impression;
use flagstream_sdk::types::flag::{FeatureFlag, SplitDto};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn flag_from_json(raw: serde_json::Value) -> FeatureFlag {
    let dto: SplitDto = serde_json::from_value(raw).unwrap();
    FeatureFlag::from_dto(dto).unwrap()
}

fn rollout_flag(name: &str, seed: i64, change_number: i64) -> FeatureFlag {
    flag_from_json(serde_json::json!({
        "name": name,
        "trafficTypeName": "user",
        "seed": seed,
        "trafficAllocation": 100,
        "trafficAllocationSeed": seed,
        "status": "ACTIVE",
        "killed": false,
        "defaultTreatment": "off",
        "changeNumber": change_number,
        "algo": 2,
        "conditions": [{
            "conditionType": "ROLLOUT",
            "matcherGroup": {
                "combiner": "AND",
                "matchers": [{"matcherType": "ALL_KEYS", "negate": false}]
            },
            "partitions": [
                {"treatment": "on", "size": 60},
                {"treatment": "off", "size": 40}
            ],
            "label": "default rule"
        }]
    }))
}

fn stores() -> (Arc<InMemorySplitStorage>, Arc<InMemorySegmentStorage>) {
    (Arc::new(InMemorySplitStorage::new()), Arc::new(InMemorySegmentStorage::new()))
}

#[test]
fn test_basic_rollout_scenario() {
    init_logs();
    let (splits, segments) = stores();
    splits.put(rollout_flag("demo", 123, 1001));
    let evaluator = Evaluator::new(splits.clone(), segments);

    // Treatment must agree with the bucket the splitter computes.
    let bucket = splitter::bucket("user-42", 123, HashAlgorithm::Murmur);
    let expected = if bucket <= 60 { "on" } else { "off" };

    let result = evaluator.evaluate("user-42", "user-42", "demo", None);
    assert_eq!(result.treatment, expected);
    assert_eq!(result.label, "default rule");
    assert_eq!(result.change_number, Some(1001));

    // Determinism: same inputs, same answer, every time.
    for _ in 0..10 {
        assert_eq!(evaluator.evaluate("user-42", "user-42", "demo", None).treatment, expected);
    }
}

#[test]
fn test_killed_flag_scenario() {
    let (splits, segments) = stores();
    splits.put(rollout_flag("demo", 123, 1000));
    assert!(splits.kill_locally("demo", "off", 1001));

    let evaluator = Evaluator::new(splits.clone(), segments);
    let result = evaluator.evaluate("any", "any", "demo", None);
    assert_eq!(result.treatment, "off");
    assert_eq!(result.label, "killed");
    assert_eq!(result.change_number, Some(1001));
}

#[test]
fn test_dependency_scenario() {
    let (splits, segments) = stores();
    // B: whitelisted on for k1, default off otherwise.
    splits.put(flag_from_json(serde_json::json!({
        "name": "B",
        "trafficTypeName": "user",
        "seed": 7,
        "status": "ACTIVE",
        "defaultTreatment": "off",
        "changeNumber": 1,
        "conditions": [{
            "conditionType": "WHITELIST",
            "matcherGroup": {
                "combiner": "AND",
                "matchers": [{
                    "matcherType": "WHITELIST",
                    "negate": false,
                    "whitelistMatcherData": {"whitelist": ["k1"]}
                }]
            },
            "partitions": [{"treatment": "on", "size": 100}],
            "label": "whitelisted"
        }]
    })));
    // A: proceeds to its rollout only when B evaluates to on.
    splits.put(flag_from_json(serde_json::json!({
        "name": "A",
        "trafficTypeName": "user",
        "seed": 9,
        "status": "ACTIVE",
        "defaultTreatment": "off",
        "changeNumber": 2,
        "conditions": [{
            "conditionType": "ROLLOUT",
            "matcherGroup": {
                "combiner": "AND",
                "matchers": [{
                    "matcherType": "IN_SPLIT_TREATMENT",
                    "negate": false,
                    "dependencyMatcherData": {"split": "B", "treatments": ["on"]}
                }]
            },
            "partitions": [{"treatment": "on", "size": 100}],
            "label": "dependency satisfied"
        }]
    })));

    let evaluator = Evaluator::new(splits, segments);
    let hit = evaluator.evaluate("k1", "k1", "A", None);
    assert_eq!(hit.treatment, "on");
    assert_eq!(hit.label, "dependency satisfied");

    let miss = evaluator.evaluate("k2", "k2", "A", None);
    assert_eq!(miss.treatment, "off");
    assert_eq!(miss.label, "default rule");
}

fn split_synchronizer(
    splits: Arc<InMemorySplitStorage>,
    telemetry: Arc<TelemetryStorage>,
) -> SplitSynchronizer {
    let settings = Settings::default();
    let http = Arc::new(HttpClient::new(&settings, "test-key", telemetry.clone()).unwrap());
    let api = Arc::new(SplitsApi::new(http, settings.sdk_url()));
    SplitSynchronizer::new(api, splits, telemetry)
}

#[tokio::test]
async fn test_instant_update_bypass_scenario() {
    init_logs();
    let (splits, _) = stores();
    splits.put(rollout_flag("demo", 123, 10));
    splits.set_change_number(10);
    let telemetry = Arc::new(TelemetryStorage::new());
    let sync = split_synchronizer(splits.clone(), telemetry);

    // Storage at cn=10; an update with pcn=10 and an embedded definition
    // applies without any fetch.
    let applied = sync.apply_instant_update(rollout_flag("demo", 123, 11), 10);
    assert!(applied);
    assert_eq!(splits.get_change_number(), 11);
    assert_eq!(splits.get("demo").unwrap().change_number, 11);
}

#[tokio::test]
async fn test_out_of_order_update_scenario() {
    let (splits, _) = stores();
    splits.put(rollout_flag("demo", 123, 11));
    splits.set_change_number(11);
    let telemetry = Arc::new(TelemetryStorage::new());
    let sync = split_synchronizer(splits.clone(), telemetry);

    // pcn=9 does not match the cursor: no instant apply, no state change.
    let applied = sync.apply_instant_update(rollout_flag("demo", 123, 10), 9);
    assert!(!applied);
    assert_eq!(splits.get_change_number(), 11);
    assert_eq!(splits.get("demo").unwrap().change_number, 11);

    // And a stale definition reaching storage directly is a counted no-op.
    assert!(!splits.put(rollout_flag("demo", 123, 10)));
    assert_eq!(splits.ignored_updates(), 1);
}

fn impression(n: usize) -> Impression {
    Impression {
        key_name: format!("key-{}", n),
        bucketing_key: None,
        feature_name: "demo".to_string(),
        treatment: "on".to_string(),
        label: Some("default rule".to_string()),
        change_number: Some(1),
        time: 1_700_000_000_000,
        previous_time: None,
    }
}

#[tokio::test]
async fn test_impression_queue_overflow_scenario() {
    let settings = Settings::default(); // queue size 10_000
    let telemetry = Arc::new(TelemetryStorage::new());
    let http = Arc::new(HttpClient::new(&settings, "test-key", telemetry.clone()).unwrap());
    let api = Arc::new(RecordingApi::new(http, settings.events_url(), settings.telemetry_url()));
    let recorder = ImpressionsRecorder::new(
        ImpressionsManager::new(ImpressionsMode::Debug),
        api,
        telemetry.clone(),
        &settings,
    );

    let batch: Vec<Impression> = (0..10_001).map(impression).collect();
    recorder.record(batch);

    assert_eq!(recorder.queue_len(), 10_000);
    assert_eq!(telemetry.impressions_dropped(), 1);
}

#[tokio::test]
async fn test_optimized_dedupe_invariant() {
    let settings = Settings::default();
    let telemetry = Arc::new(TelemetryStorage::new());
    let http = Arc::new(HttpClient::new(&settings, "test-key", telemetry.clone()).unwrap());
    let api = Arc::new(RecordingApi::new(http, settings.events_url(), settings.telemetry_url()));
    let recorder = ImpressionsRecorder::new(
        ImpressionsManager::new(ImpressionsMode::Optimized),
        api,
        telemetry.clone(),
        &settings,
    );

    // Same (feature, key, treatment) tuple many times within one hour.
    let total = 100;
    let batch: Vec<Impression> = (0..total)
        .map(|i| {
            let mut imp = impression(0);
            imp.time += i as i64; // same hour
            imp
        })
        .collect();
    recorder.record(batch);

    // Suppressed == total - emitted.
    let emitted = recorder.queue_len() as u64;
    assert_eq!(emitted, 1);
    assert_eq!(telemetry.impressions_deduped(), total - emitted);
}

#[test]
fn test_segment_membership_via_storage() {
    let (_, segments) = stores();
    segments.update("beta", &["k1".to_string()], &[], 5);
    assert!(segments.segment_contains("beta", "k1"));
    assert!(!segments.segment_contains("beta", "k2"));
    assert!(!segments.segment_contains("missing", "k1"));
}
