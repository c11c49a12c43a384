//! Property-based tests (fuzzing) for the data handler.
//!
//! Uses proptest to generate random/malformed inputs and verify the handler
//! never panics, only returns clean errors, and keeps the tiers coherent.
//!
//! Run with: `cargo test --test proptest_fuzz`

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use serde_json::{json, Value};

use data_handler::health::compute_score;
use data_handler::key::RecordFamily;
use data_handler::resilience::retry::Backoff;
use data_handler::storage::memory::{InMemoryRemote, InMemoryStorage};
use data_handler::{
    CacheLayer, CircuitBreaker, CircuitConfig, CircuitState, DataHandler, HandlerConfig,
    StorageKey,
};

// =============================================================================
// Strategies for generating test data
// =============================================================================

/// Namespaces that pass validation (never reserved, no '.' or ':')
fn namespace_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,11}".prop_filter("reserved namespace", |ns| {
        !matches!(ns.as_str(), "data" | "queue" | "migration")
    })
}

/// Fields may contain dots but never ':'
fn field_strategy() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9_.\\-]{1,16}"
}

/// Small JSON leaves plus one level of nesting
fn json_value_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| Value::Number(n.into())),
        "[ -~]{0,24}".prop_map(Value::String),
    ];
    leaf.prop_recursive(2, 16, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::hash_map("[a-z]{1,6}", inner, 0..4)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

#[derive(Debug, Clone)]
enum Op {
    Set(usize, Value),
    Get(usize),
    Clear(usize),
    Flush,
}

/// Operations over a small fixed key set so sets, gets and clears collide
fn op_strategy(keys: usize) -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..keys, json_value_strategy()).prop_map(|(k, v)| Op::Set(k, v)),
        4 => (0..keys).prop_map(Op::Get),
        2 => (0..keys).prop_map(Op::Clear),
        1 => Just(Op::Flush),
    ]
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("tokio runtime")
}

// =============================================================================
// Key parsing
// =============================================================================

proptest! {
    /// Parsing arbitrary strings never panics
    #[test]
    fn fuzz_key_parse_never_panics(raw in ".*") {
        let _ = raw.parse::<StorageKey>();
        let _ = StorageKey::from_data_key(&raw);
        let _ = RecordFamily::classify(&raw);
    }

    /// Arbitrary namespace/field pairs either build or fail cleanly
    #[test]
    fn fuzz_key_new_never_panics(namespace in ".*", field in ".*") {
        if let Ok(key) = StorageKey::new(namespace, field) {
            prop_assert!(!key.namespace().contains('.'));
            prop_assert!(!key.namespace().contains(':'));
            prop_assert!(!key.field().contains(':'));
        }
    }

    /// Valid keys survive Display -> FromStr and the data: prefix
    #[test]
    fn prop_valid_key_round_trips(namespace in namespace_strategy(), field in field_strategy()) {
        let key = StorageKey::new(namespace.as_str(), field.as_str()).unwrap();

        let parsed: StorageKey = key.to_string().parse().unwrap();
        prop_assert_eq!(&parsed, &key);

        let data_key = key.data_key();
        prop_assert_eq!(RecordFamily::classify(&data_key), RecordFamily::Data);
        prop_assert_eq!(StorageKey::from_data_key(&data_key), Some(key.clone()));

        // Legacy keys never land in a record family
        prop_assert_eq!(RecordFamily::classify(&key.legacy_key("_")), RecordFamily::Other);
    }

    /// Keys embedded in JSON deserialize through the same validation
    #[test]
    fn fuzz_key_deserialize_never_panics(raw in ".*") {
        let _ = serde_json::from_value::<StorageKey>(json!(raw));
    }
}

// =============================================================================
// Configuration
// =============================================================================

proptest! {
    /// Random TOML never panics the config loader
    #[test]
    fn fuzz_config_toml_never_panics(raw in ".{0,256}") {
        let _ = HandlerConfig::from_toml_str(&raw);
    }

    /// Numeric fields are either accepted and valid, or rejected
    #[test]
    fn fuzz_config_numeric_fields(
        threshold in 0u32..20,
        interval in 0u64..10_000,
        base in 0u64..5_000,
        max in 0u64..5_000,
    ) {
        let raw = format!(
            "circuit_threshold = {threshold}\nsync_interval_ms = {interval}\n\
             retry_base_delay_ms = {base}\nretry_max_delay_ms = {max}\n"
        );
        if let Ok(config) = HandlerConfig::from_toml_str(&raw) {
            prop_assert!(config.validate().is_ok());
            prop_assert!(config.circuit_threshold > 0);
            prop_assert!(config.retry_max_delay_ms >= config.retry_base_delay_ms);
        }
    }
}

// =============================================================================
// Backoff and health score
// =============================================================================

proptest! {
    /// Jittered delay stays within [ceiling/2, ceiling] and never exceeds max
    #[test]
    fn prop_backoff_bounded(base_ms in 1u64..1_000, max_ms in 1u64..60_000, attempt in 0u32..64) {
        let backoff = Backoff::new(Duration::from_millis(base_ms), Duration::from_millis(max_ms));
        let ceiling = backoff.ceiling(attempt);
        let delay = backoff.delay(attempt);

        prop_assert!(ceiling <= backoff.max);
        prop_assert!(delay <= ceiling);
        prop_assert!(delay >= ceiling / 2);
        prop_assert!(backoff.ceiling(attempt + 1) >= ceiling);
    }

    /// Score is always 0..=100 and more dead letters never raise it
    #[test]
    fn prop_health_score_bounded(
        pending in 0usize..10_000,
        dead in 0usize..1_000,
        error_rate in -1.0f64..2.0,
        state in prop_oneof![
            Just(CircuitState::Closed),
            Just(CircuitState::HalfOpen),
            Just(CircuitState::Open),
        ],
    ) {
        let score = compute_score(state, pending, dead, error_rate);
        prop_assert!(score <= 100);
        prop_assert!(compute_score(state, pending, dead + 1, error_rate) <= score);
        if state == CircuitState::Open {
            prop_assert!(score <= 25);
        }
    }
}

// =============================================================================
// Circuit breaker
// =============================================================================

proptest! {
    /// Open exactly when consecutive failures reach the threshold
    #[test]
    fn prop_breaker_opens_at_threshold(
        threshold in 1u32..8,
        outcomes in prop::collection::vec(any::<bool>(), 0..40),
    ) {
        let breaker = CircuitBreaker::new("prop", CircuitConfig {
            failure_threshold: threshold,
            cooldown: Duration::from_secs(3600),
        });

        let mut consecutive = 0u32;
        for ok in outcomes {
            let Some(permit) = breaker.try_acquire() else {
                prop_assert!(consecutive >= threshold);
                prop_assert_eq!(breaker.state(), CircuitState::Open);
                continue;
            };
            if ok {
                permit.success();
                consecutive = 0;
            } else {
                permit.failure();
                consecutive += 1;
            }
            let expected = if consecutive >= threshold {
                CircuitState::Open
            } else {
                CircuitState::Closed
            };
            prop_assert_eq!(breaker.state(), expected);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// After cooldown one trial is admitted, and its outcome decides the state
    #[test]
    fn prop_breaker_trial_decides(threshold in 1u32..5, trial_ok in any::<bool>()) {
        let breaker = CircuitBreaker::new("prop", CircuitConfig {
            failure_threshold: threshold,
            cooldown: Duration::from_millis(40),
        });
        for _ in 0..threshold {
            breaker.try_acquire().unwrap().failure();
        }
        prop_assert!(breaker.try_acquire().is_none());
        std::thread::sleep(Duration::from_millis(60));
        prop_assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let trial = breaker.try_acquire().unwrap();
        prop_assert!(trial.is_trial());
        prop_assert!(breaker.try_acquire().is_none());

        if trial_ok {
            trial.success();
            prop_assert_eq!(breaker.state(), CircuitState::Closed);
        } else {
            trial.failure();
            prop_assert_eq!(breaker.state(), CircuitState::Open);
        }
    }
}

// =============================================================================
// Cache coherence
// =============================================================================

proptest! {
    /// The cache layer agrees with a plain map while under capacity
    #[test]
    fn prop_cache_matches_model(ops in prop::collection::vec(op_strategy(6), 1..60)) {
        let cache = CacheLayer::new(64, None);
        let keys: Vec<StorageKey> = (0..6)
            .map(|i| StorageKey::new("prop", format!("k{i}")).unwrap())
            .collect();
        let mut model: HashMap<usize, Value> = HashMap::new();

        for op in ops {
            match op {
                Op::Set(k, v) => {
                    cache.put(keys[k].clone(), v.clone(), true);
                    model.insert(k, v);
                }
                Op::Get(k) => prop_assert_eq!(cache.get(&keys[k]), model.get(&k).cloned()),
                Op::Clear(k) => {
                    prop_assert_eq!(cache.remove(&keys[k]), model.remove(&k).is_some());
                }
                Op::Flush => {
                    for key in &keys {
                        cache.mark_clean(key);
                    }
                }
            }
        }
        prop_assert_eq!(cache.len(), model.len());
    }

    /// Never holds more than max_entries
    #[test]
    fn prop_cache_respects_capacity(max in 1usize..16, writes in 0usize..64) {
        let cache = CacheLayer::new(max, None);
        for i in 0..writes {
            cache.put(StorageKey::new("cap", format!("k{i}")).unwrap(), json!(i), false);
            prop_assert!(cache.len() <= max);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Every read through the handler returns the last acknowledged write,
    /// with the remote online or not
    #[test]
    fn prop_handler_reads_last_write(
        ops in prop::collection::vec(op_strategy(4), 1..30),
        remote_offline in any::<bool>(),
    ) {
        runtime().block_on(async move {
            let storage = Arc::new(InMemoryStorage::new());
            let remote = Arc::new(InMemoryRemote::new());
            remote.set_offline(remote_offline);
            let config = HandlerConfig {
                debounce_ms: 0,
                sync_interval_ms: 3_600_000,
                health_interval_ms: 3_600_000,
                remote_timeout_ms: 200,
                retry_base_delay_ms: 1,
                retry_max_delay_ms: 2,
                cache_max_entries: 2,
                ..Default::default()
            };
            let handler = DataHandler::initialize(config, storage, remote).await.unwrap();
            let mut model: HashMap<usize, Value> = HashMap::new();

            for op in ops {
                match op {
                    Op::Set(k, v) => {
                        handler.set_value("prop", &format!("k{k}"), v.clone()).await.unwrap();
                        model.insert(k, v);
                    }
                    Op::Get(k) => {
                        let got = handler.get_value("prop", &format!("k{k}")).await.unwrap();
                        prop_assert_eq!(got, model.get(&k).cloned());
                    }
                    Op::Clear(k) => {
                        handler.clear("prop", &format!("k{k}")).await.unwrap();
                        model.remove(&k);
                    }
                    Op::Flush => {
                        handler.flush().await.unwrap();
                    }
                }
            }

            handler.shutdown().await;
            Ok::<(), TestCaseError>(())
        })?;
    }
}
