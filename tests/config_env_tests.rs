//! Integration tests for ExchangeConfig::from_env()

use std::env;
use std::sync::Mutex;
use std::time::Duration;

use kafka_exchange::config::{ExchangeConfig, OffsetReset, RebalanceStrategy};
use kafka_exchange::retry::RejoinPolicy;

/// Environment variables are process-global, so env-based tests run one at
/// a time.
static ENV_MUTEX: Mutex<()> = Mutex::new(());

/// Every variable read by ExchangeConfig::from_env().
const ALL_CONFIG_ENV_VARS: &[&str] = &[
    "KAFKA_BROKERS",
    "CLIENT_ID",
    "TOPIC",
    "TOPIC_PARTITIONS",
    "TOPIC_REPLICATION_FACTOR",
    "GROUP_ID",
    "BATCH_SIZE",
    "MESSAGE_PREFIX",
    "OFFSET_RESET",
    "REBALANCE_STRATEGY",
    "PUBLISH_TIMEOUT_MS",
    "READINESS_TIMEOUT_MS",
    "DRAIN_TIMEOUT_MS",
    "REJOIN_MAX_RETRIES",
    "REJOIN_MIN_DELAY_MS",
    "REJOIN_MAX_DELAY_MS",
];

/// Runs `f` with exactly `vars` set among the config variables, restoring
/// the previous environment afterwards.
fn with_env_vars<F, R>(vars: &[(&str, &str)], f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());

    let originals: Vec<_> = ALL_CONFIG_ENV_VARS
        .iter()
        .map(|k| (*k, env::var(*k).ok()))
        .collect();

    for key in ALL_CONFIG_ENV_VARS {
        unsafe { env::remove_var(key) };
    }
    for (key, value) in vars {
        unsafe { env::set_var(key, value) };
    }

    let result = f();

    for (key, original) in originals {
        match original {
            Some(v) => unsafe { env::set_var(key, v) },
            None => unsafe { env::remove_var(key) },
        }
    }

    result
}

// ============================================================================
// Defaults
// ============================================================================

#[test]
fn test_from_env_defaults() {
    with_env_vars(&[], || {
        let config = ExchangeConfig::from_env().expect("defaults must be valid");
        assert_eq!(config.brokers, vec!["localhost:9092"]);
        assert_eq!(config.client_id, "kafka-exchange");
        assert_eq!(config.topic.name, "sample-message");
        assert_eq!(config.topic.partitions, 1);
        assert_eq!(config.topic.replication_factor, 1);
        assert_eq!(config.group_id, "group1");
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.message_prefix, "message");
        assert_eq!(config.offset_reset, OffsetReset::Latest);
        assert_eq!(config.rebalance, RebalanceStrategy::RoundRobin);
        assert_eq!(config.publish_timeout, Duration::from_secs(5));
        assert_eq!(config.rejoin, RejoinPolicy::Unbounded);
        assert!(config.readiness_timeout.is_none());
        assert!(config.drain_timeout.is_none());
    });
}

// ============================================================================
// Overrides
// ============================================================================

#[test]
fn test_from_env_broker_list() {
    with_env_vars(&[("KAFKA_BROKERS", "a:9092, b:9092,,c:9092")], || {
        let config = ExchangeConfig::from_env().unwrap();
        assert_eq!(config.brokers, vec!["a:9092", "b:9092", "c:9092"]);
        assert_eq!(config.bootstrap_servers(), "a:9092,b:9092,c:9092");
    });
}

#[test]
fn test_from_env_topic_and_group() {
    with_env_vars(
        &[
            ("TOPIC", "orders"),
            ("TOPIC_PARTITIONS", "6"),
            ("TOPIC_REPLICATION_FACTOR", "3"),
            ("GROUP_ID", "auditors"),
            ("CLIENT_ID", "probe"),
        ],
        || {
            let config = ExchangeConfig::from_env().unwrap();
            assert_eq!(config.topic.name, "orders");
            assert_eq!(config.topic.partitions, 6);
            assert_eq!(config.topic.replication_factor, 3);
            assert_eq!(config.group_id, "auditors");
            assert_eq!(config.client_id, "probe");
        },
    );
}

#[test]
fn test_from_env_batch_and_prefix() {
    with_env_vars(&[("BATCH_SIZE", "12"), ("MESSAGE_PREFIX", "probe")], || {
        let config = ExchangeConfig::from_env().unwrap();
        assert_eq!(config.batch_size, 12);
        assert_eq!(config.message_prefix, "probe");
    });
}

#[test]
fn test_from_env_offset_reset_and_strategy() {
    with_env_vars(
        &[("OFFSET_RESET", "earliest"), ("REBALANCE_STRATEGY", "range")],
        || {
            let config = ExchangeConfig::from_env().unwrap();
            assert_eq!(config.offset_reset, OffsetReset::Earliest);
            assert_eq!(config.rebalance, RebalanceStrategy::Range);
        },
    );
}

#[test]
fn test_from_env_deadlines() {
    with_env_vars(
        &[
            ("READINESS_TIMEOUT_MS", "1500"),
            ("DRAIN_TIMEOUT_MS", "30000"),
            ("PUBLISH_TIMEOUT_MS", "250"),
        ],
        || {
            let config = ExchangeConfig::from_env().unwrap();
            assert_eq!(config.readiness_timeout, Some(Duration::from_millis(1500)));
            assert_eq!(config.drain_timeout, Some(Duration::from_secs(30)));
            assert_eq!(config.publish_timeout, Duration::from_millis(250));
        },
    );
}

#[test]
fn test_from_env_max_retries_enables_backoff() {
    with_env_vars(
        &[
            ("REJOIN_MAX_RETRIES", "4"),
            ("REJOIN_MIN_DELAY_MS", "50"),
            ("REJOIN_MAX_DELAY_MS", "800"),
        ],
        || {
            let config = ExchangeConfig::from_env().unwrap();
            assert_eq!(
                config.rejoin,
                RejoinPolicy::Backoff {
                    min_delay: Duration::from_millis(50),
                    max_delay: Duration::from_millis(800),
                    max_retries: 4,
                    jitter: true,
                }
            );
        },
    );
}

#[test]
fn test_from_env_delays_without_max_retries_stay_unbounded() {
    with_env_vars(&[("REJOIN_MIN_DELAY_MS", "50")], || {
        let config = ExchangeConfig::from_env().unwrap();
        assert_eq!(config.rejoin, RejoinPolicy::Unbounded);
    });
}

// ============================================================================
// Rejections
// ============================================================================

#[test]
fn test_from_env_rejects_malformed_numbers() {
    with_env_vars(&[("BATCH_SIZE", "five")], || {
        let err = ExchangeConfig::from_env().unwrap_err();
        assert_eq!(err.as_label(), "config");
        assert!(err.to_string().contains("BATCH_SIZE"));
    });
}

#[test]
fn test_from_env_rejects_unknown_offset_reset() {
    with_env_vars(&[("OFFSET_RESET", "middle")], || {
        let err = ExchangeConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("OFFSET_RESET"));
    });
}

#[test]
fn test_from_env_rejects_zero_partitions() {
    with_env_vars(&[("TOPIC_PARTITIONS", "0")], || {
        let err = ExchangeConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("partitions"));
    });
}

#[test]
fn test_from_env_rejects_zero_replication() {
    with_env_vars(&[("TOPIC_REPLICATION_FACTOR", "0")], || {
        let err = ExchangeConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("replication_factor"));
    });
}

#[test]
fn test_from_env_rejects_empty_broker_list() {
    with_env_vars(&[("KAFKA_BROKERS", " , ")], || {
        let err = ExchangeConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("brokers"));
    });
}

#[test]
fn test_from_env_rejects_oversized_batch() {
    with_env_vars(&[("BATCH_SIZE", "1000000")], || {
        let err = ExchangeConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    });
}

#[test]
fn test_from_env_reports_every_problem() {
    with_env_vars(
        &[("TOPIC_PARTITIONS", "0"), ("GROUP_ID", ""), ("PUBLISH_TIMEOUT_MS", "0")],
        || {
            let err = ExchangeConfig::from_env().unwrap_err().to_string();
            assert!(err.contains("partitions"));
            assert!(err.contains("group_id"));
            assert!(err.contains("publish_timeout"));
        },
    );
}
