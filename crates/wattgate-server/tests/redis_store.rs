//! Integration tests for the Redis-backed ephemeral store.
//!
//! Tests use testcontainers to spin up a real Redis instance. Quota counters
//! and cached responses are exercised against it the same way they run in a
//! multi-instance deployment.

use std::time::Duration;

use serde_json::{Value, json};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;
use tokio::sync::OnceCell;
use wattgate_server::quota::QuotaLimits;
use wattgate_server::response_cache::make_key;
use wattgate_server::{
    CacheTier, EphemeralStore, QuotaTracker, RedisConfig, ResponseCache, StoreFailurePolicy,
    create_ephemeral_store,
};

// Shared Redis container for all tests
static SHARED_REDIS: OnceCell<(ContainerAsync<Redis>, String)> = OnceCell::const_new();

async fn get_redis_url() -> String {
    let (_, url) = SHARED_REDIS
        .get_or_init(|| async {
            let container = Redis::default()
                .start()
                .await
                .expect("start redis container");

            let host_port = container.get_host_port_ipv4(6379).await.expect("get port");
            let url = format!("redis://127.0.0.1:{}", host_port);

            (container, url)
        })
        .await;

    url.clone()
}

async fn redis_store() -> EphemeralStore {
    let config = RedisConfig {
        enabled: true,
        url: get_redis_url().await,
        pool_size: 16,
        timeout_ms: 5000,
    };
    let store = create_ephemeral_store(&config, 10).await;
    assert_eq!(store.mode(), "redis");
    store
}

fn limits(uncached: u64, cached: u64) -> QuotaLimits {
    QuotaLimits {
        standard_uncached: uncached,
        standard_cached: cached,
        privileged_uncached: None,
        privileged_cached: None,
    }
}

#[tokio::test]
async fn test_disabled_redis_uses_local_store() {
    let store = create_ephemeral_store(&RedisConfig::default(), 10).await;
    assert_eq!(store.mode(), "local");
}

#[tokio::test]
async fn test_unreachable_redis_falls_back_to_local() {
    let config = RedisConfig {
        enabled: true,
        url: "redis://127.0.0.1:1".into(),
        pool_size: 1,
        timeout_ms: 200,
    };
    let store = create_ephemeral_store(&config, 10).await;
    assert_eq!(store.mode(), "local");
}

#[tokio::test]
async fn test_concurrent_increments_are_exact() {
    let store = redis_store().await;
    let deadline = chrono::Utc::now() + chrono::Duration::hours(1);
    let key = "it:concurrent-incr";

    let handles: Vec<_> = (0..50)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.incr_expiring_at(key, deadline).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(store.get_counter(key).await.unwrap(), Some(50));
}

#[tokio::test]
async fn test_quota_over_redis_counts_every_attempt() {
    let tracker = QuotaTracker::new(redis_store().await, limits(10, 100), StoreFailurePolicy::Open);
    let user = "it-quota-user";

    let handles: Vec<_> = (0..12)
        .map(|_| {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                tracker
                    .check_and_increment(
                        user,
                        "/metering/contract/{usage_point_id}",
                        CacheTier::Uncached,
                        false,
                    )
                    .await
                    .unwrap()
            })
        })
        .collect();
    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap());
    }

    let allowed = results.iter().filter(|d| d.allowed).count();
    assert_eq!(allowed, 10);
    for rejected in results.iter().filter(|d| !d.allowed) {
        assert_eq!((rejected.current, rejected.limit), (10, Some(10)));
    }

    // Rejected attempts stay counted.
    let usage = tracker.usage_for_user(user, false).await.unwrap();
    assert_eq!(usage.totals.uncached, 12);

    assert_eq!(tracker.reset_user(user).await.unwrap(), 1);
    assert_eq!(tracker.usage_for_user(user, false).await.unwrap().totals.total(), 0);
}

#[tokio::test]
async fn test_cache_round_trip_and_pattern_delete() {
    let cache = ResponseCache::new(redis_store().await, Duration::from_secs(60));
    let value = json!({"meter_reading": {"interval_reading": [{"value": "42"}]}});

    for day in 1..=25 {
        let end = format!("2024-01-{day:02}");
        let key = make_key("it-pdl-1", "consumption_daily", &[("start", "2024-01-01"), ("end", &end)]);
        cache.set(&key, &value, "secret-1", None).await.unwrap();
    }
    let contract = make_key("it-pdl-2", "contract", &[]);
    cache.set(&contract, &value, "secret-2", None).await.unwrap();

    let key = make_key("it-pdl-1", "consumption_daily", &[("start", "2024-01-01"), ("end", "2024-01-10")]);
    let hit: Option<Value> = cache.get(&key, "secret-1").await.unwrap();
    assert_eq!(hit, Some(value.clone()));
    let wrong: Option<Value> = cache.get(&key, "secret-2").await.unwrap();
    assert!(wrong.is_none());

    // 25 keys with a SCAN batch of 10 takes several cursor rounds
    assert_eq!(cache.purge_subject("it-pdl-1").await.unwrap(), 25);
    let gone: Option<Value> = cache.get(&key, "secret-1").await.unwrap();
    assert!(gone.is_none());

    let kept: Option<Value> = cache.get(&contract, "secret-2").await.unwrap();
    assert_eq!(kept, Some(value));
}

#[tokio::test]
async fn test_ping() {
    let store = redis_store().await;
    assert!(store.ping().await);
}
