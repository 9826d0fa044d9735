//! Redis-backed limiter tests.
//!
//! These need a running Redis server and are skipped unless `REDIS_URL` is
//! set, e.g. `REDIS_URL=redis://127.0.0.1:6379/ cargo test`.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use global_limiter::ratelimit::{Clock, ManualClock, SystemClock};
use global_limiter::store::{RedisWindowStore, WindowStore};
use global_limiter::{Admission, LimiterIdentity, SlidingWindowLimiter};

async fn store() -> Option<Arc<RedisWindowStore>> {
    let url = match std::env::var("REDIS_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("REDIS_URL not set, skipping");
            return None;
        }
    };
    Some(Arc::new(RedisWindowStore::connect(&url, Duration::from_secs(2)).await.unwrap()))
}

/// A key no other test run will touch.
fn fresh_identity(max_rate: u64, period: Duration) -> LimiterIdentity {
    let prefix = format!("GlobalLimiterTest-{}", uuid::Uuid::new_v4());
    LimiterIdentity::new(&prefix, "redis", max_rate, period)
}

#[tokio::test]
async fn redis_two_per_ten_seconds_scenario() {
    let Some(store) = store().await else { return };
    let start = SystemClock.now_millis();
    let clock = ManualClock::new(start);
    let limiter = SlidingWindowLimiter::with_clock(
        fresh_identity(2, Duration::from_secs(10)),
        store,
        Arc::new(clock.clone()),
    );

    assert!(limiter.try_acquire(1).await.unwrap().is_granted());
    clock.set(start + 1_000);
    assert!(limiter.try_acquire(1).await.unwrap().is_granted());
    clock.set(start + 2_000);
    assert_eq!(
        limiter.try_acquire(1).await.unwrap(),
        Admission::Denied { retry_after: Duration::from_secs(8) }
    );
    clock.set(start + 11_000);
    assert!(limiter.try_acquire(1).await.unwrap().is_granted());
}

#[tokio::test]
async fn redis_instances_share_quota_across_connections() {
    let Some(first) = store().await else { return };
    let Some(second) = store().await else { return };
    let identity = fresh_identity(3, Duration::from_secs(30));

    let a = SlidingWindowLimiter::new(identity.clone(), first);
    let b = SlidingWindowLimiter::new(identity, second);

    assert!(a.try_acquire(3).await.unwrap().is_granted());
    assert!(!b.try_acquire(1).await.unwrap().is_granted());
    assert_eq!(b.count().await.unwrap(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn redis_concurrent_burst_grants_exactly_max_rate() {
    let Some(store) = store().await else { return };
    let limiter = Arc::new(SlidingWindowLimiter::new(
        fresh_identity(5, Duration::from_secs(30)),
        store,
    ));

    let handles: Vec<_> = (0..40)
        .map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.try_acquire(1).await.unwrap() })
        })
        .collect();
    let granted = join_all(handles)
        .await
        .into_iter()
        .filter(|r| r.as_ref().unwrap().is_granted())
        .count();

    assert_eq!(granted, 5);
}

#[tokio::test]
async fn redis_leak_count_and_peek() {
    let Some(store) = store().await else { return };
    let start = SystemClock.now_millis();
    let clock = ManualClock::new(start);
    let identity = fresh_identity(4, Duration::from_secs(5));
    let key = identity.store_key();
    let limiter = SlidingWindowLimiter::with_clock(identity, store.clone(), Arc::new(clock.clone()));

    limiter.try_acquire(2).await.unwrap();
    clock.advance(Duration::from_secs(3));
    limiter.try_acquire(1).await.unwrap();

    assert_eq!(store.count(&key).await.unwrap(), 3);
    let newest = limiter.peek(0).await.unwrap().unwrap();
    assert_eq!(newest.timestamp_millis, start + 3_000);
    assert!(newest.member.starts_with(limiter.instance_id()));

    clock.advance(Duration::from_secs(3));
    assert_eq!(limiter.leak().await.unwrap(), 2);
    assert_eq!(limiter.count().await.unwrap(), 1);
    assert!(limiter.peek(1).await.unwrap().is_none());
}
