// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Tests against a live server. They run only when `THUNDERCACHE_REDIS_URL` is set.

use std::time::Duration;

use thundercache::{DistributedLock, RetryPolicy, SharedStore};
use thundercache_redis::RedisStore;
use tick::Clock;

async fn store() -> Option<RedisStore> {
    let url = std::env::var("THUNDERCACHE_REDIS_URL").ok()?;
    Some(RedisStore::connect(&url).await.expect("server is reachable"))
}

fn unique(name: &str) -> String {
    format!("thundercache-test:{name}:{}", std::process::id())
}

#[tokio::test]
async fn conditional_primitives() {
    let Some(store) = store().await else {
        return;
    };
    let key = unique("primitives");

    assert!(store.set_if_absent(&key, b"first", Duration::from_secs(30)).await.unwrap());
    assert!(!store.set_if_absent(&key, b"second", Duration::from_secs(30)).await.unwrap());
    assert_eq!(store.get(&key).await.unwrap(), Some(b"first".to_vec()));

    assert!(!store.delete_if_equals(&key, b"second").await.unwrap());
    assert!(store.delete_if_equals(&key, b"first").await.unwrap());
    assert_eq!(store.get(&key).await.unwrap(), None);
}

#[tokio::test]
async fn values_expire() {
    let Some(store) = store().await else {
        return;
    };
    let key = unique("expiry");

    store.set_with_expiry(&key, b"short-lived", Duration::from_millis(10)).await.unwrap();
    assert!(store.get(&key).await.unwrap().is_some());

    tokio::time::sleep(Duration::from_millis(2100)).await;
    assert_eq!(store.get(&key).await.unwrap(), None);
}

#[tokio::test]
async fn lock_round_trip() {
    let Some(store) = store().await else {
        return;
    };
    let clock = Clock::new_tokio();
    let lock = DistributedLock::new(store.clone(), &unique("lock"), RetryPolicy::new(clock));

    let guard = lock.acquire().await.unwrap();
    assert_eq!(
        store.get(lock.key()).await.unwrap().as_deref(),
        guard.token().map(str::as_bytes)
    );
    assert!(guard.release().await.unwrap());
    assert_eq!(store.get(lock.key()).await.unwrap(), None);
}
