// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Many concurrent callers share one computation of an expensive report.
//!
//! The in-memory store stands in for Redis. With the `thundercache_redis` crate the same code
//! runs across processes by swapping `MockStore` for `RedisStore`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use ohno::AppError;
use thundercache::testing::MockStore;
use thundercache::{StampedeCache, fingerprint};
use tick::Clock;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    tracing_subscriber::registry().with(tracing_subscriber::fmt::layer()).init();

    let clock = Clock::new_tokio();
    let cache = StampedeCache::builder(MockStore::new(clock.clone()), "reports", clock.clone())
        .max_age(Duration::from_secs(60))
        .critical(Duration::from_secs(5))
        .build();

    let computations = Arc::new(AtomicU32::new(0));
    let key = fingerprint(&("monthly-sales", 2024, 6))?;

    let callers = (0..8).map(|caller| {
        let cache = cache.clone();
        let clock = clock.clone();
        let key = key.clone();
        let computations = Arc::clone(&computations);

        tokio::spawn(async move {
            let total: u64 = cache
                .call(&key, || async move {
                    computations.fetch_add(1, Ordering::SeqCst);
                    clock.delay(Duration::from_millis(300)).await;
                    Ok::<_, std::io::Error>(184_250)
                })
                .await?;

            println!("caller {caller} got {total}");
            Ok::<_, thundercache::Error>(())
        })
    });

    for caller in futures::future::join_all(callers).await {
        caller??;
    }

    println!("computed {} time(s)", computations.load(Ordering::SeqCst));

    Ok(())
}
