//! # Thread Pool Scenarios
//!
//! End-to-end dispatch behavior against real worker threads: queueing
//! order, backlog admission, timeouts, crash recovery, and teardown.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;

use offload_core::adapter::{
    AdapterConfig, Handler, HandlerError, HandlerFactory, HandlerRegistry, HandlerResult,
};
use offload_core::config::{LimiterOptions, PoolOptions};
use offload_core::pool::{PoolEventKind, PoolHandle, ThreadPool};
use offload_core::AssignError;

/// Sleeps for `payload["ms"]`, records its start order, then echoes the
/// payload back.
struct Recorder {
    order: Arc<Mutex<Vec<Value>>>,
}

#[async_trait]
impl Handler for Recorder {
    async fn handle(&self, payload: Value) -> HandlerResult {
        self.order.lock().push(payload["tag"].clone());
        let ms = payload["ms"].as_u64().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        if payload["fail"].as_bool().unwrap_or(false) {
            return Err(HandlerError::with_detail("instructed failure", payload));
        }
        if payload["panic"].as_bool().unwrap_or(false) {
            panic!("instructed panic");
        }
        Ok(payload)
    }
}

struct RecorderFactory {
    order: Arc<Mutex<Vec<Value>>>,
}

#[async_trait]
impl HandlerFactory for RecorderFactory {
    async fn load(&self, _options: &Value) -> offload_core::Result<Arc<dyn Handler>> {
        Ok(Arc::new(Recorder {
            order: Arc::clone(&self.order),
        }))
    }
}

struct Rig {
    pool: PoolHandle,
    order: Arc<Mutex<Vec<Value>>>,
}

fn rig(options: PoolOptions) -> Rig {
    let order = Arc::new(Mutex::new(Vec::new()));
    let registry = Arc::new(HandlerRegistry::new());
    registry.register(
        "scenario.recorder",
        Arc::new(RecorderFactory {
            order: Arc::clone(&order),
        }),
    );
    let pool = ThreadPool::start_with_registry(
        AdapterConfig::new("scenario.recorder", json!({})),
        options,
        registry,
    )
    .expect("pool start");
    Rig { pool, order }
}

fn options(limit: usize) -> PoolOptions {
    PoolOptions {
        concurrency_limit: Some(limit),
        ..PoolOptions::default()
    }
}

#[tokio::test]
async fn fifo_order_is_preserved_under_a_single_worker() -> Result<()> {
    let rig = rig(options(1));

    let mut settled = Vec::new();
    for tag in ["a", "b", "c", "d"] {
        let pool = rig.pool.clone();
        let payload = json!({"tag": tag, "ms": 10});
        settled.push(tokio::spawn(async move { pool.assign(payload).await }));
        // Give each submission time to enter the queue in order.
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    for handle in settled {
        handle.await?.map_err(anyhow::Error::from)?;
    }

    assert_eq!(*rig.order.lock(), vec![json!("a"), json!("b"), json!("c"), json!("d")]);
    rig.pool.destroy().await;
    Ok(())
}

#[tokio::test]
async fn slow_requests_time_out_near_the_configured_deadline() -> Result<()> {
    let rig = rig(PoolOptions {
        concurrency_limit: Some(1),
        request_timeout_ms: 100,
        ..PoolOptions::default()
    });

    let started = Instant::now();
    let result = rig.pool.assign(json!({"tag": "slow", "ms": 10_000})).await;
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(AssignError::Timeout { timeout_ms: 100 })));
    assert!(elapsed >= Duration::from_millis(90), "too early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(2_000), "too late: {elapsed:?}");

    // The abandoned worker was replaced; the pool still serves.
    let ok = rig.pool.assign(json!({"tag": "after", "ms": 1})).await;
    assert!(ok.is_ok());
    rig.pool.destroy().await;
    Ok(())
}

#[tokio::test]
async fn zero_backlog_rejects_only_once_capacity_is_busy() -> Result<()> {
    let rig = rig(PoolOptions {
        concurrency_limit: Some(1),
        max_pending: Some(0),
        ..PoolOptions::default()
    });

    // First assign occupies the only worker slot.
    let first = {
        let pool = rig.pool.clone();
        tokio::spawn(async move { pool.assign(json!({"tag": "first", "ms": 300})).await })
    };
    // Wait until the handler actually started.
    for _ in 0..200 {
        if !rig.order.lock().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(rig.order.lock().len(), 1, "first request never started");

    // No idle worker, no spawn headroom, no backlog allowance.
    let rejected = rig.pool.assign(json!({"tag": "second", "ms": 1})).await;
    assert!(matches!(rejected, Err(AssignError::MaxPending)));

    assert!(first.await?.is_ok());
    // Capacity is free again.
    assert!(rig.pool.assign(json!({"tag": "third", "ms": 1})).await.is_ok());
    rig.pool.destroy().await;
    Ok(())
}

#[tokio::test]
async fn handler_failures_carry_detail_and_do_not_burn_workers() -> Result<()> {
    let rig = rig(options(2));

    let err = rig
        .pool
        .assign(json!({"tag": "f", "fail": true}))
        .await
        .unwrap_err();
    match err {
        AssignError::Handler { message, detail } => {
            assert_eq!(message, "instructed failure");
            assert_eq!(detail.unwrap()["tag"], json!("f"));
        }
        other => panic!("unexpected: {other:?}"),
    }

    let status = rig.pool.status().await.map_err(anyhow::Error::from)?;
    assert!(!status.tripped, "handler failures must not feed the limiter");
    rig.pool.destroy().await;
    Ok(())
}

#[tokio::test]
async fn repeated_panics_trip_the_pool_fatal() -> Result<()> {
    let rig = rig(PoolOptions {
        concurrency_limit: Some(1),
        limiter: LimiterOptions {
            observation_period_ms: 60_000,
            registration_limit: 2,
        },
        ..PoolOptions::default()
    });
    let mut events = rig.pool.events();

    // Three panics: two under the limit, the third trips.
    for _ in 0..3 {
        let result = rig.pool.assign(json!({"tag": "p", "panic": true})).await;
        assert!(result.is_err());
        if matches!(result, Err(AssignError::PoolClosed)) {
            break;
        }
    }

    let reason = loop {
        let received = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("no fatal event observed");
        match received {
            Ok(event) => {
                if let PoolEventKind::Fatal { reason } = event.kind {
                    break reason;
                }
            }
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => panic!("event channel closed before fatal"),
        }
    };
    assert!(reason.contains("error density"), "reason: {reason}");

    let status = rig.pool.status().await.map_err(anyhow::Error::from)?;
    assert!(status.destroyed);
    assert!(status.tripped);
    assert!(matches!(
        rig.pool.assign(json!({"tag": "late"})).await,
        Err(AssignError::PoolClosed)
    ));
    Ok(())
}

#[tokio::test]
async fn destroy_rejects_backlog_and_inflight_work() -> Result<()> {
    let rig = rig(options(1));

    let in_flight = {
        let pool = rig.pool.clone();
        tokio::spawn(async move { pool.assign(json!({"tag": "inflight", "ms": 5_000})).await })
    };
    for _ in 0..200 {
        if !rig.order.lock().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let queued = {
        let pool = rig.pool.clone();
        tokio::spawn(async move { pool.assign(json!({"tag": "queued", "ms": 1})).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    rig.pool.destroy().await;
    assert!(matches!(in_flight.await?, Err(AssignError::PoolClosed)));
    assert!(matches!(queued.await?, Err(AssignError::PoolClosed)));

    // Destroy twice is fine.
    rig.pool.destroy().await;
    Ok(())
}

#[tokio::test]
async fn parallel_workers_really_run_concurrently() -> Result<()> {
    let rig = rig(options(4));

    let started = Instant::now();
    let mut tasks = Vec::new();
    for tag in 0..4 {
        let pool = rig.pool.clone();
        tasks.push(tokio::spawn(async move {
            pool.assign(json!({"tag": tag, "ms": 150})).await
        }));
    }
    for task in tasks {
        assert!(task.await?.is_ok());
    }
    let elapsed = started.elapsed();

    // Four 150ms sleeps on four workers must not serialize to 600ms.
    assert!(elapsed < Duration::from_millis(450), "not parallel: {elapsed:?}");
    rig.pool.destroy().await;
    Ok(())
}
