//! Integration tests for the interpreter pool under concurrent use.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use spellpool_core::{PoolConfig, ScriptValue};
use spellpool_runtime::{InterpreterPool, PoolError, ScriptRuntime};

fn config(min: usize, max: usize) -> PoolConfig {
    PoolConfig {
        min_size: min,
        max_size: max,
        ..PoolConfig::default()
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

// ── Exclusivity and bounds ──

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn no_interpreter_is_shared_between_borrowers() {
    let pool = InterpreterPool::new(config(2, 4)).await.unwrap();
    let held: Arc<Mutex<HashSet<u64>>> = Arc::default();
    let mut tasks = Vec::new();

    for _ in 0..32 {
        let pool = pool.clone();
        let held = Arc::clone(&held);
        tasks.push(tokio::spawn(async move {
            for _ in 0..5 {
                let lease = pool.get().await.unwrap();
                assert!(held.lock().unwrap().insert(lease.id()), "interpreter borrowed twice");

                let m = pool.metrics();
                assert!(m.total <= 4);
                tokio::time::sleep(Duration::from_millis(1)).await;

                assert!(held.lock().unwrap().remove(&lease.id()));
                drop(lease);
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let m = pool.metrics();
    assert_eq!(m.in_use, 0);
    assert!(m.available >= 2 && m.available <= 4);
    assert_eq!(m.total, m.available);
    assert_eq!(m.total_requests, 160);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_scripts_do_not_see_each_others_globals() {
    let rt = Arc::new(ScriptRuntime::new(config(2, 3)).await.unwrap());
    let mut tasks = Vec::new();
    for i in 0..24 {
        let rt = Arc::clone(&rt);
        tasks.push(tokio::spawn(async move {
            let script = "assert(mine == nil or mine == me); mine = me; return mine";
            rt.execute(script, vec![("me".into(), ScriptValue::from(i))])
                .await
                .unwrap()
        }));
    }
    for (i, task) in tasks.into_iter().enumerate() {
        assert_eq!(task.await.unwrap(), ScriptValue::Number(i as f64));
    }
    assert_eq!(rt.metrics().in_use, 0);
}

#[tokio::test]
async fn third_borrow_waits_for_a_return() {
    let pool = InterpreterPool::new(config(2, 2)).await.unwrap();
    let a = pool.get().await.unwrap();
    let _b = pool.get().await.unwrap();
    assert_eq!(pool.metrics().total_created, 2);

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.get().await.map(|lease| lease.id()) })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!waiter.is_finished());

    let returned = a.id();
    pool.put(a);
    assert_eq!(waiter.await.unwrap().unwrap(), returned);
    assert_eq!(pool.metrics().wait_count, 1);
}

#[tokio::test]
async fn grows_lazily_then_blocks_at_max() {
    let pool = InterpreterPool::new(config(2, 5)).await.unwrap();
    let mut leases = vec![pool.get().await.unwrap(), pool.get().await.unwrap()];
    assert_eq!(pool.metrics().total_created, 2);

    leases.push(pool.get().await.unwrap());
    let m = pool.metrics();
    assert_eq!((m.total_created, m.total, m.in_use), (3, 3, 3));

    leases.push(pool.get().await.unwrap());
    leases.push(pool.get().await.unwrap());
    assert_eq!(pool.metrics().total, 5);

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.get().await.map(|lease| lease.id()) })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!waiter.is_finished());
    assert_eq!(pool.metrics().total_created, 5);

    let returned = leases.pop().unwrap();
    let returned_id = returned.id();
    pool.put(returned);
    assert_eq!(waiter.await.unwrap().unwrap(), returned_id);
    let m = pool.metrics();
    assert_eq!((m.total_created, m.total, m.wait_count), (5, 5, 1));
}

#[tokio::test]
async fn exhausted_then_recovered() {
    let pool = InterpreterPool::new(config(1, 1)).await.unwrap();
    let lease = pool.get().await.unwrap();

    let err = pool
        .get_timeout(Duration::from_millis(40))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, PoolError::Exhausted { waited } if waited == Duration::from_millis(40)));

    drop(lease);
    assert!(pool.get_timeout(Duration::from_millis(40)).await.is_ok());
}

// ── Predictive scaling ──

#[tokio::test]
async fn scaler_grows_pool_under_sustained_load() {
    let mut cfg = config(1, 6);
    cfg.enable_predictive_scaling = true;
    cfg.prediction_interval = Duration::from_millis(20);
    cfg.scale_up_threshold = 0.5;
    cfg.scale_down_threshold = 0.1;
    let pool = InterpreterPool::new(cfg).await.unwrap();

    let mut leases = Vec::new();
    for _ in 0..3 {
        leases.push(pool.get().await.unwrap());
    }

    let grew = wait_until(|| pool.metrics().predicted_scale_ups > 0).await;
    assert!(grew, "scaler never scaled up: {:?}", pool.metrics());
    let m = pool.metrics();
    assert!(m.total <= 6);
    assert!(m.scaler.unwrap().scale_ups > 0);

    drop(leases);
    pool.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn scaler_stops_on_shutdown() {
    let mut cfg = config(1, 4);
    cfg.enable_predictive_scaling = true;
    cfg.prediction_interval = Duration::from_millis(10);
    let pool = InterpreterPool::new(cfg).await.unwrap();
    tokio::time::sleep(Duration::from_millis(35)).await;

    pool.shutdown(Duration::from_millis(200)).await.unwrap();
    let ticks = pool.metrics().scaler.unwrap().ticks;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pool.metrics().scaler.unwrap().ticks, ticks);
}

// ── Pre-warming ──

#[tokio::test]
async fn prewarm_runs_script_on_each_interpreter() {
    let mut cfg = config(1, 4);
    cfg.enable_pre_warming = true;
    cfg.pre_warm_on_init = 3;
    cfg.pre_warm_script = Some("local s = 0 for i = 1, 1000 do s = s + i end".into());
    let pool = InterpreterPool::new(cfg).await.unwrap();
    pool.wait_for_prewarm().await;

    let m = pool.metrics();
    assert_eq!(m.prewarmed, 3);
    assert_eq!(m.in_use, 0);
    assert!(m.available >= 1 && m.available <= 4);
}

#[tokio::test]
async fn failing_prewarm_script_does_not_fail_pool() {
    let mut cfg = config(1, 2);
    cfg.enable_pre_warming = true;
    cfg.pre_warm_on_init = 2;
    cfg.pre_warm_script = Some("error('cold')".into());
    let pool = InterpreterPool::new(cfg).await.unwrap();
    pool.wait_for_prewarm().await;

    assert_eq!(pool.metrics().prewarmed, 0);
    assert!(pool.get().await.is_ok());
}

// ── Memory blocks ──

#[tokio::test]
async fn memory_blocks_are_recycled() {
    let mut cfg = config(1, 1);
    cfg.enable_memory_pooling = true;
    cfg.memory_pool_size = 2;
    cfg.memory_block_size = 4096;
    let pool = InterpreterPool::new(cfg).await.unwrap();

    let blocks = pool.memory_blocks();
    let block = blocks.get_block();
    assert_eq!(block.len(), 4096);
    blocks.put_block(block);
    let stats = blocks.stats();
    assert_eq!(stats.pooled_blocks, 2);
    assert_eq!(stats.hits, 1);

    pool.shutdown(Duration::from_millis(100)).await.unwrap();
    assert_eq!(pool.memory_blocks().stats().pooled_blocks, 0);
}
