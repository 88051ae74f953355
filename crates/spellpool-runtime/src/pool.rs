//! A pool of reusable Lua interpreters.
//!
//! ```text
//! get()
//!   → idle interpreter available       → borrow it (least-loaded if enabled)
//!   → below max_size                   → create one on a blocking thread
//!   → otherwise                        → wait for a return, deadline or cancel
//!
//! drop(lease)
//!   → pool closed                      → destroy
//!   → max_uses reached / reset fails   → destroy and replace in background
//!   → otherwise                        → reset, push idle, release one permit
//!
//! every cleanup_interval
//!   → idle past idle_timeout or below health_threshold → destroy
//!   → below min_size                   → create replacements in background
//! ```
//!
//! The idle deque is paired with a semaphore whose permits count idle
//! interpreters; a permit is always taken before an interpreter is popped.
//! `total` counts live interpreters plus in-flight creations and is bumped
//! with a compare-and-swap so that it never exceeds `max_size`.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use spellpool_autoscale::{
    PoolSnapshot, PredictiveScaler, ScaleTarget, ScalerConfig, ScalerStats, ScalerStatsSnapshot,
};
use spellpool_core::PoolConfig;

use crate::balancer::{LoadTracker, SAMPLE_SIZE, StateLoadInfo};
use crate::error::{PoolError, PoolResult};
use crate::instance::{Interpreter, InterpreterFactory, LuaFactory};
use crate::memory::MemoryBlockPool;
use crate::prewarm;

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
struct Counters {
    total_created: AtomicU64,
    total_destroyed: AtomicU64,
    total_recycled: AtomicU64,
    creation_failures: AtomicU64,
    wait_count: AtomicU64,
    total_requests: AtomicU64,
    prewarmed: AtomicU64,
    predicted_scale_ups: AtomicU64,
    predicted_scale_downs: AtomicU64,
    total_cleaned_up: AtomicU64,
}

/// Point-in-time pool metrics. Every field is read from an atomic.
#[derive(Debug, Clone, Serialize)]
pub struct PoolMetrics {
    /// Idle interpreters ready to borrow.
    pub available: usize,
    /// Interpreters currently on loan.
    pub in_use: usize,
    /// Live interpreters plus creations in flight.
    pub total: usize,
    pub min_size: usize,
    pub max_size: usize,
    /// Interpreters built since the pool started, for any reason.
    pub total_created: u64,
    /// Interpreters torn down, for any reason.
    pub total_destroyed: u64,
    /// Returned interpreters discarded for `max_uses` or a failed reset.
    pub total_recycled: u64,
    /// Factory calls that failed.
    pub creation_failures: u64,
    /// `get` calls that had to wait for a return.
    pub wait_count: u64,
    pub total_requests: u64,
    /// Interpreters that finished the start-up pre-warm batch.
    pub prewarmed: u64,
    /// Interpreters added by the predictive scaler.
    pub predicted_scale_ups: u64,
    /// Idle interpreters removed by the predictive scaler.
    pub predicted_scale_downs: u64,
    /// Idle interpreters evicted by the cleanup sweep.
    pub total_cleaned_up: u64,
    /// Scaler counters, when predictive scaling is enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scaler: Option<ScalerStatsSnapshot>,
}

/// Counts `get` calls inside a trailing window.
#[derive(Debug)]
struct RequestTracker {
    window: Duration,
    times: Mutex<VecDeque<Instant>>,
}

impl RequestTracker {
    fn new(window: Duration) -> Self {
        Self {
            window,
            times: Mutex::new(VecDeque::new()),
        }
    }

    fn record(&self, now: Instant) {
        let mut times = self.times.lock().expect("request tracker lock");
        Self::prune(&mut times, now, self.window);
        times.push_back(now);
    }

    fn count(&self, now: Instant) -> usize {
        let mut times = self.times.lock().expect("request tracker lock");
        Self::prune(&mut times, now, self.window);
        times.len()
    }

    fn prune(times: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while times
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) > window)
        {
            times.pop_front();
        }
    }
}

struct PoolShared {
    config: PoolConfig,
    factory: Arc<dyn InterpreterFactory>,

    idle: Mutex<VecDeque<Interpreter>>,
    /// One permit per idle interpreter.
    idle_permits: Semaphore,
    /// Live interpreters plus reservations for in-flight creations.
    total: AtomicUsize,
    available: AtomicUsize,
    in_use: AtomicUsize,
    /// Borrow start time per checked-out interpreter id.
    borrowed: Mutex<HashMap<u64, Instant>>,
    next_id: AtomicU64,

    counters: Counters,
    requests: RequestTracker,
    load: LoadTracker,
    memory: MemoryBlockPool,

    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    scaler_task: Mutex<Option<JoinHandle<()>>>,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
    scaler_stats: Option<Arc<ScalerStats>>,
    prewarm: tokio::sync::Mutex<Option<JoinSet<()>>>,
}

/// A reservation against `max_size`. Released on drop unless committed.
struct Slot {
    shared: Arc<PoolShared>,
    armed: bool,
}

impl Slot {
    fn commit(mut self) {
        self.armed = false;
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        if self.armed {
            self.shared.total.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl PoolShared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn try_reserve(self: &Arc<Self>) -> Option<Slot> {
        let max = self.config.max_size;
        self.total
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |t| (t < max).then_some(t + 1))
            .ok()
            .map(|_| Slot {
                shared: Arc::clone(self),
                armed: true,
            })
    }

    /// Create an interpreter on a blocking thread, consuming `slot`.
    async fn create(self: &Arc<Self>, slot: Slot) -> PoolResult<Interpreter> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let factory = Arc::clone(&self.factory);
        let outcome = tokio::task::spawn_blocking(move || factory.create(id))
            .await
            .map_err(|e| e.to_string())
            .and_then(|r| r.map_err(|e| e.to_string()));
        self.finish_create(slot, outcome)
    }

    /// Create an interpreter on the current thread, consuming `slot`.
    fn create_now(self: &Arc<Self>, slot: Slot) -> PoolResult<Interpreter> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let outcome = self.factory.create(id).map_err(|e| e.to_string());
        self.finish_create(slot, outcome)
    }

    fn finish_create(&self, slot: Slot, outcome: Result<Interpreter, String>) -> PoolResult<Interpreter> {
        match outcome {
            Ok(interp) => {
                slot.commit();
                self.counters.total_created.fetch_add(1, Ordering::Relaxed);
                Ok(interp)
            }
            Err(message) => {
                drop(slot);
                self.counters.creation_failures.fetch_add(1, Ordering::Relaxed);
                Err(PoolError::CreationFailed(message))
            }
        }
    }

    /// Pop one idle interpreter. The caller must hold a forgotten permit.
    fn take_idle(&self) -> Option<Interpreter> {
        let mut idle = self.idle.lock().expect("idle lock");
        let index = if self.config.enable_load_balancing && idle.len() > 1 {
            let ids: Vec<u64> = idle.iter().take(SAMPLE_SIZE).map(Interpreter::id).collect();
            self.load.select_least_loaded(&ids).unwrap_or(0)
        } else {
            0
        };
        let Some(interp) = idle.remove(index) else {
            error!("idle permit granted but idle set is empty");
            return None;
        };
        self.available.fetch_sub(1, Ordering::SeqCst);
        Some(interp)
    }

    fn checkout_idle(&self) -> Option<Interpreter> {
        let interp = self.take_idle()?;
        if interp.is_executing() {
            error!(id = interp.id(), "idle interpreter still marked executing; discarding");
            self.destroy(interp);
            return None;
        }
        Some(interp)
    }

    fn into_lease(self: &Arc<Self>, mut interp: Interpreter) -> PooledInterpreter {
        let now = Instant::now();
        let id = interp.id();
        interp.mark_borrowed();
        self.borrowed.lock().expect("borrowed lock").insert(id, now);
        self.in_use.fetch_add(1, Ordering::SeqCst);
        self.load.begin(id, now);
        debug!(id, uses = interp.use_count(), "interpreter borrowed");
        PooledInterpreter {
            interp: Some(interp),
            pool: Arc::clone(self),
        }
    }

    async fn acquire(self: &Arc<Self>) -> PoolResult<PooledInterpreter> {
        self.counters.total_requests.fetch_add(1, Ordering::Relaxed);
        self.requests.record(Instant::now());
        let mut waited = false;

        loop {
            if self.is_closed() {
                return Err(PoolError::Closed);
            }

            if let Ok(permit) = self.idle_permits.try_acquire() {
                permit.forget();
                if let Some(interp) = self.checkout_idle() {
                    return Ok(self.into_lease(interp));
                }
                continue;
            }

            if let Some(slot) = self.try_reserve() {
                let interp = self.create(slot).await?;
                debug!(id = interp.id(), "created interpreter on demand");
                return Ok(self.into_lease(interp));
            }

            if !waited {
                waited = true;
                self.counters.wait_count.fetch_add(1, Ordering::Relaxed);
            }
            let mut shutdown = self.shutdown_tx.subscribe();
            let permit = tokio::select! {
                permit = self.idle_permits.acquire() => permit.map_err(|_| PoolError::Closed)?,
                _ = shutdown.wait_for(|closed| *closed) => return Err(PoolError::Closed),
            };
            permit.forget();
            if let Some(interp) = self.checkout_idle() {
                return Ok(self.into_lease(interp));
            }
        }
    }

    fn put_back(self: &Arc<Self>, mut interp: Interpreter) {
        let id = interp.id();
        let now = Instant::now();
        let started = self.borrowed.lock().expect("borrowed lock").remove(&id);
        self.in_use.fetch_sub(1, Ordering::SeqCst);
        self.load.end(id, now);
        let held_ms = started.map_or(0, |s| now.saturating_duration_since(s).as_millis() as u64);

        if self.is_closed() {
            self.destroy(interp);
            return;
        }

        if let Some(max_uses) = self.config.max_uses
            && interp.use_count() >= max_uses
        {
            self.counters.total_recycled.fetch_add(1, Ordering::Relaxed);
            debug!(id, uses = interp.use_count(), "interpreter reached max uses; recycling");
            self.destroy(interp);
            self.replace();
            return;
        }

        if let Err(err) = interp.reset() {
            self.counters.total_recycled.fetch_add(1, Ordering::Relaxed);
            warn!(id, error = %err, "interpreter reset failed; replacing");
            self.destroy(interp);
            self.replace();
            return;
        }

        interp.mark_returned(now);
        self.add_idle(interp);
        debug!(id, held_ms, "interpreter returned");
    }

    fn add_idle(&self, interp: Interpreter) {
        let mut idle = self.idle.lock().expect("idle lock");
        if self.is_closed() {
            drop(idle);
            self.destroy(interp);
            return;
        }
        idle.push_back(interp);
        self.available.fetch_add(1, Ordering::SeqCst);
        drop(idle);
        self.idle_permits.add_permits(1);
    }

    fn destroy(&self, interp: Interpreter) {
        let id = interp.id();
        self.load.remove(id);
        drop(interp);
        self.total.fetch_sub(1, Ordering::SeqCst);
        self.counters.total_destroyed.fetch_add(1, Ordering::Relaxed);
        debug!(id, "interpreter destroyed");
    }

    /// Start a replacement for a discarded interpreter without blocking.
    fn replace(self: &Arc<Self>) {
        if self.is_closed() {
            return;
        }
        if let Some(slot) = self.try_reserve() {
            self.spawn_replacement(slot);
        }
    }

    fn spawn_replacement(self: &Arc<Self>, slot: Slot) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let shared = Arc::clone(self);
                handle.spawn(async move {
                    match shared.create(slot).await {
                        Ok(interp) => shared.add_idle(interp),
                        Err(err) => warn!(error = %err, "replacement interpreter creation failed"),
                    }
                });
            }
            Err(_) => match self.create_now(slot) {
                Ok(interp) => self.add_idle(interp),
                Err(err) => warn!(error = %err, "replacement interpreter creation failed"),
            },
        }
    }

    /// Schedule up to `count` background creations. Returns how many were
    /// scheduled.
    fn grow(self: &Arc<Self>, count: usize) -> usize {
        let mut scheduled = 0;
        for _ in 0..count {
            if self.is_closed() {
                break;
            }
            let Some(slot) = self.try_reserve() else {
                break;
            };
            let shared = Arc::clone(self);
            tokio::spawn(async move {
                match shared.create(slot).await {
                    Ok(interp) => {
                        shared
                            .counters
                            .predicted_scale_ups
                            .fetch_add(1, Ordering::Relaxed);
                        shared.add_idle(interp);
                    }
                    Err(err) => warn!(error = %err, "predictive scale-up creation failed"),
                }
            });
            scheduled += 1;
        }
        scheduled
    }

    /// Destroy up to `count` idle interpreters, never going below
    /// `min_size`.
    fn shrink(&self, count: usize) -> usize {
        let mut removed = 0;
        while removed < count {
            if self.total.load(Ordering::SeqCst) <= self.config.min_size {
                break;
            }
            let Ok(permit) = self.idle_permits.try_acquire() else {
                break;
            };
            permit.forget();
            let popped = {
                let mut idle = self.idle.lock().expect("idle lock");
                let popped = idle.pop_back();
                if popped.is_some() {
                    self.available.fetch_sub(1, Ordering::SeqCst);
                }
                popped
            };
            let Some(interp) = popped else {
                error!("idle permit granted but idle set is empty");
                break;
            };
            self.destroy(interp);
            self.counters
                .predicted_scale_downs
                .fetch_add(1, Ordering::Relaxed);
            removed += 1;
        }
        removed
    }

    /// Evict idle interpreters unused past `idle_timeout` or below
    /// `health_threshold`, then start replacements up to `min_size`.
    /// Returns how many were evicted.
    fn sweep(self: &Arc<Self>, now: Instant) -> usize {
        let config = &self.config;
        let expired: Vec<Interpreter> = {
            let mut idle = self.idle.lock().expect("idle lock");
            let mut expired = Vec::new();
            let mut index = 0;
            while index < idle.len() {
                let interp = &idle[index];
                let stale = now.saturating_duration_since(interp.last_used()) > config.idle_timeout
                    || interp.health(now) < config.health_threshold;
                if !stale {
                    index += 1;
                    continue;
                }
                // Permits already taken belong to getters about to pop.
                let Ok(permit) = self.idle_permits.try_acquire() else {
                    break;
                };
                permit.forget();
                if let Some(interp) = idle.remove(index) {
                    self.available.fetch_sub(1, Ordering::SeqCst);
                    expired.push(interp);
                }
            }
            expired
        };

        let evicted = expired.len();
        for interp in expired {
            debug!(id = interp.id(), uses = interp.use_count(), "evicting idle interpreter");
            self.destroy(interp);
            self.counters.total_cleaned_up.fetch_add(1, Ordering::Relaxed);
        }

        while !self.is_closed() && self.total.load(Ordering::SeqCst) < config.min_size {
            let Some(slot) = self.try_reserve() else {
                break;
            };
            self.spawn_replacement(slot);
        }
        evicted
    }

    fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            in_use: self.in_use.load(Ordering::SeqCst),
            available: self.available.load(Ordering::SeqCst),
            min_size: self.config.min_size,
            max_size: self.config.max_size,
            request_rate: self.requests.count(Instant::now()) as f64,
        }
    }
}

/// The scaler's view of the pool. Holds only a weak reference so a
/// dropped pool stops the scaler.
struct PoolScaleTarget {
    shared: Weak<PoolShared>,
}

impl ScaleTarget for PoolScaleTarget {
    fn snapshot(&self) -> Option<PoolSnapshot> {
        let shared = self.shared.upgrade()?;
        if shared.is_closed() {
            return None;
        }
        Some(shared.snapshot())
    }

    fn scale_up(&self, count: usize) -> usize {
        self.shared.upgrade().map_or(0, |shared| shared.grow(count))
    }

    fn scale_down(&self, count: usize) -> usize {
        self.shared.upgrade().map_or(0, |shared| shared.shrink(count))
    }
}

/// Periodic idle/health sweep. Stops on shutdown or when the pool is gone.
async fn run_cleanup(shared: Weak<PoolShared>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                let evicted = shared.sweep(Instant::now());
                if evicted > 0 {
                    info!(evicted, "cleanup sweep evicted idle interpreters");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!("cleanup task stopped");
}

/// An interpreter on loan from the pool. Returned on drop.
pub struct PooledInterpreter {
    interp: Option<Interpreter>,
    pool: Arc<PoolShared>,
}

impl Deref for PooledInterpreter {
    type Target = Interpreter;

    fn deref(&self) -> &Interpreter {
        self.interp.as_ref().expect("lease holds its interpreter until drop")
    }
}

impl DerefMut for PooledInterpreter {
    fn deref_mut(&mut self) -> &mut Interpreter {
        self.interp.as_mut().expect("lease holds its interpreter until drop")
    }
}

impl Drop for PooledInterpreter {
    fn drop(&mut self) {
        if let Some(interp) = self.interp.take() {
            self.pool.put_back(interp);
        }
    }
}

/// A pool of reusable Lua interpreters. Cheap to clone.
#[derive(Clone)]
pub struct InterpreterPool {
    shared: Arc<PoolShared>,
}

impl InterpreterPool {
    /// Create a pool of sandboxed interpreters built from `config.limits`.
    pub async fn new(config: PoolConfig) -> PoolResult<Self> {
        let factory = Arc::new(LuaFactory::new(config.limits.clone()));
        Self::with_factory(config, factory).await
    }

    /// Create a pool with a custom factory.
    ///
    /// Populates `min_size` interpreters, then starts the predictive scaler
    /// and the pre-warm batch when enabled.
    pub async fn with_factory(
        config: PoolConfig,
        factory: Arc<dyn InterpreterFactory>,
    ) -> PoolResult<Self> {
        let config = config.normalized();
        config.validate()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let scaler = config
            .enable_predictive_scaling
            .then(|| PredictiveScaler::new(ScalerConfig::from(&config)));
        let memory = MemoryBlockPool::new(
            config.enable_memory_pooling,
            config.memory_pool_size,
            config.memory_block_size,
        );

        let shared = Arc::new(PoolShared {
            requests: RequestTracker::new(config.tunables.request_window),
            factory,
            idle: Mutex::new(VecDeque::with_capacity(config.max_size)),
            idle_permits: Semaphore::new(0),
            total: AtomicUsize::new(0),
            available: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
            borrowed: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            counters: Counters::default(),
            load: LoadTracker::new(),
            memory,
            closed: AtomicBool::new(false),
            shutdown_tx,
            scaler_task: Mutex::new(None),
            cleanup_task: Mutex::new(None),
            scaler_stats: scaler.as_ref().map(PredictiveScaler::stats),
            prewarm: tokio::sync::Mutex::new(None),
            config,
        });

        for _ in 0..shared.config.min_size {
            let Some(slot) = shared.try_reserve() else {
                break;
            };
            let interp = shared.create(slot).await?;
            shared.add_idle(interp);
        }

        let cleanup = tokio::spawn(run_cleanup(
            Arc::downgrade(&shared),
            shared.config.cleanup_interval,
            shutdown_rx.clone(),
        ));
        *shared.cleanup_task.lock().expect("cleanup task lock") = Some(cleanup);

        if let Some(scaler) = scaler {
            let target = PoolScaleTarget {
                shared: Arc::downgrade(&shared),
            };
            let handle = tokio::spawn(scaler.run(target, shutdown_rx));
            *shared.scaler_task.lock().expect("scaler task lock") = Some(handle);
        }

        let pool = Self { shared };
        let config = &pool.shared.config;
        if config.enable_pre_warming && config.pre_warm_on_init > 0 {
            let batch = prewarm::spawn_batch(&pool);
            *pool.shared.prewarm.lock().await = Some(batch);
        }

        info!(
            min = config.min_size,
            max = config.max_size,
            predictive_scaling = config.enable_predictive_scaling,
            pre_warm = config.enable_pre_warming,
            load_balancing = config.enable_load_balancing,
            "interpreter pool initialized"
        );
        Ok(pool)
    }

    /// The normalized configuration the pool runs with.
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Borrow an interpreter, waiting at most `acquire_timeout` if one is
    /// configured.
    pub async fn get(&self) -> PoolResult<PooledInterpreter> {
        match self.shared.config.acquire_timeout {
            Some(timeout) => self.get_timeout(timeout).await,
            None => self.shared.acquire().await,
        }
    }

    /// Borrow an interpreter, failing with `Exhausted` after `timeout`.
    pub async fn get_timeout(&self, timeout: Duration) -> PoolResult<PooledInterpreter> {
        tokio::time::timeout(timeout, self.shared.acquire())
            .await
            .map_err(|_| PoolError::Exhausted { waited: timeout })?
    }

    /// Borrow an interpreter unless `cancel` completes first.
    pub async fn get_or_cancel<F>(&self, cancel: F) -> PoolResult<PooledInterpreter>
    where
        F: Future,
    {
        tokio::select! {
            lease = self.get() => lease,
            _ = cancel => Err(PoolError::Canceled),
        }
    }

    /// Return an interpreter. Equivalent to dropping the lease.
    pub fn put(&self, lease: PooledInterpreter) {
        drop(lease);
    }

    /// True once `shutdown` has started.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Snapshot of the pool's gauges and counters.
    pub fn metrics(&self) -> PoolMetrics {
        let shared = &self.shared;
        let c = &shared.counters;
        PoolMetrics {
            available: shared.available.load(Ordering::SeqCst),
            in_use: shared.in_use.load(Ordering::SeqCst),
            total: shared.total.load(Ordering::SeqCst),
            min_size: shared.config.min_size,
            max_size: shared.config.max_size,
            total_created: c.total_created.load(Ordering::Relaxed),
            total_destroyed: c.total_destroyed.load(Ordering::Relaxed),
            total_recycled: c.total_recycled.load(Ordering::Relaxed),
            creation_failures: c.creation_failures.load(Ordering::Relaxed),
            wait_count: c.wait_count.load(Ordering::Relaxed),
            total_requests: c.total_requests.load(Ordering::Relaxed),
            prewarmed: c.prewarmed.load(Ordering::Relaxed),
            predicted_scale_ups: c.predicted_scale_ups.load(Ordering::Relaxed),
            predicted_scale_downs: c.predicted_scale_downs.load(Ordering::Relaxed),
            total_cleaned_up: c.total_cleaned_up.load(Ordering::Relaxed),
            scaler: shared.scaler_stats.as_ref().map(|s| s.snapshot()),
        }
    }

    /// Load statistics for one interpreter, if it has ever been borrowed.
    pub fn load_info(&self, id: u64) -> Option<StateLoadInfo> {
        self.shared.load.get(id)
    }

    /// Scratch buffers offered to callers, sized by the memory settings.
    pub fn memory_blocks(&self) -> &MemoryBlockPool {
        &self.shared.memory
    }

    pub(crate) fn record_prewarmed(&self) {
        self.shared.counters.prewarmed.fetch_add(1, Ordering::Relaxed);
    }

    /// Resolves once the start-up pre-warm batch has finished.
    pub async fn wait_for_prewarm(&self) {
        let mut batch = self.shared.prewarm.lock().await;
        if let Some(mut set) = batch.take() {
            while let Some(result) = set.join_next().await {
                if let Err(err) = result {
                    warn!(error = %err, "pre-warm task failed");
                }
            }
            info!(
                prewarmed = self.shared.counters.prewarmed.load(Ordering::Relaxed),
                "pre-warm complete"
            );
        }
    }

    /// Stop the background tasks, finish pre-warming, wait up to `timeout`
    /// for borrowed interpreters, then destroy everything.
    ///
    /// Later `get` calls fail with `Closed`. Interpreters returned after the
    /// deadline are destroyed on return.
    pub async fn shutdown(&self, timeout: Duration) -> PoolResult<()> {
        let shared = &self.shared;
        if shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(timeout = ?timeout, "interpreter pool shutting down");
        shared.shutdown_tx.send_replace(true);

        let scaler = shared.scaler_task.lock().expect("scaler task lock").take();
        if let Some(handle) = scaler
            && let Err(err) = handle.await
        {
            warn!(error = %err, "predictive scaler task failed");
        }
        let cleanup = shared.cleanup_task.lock().expect("cleanup task lock").take();
        if let Some(handle) = cleanup
            && let Err(err) = handle.await
        {
            warn!(error = %err, "cleanup task failed");
        }

        self.wait_for_prewarm().await;

        let deadline = Instant::now() + timeout;
        let mut stuck = None;
        loop {
            let in_use = shared.in_use.load(Ordering::SeqCst);
            if in_use == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!(in_use, "shutdown timeout expired with interpreters still borrowed");
                stuck = Some(in_use);
                break;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        shared.idle_permits.close();
        let drained: Vec<Interpreter> = {
            let mut idle = shared.idle.lock().expect("idle lock");
            shared.available.store(0, Ordering::SeqCst);
            idle.drain(..).collect()
        };
        let destroyed = drained.len();
        for interp in drained {
            shared.destroy(interp);
        }
        shared.memory.clear();
        info!(destroyed, "interpreter pool shut down");

        match stuck {
            Some(in_use) => Err(PoolError::ShutdownTimeout { in_use }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InterpreterError;
    use mlua::Value;
    use spellpool_core::ResourceLimits;

    /// Wraps `LuaFactory`, counting creations and failing on demand.
    struct MockFactory {
        inner: LuaFactory,
        created: AtomicU64,
        fail: AtomicBool,
    }

    impl MockFactory {
        fn new(limits: ResourceLimits) -> Arc<Self> {
            Arc::new(Self {
                inner: LuaFactory::new(limits),
                created: AtomicU64::new(0),
                fail: AtomicBool::new(false),
            })
        }

        fn created(&self) -> u64 {
            self.created.load(Ordering::SeqCst)
        }
    }

    impl InterpreterFactory for MockFactory {
        fn create(&self, id: u64) -> Result<Interpreter, InterpreterError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(InterpreterError::Create("mock failure".into()));
            }
            self.created.fetch_add(1, Ordering::SeqCst);
            self.inner.create(id)
        }
    }

    fn config(min: usize, max: usize) -> PoolConfig {
        PoolConfig {
            min_size: min,
            max_size: max,
            ..PoolConfig::default()
        }
    }

    async fn make_pool(config: PoolConfig) -> (InterpreterPool, Arc<MockFactory>) {
        let factory = MockFactory::new(config.limits.clone());
        let pool = InterpreterPool::with_factory(config, factory.clone())
            .await
            .unwrap();
        (pool, factory)
    }

    // ── Construction ──

    #[tokio::test]
    async fn new_prepopulates_min_size() {
        let (pool, factory) = make_pool(config(3, 5)).await;
        let m = pool.metrics();
        assert_eq!(m.available, 3);
        assert_eq!(m.in_use, 0);
        assert_eq!(m.total, 3);
        assert_eq!(factory.created(), 3);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let mut cfg = config(1, 2);
        cfg.scale_up_threshold = 0.1;
        cfg.scale_down_threshold = 0.5;
        let factory = MockFactory::new(ResourceLimits::default());
        let err = InterpreterPool::with_factory(cfg, factory).await.err().unwrap();
        assert!(matches!(err, PoolError::Config(_)));
    }

    #[tokio::test]
    async fn failing_factory_fails_construction() {
        let factory = MockFactory::new(ResourceLimits::default());
        factory.fail.store(true, Ordering::SeqCst);
        let err = InterpreterPool::with_factory(config(1, 2), factory)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, PoolError::CreationFailed(_)));
    }

    // ── Get / put ──

    #[tokio::test]
    async fn idle_interpreters_are_reused_without_creation() {
        let (pool, factory) = make_pool(config(2, 5)).await;
        let a = pool.get().await.unwrap();
        let b = pool.get().await.unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(factory.created(), 2);
        assert_eq!(pool.metrics().in_use, 2);
        assert_eq!(pool.metrics().available, 0);

        drop(a);
        pool.put(b);
        let m = pool.metrics();
        assert_eq!((m.available, m.in_use), (2, 0));
    }

    #[tokio::test]
    async fn creates_lazily_up_to_max_then_times_out() {
        let (pool, factory) = make_pool(config(1, 2)).await;
        let _a = pool.get().await.unwrap();
        let _b = pool.get().await.unwrap();
        assert_eq!(factory.created(), 2);

        let err = pool
            .get_timeout(Duration::from_millis(50))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, PoolError::Exhausted { .. }));
        assert_eq!(pool.metrics().total, 2);
        assert_eq!(pool.metrics().wait_count, 1);
    }

    #[tokio::test]
    async fn waiter_is_woken_by_put() {
        let (pool, _) = make_pool(config(1, 1)).await;
        let held = pool.get().await.unwrap();
        let held_id = held.id();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.get().await.map(|lease| lease.id()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got, held_id);
    }

    #[tokio::test]
    async fn configured_acquire_timeout_applies_to_get() {
        let mut cfg = config(1, 1);
        cfg.acquire_timeout = Some(Duration::from_millis(30));
        let (pool, _) = make_pool(cfg).await;
        let _held = pool.get().await.unwrap();
        assert!(matches!(
            pool.get().await.err().unwrap(),
            PoolError::Exhausted { .. }
        ));
    }

    #[tokio::test]
    async fn cancel_does_not_leak_reservation() {
        let (pool, _) = make_pool(config(1, 1)).await;
        let held = pool.get().await.unwrap();
        let err = pool
            .get_or_cancel(tokio::time::sleep(Duration::from_millis(20)))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, PoolError::Canceled));
        drop(held);

        let m = pool.metrics();
        assert_eq!((m.available, m.in_use, m.total), (1, 0, 1));
        assert!(pool.get_timeout(Duration::from_millis(50)).await.is_ok());
    }

    #[tokio::test]
    async fn creation_failure_releases_reservation() {
        let (pool, factory) = make_pool(config(0, 1)).await;
        factory.fail.store(true, Ordering::SeqCst);
        let err = pool.get().await.err().unwrap();
        assert!(matches!(err, PoolError::CreationFailed(_)));
        assert_eq!(pool.metrics().total, 0);
        assert_eq!(pool.metrics().creation_failures, 1);

        factory.fail.store(false, Ordering::SeqCst);
        assert!(pool.get().await.is_ok());
    }

    // ── Reset and recycling ──

    #[tokio::test]
    async fn returned_interpreter_is_reset() {
        let (pool, _) = make_pool(config(1, 1)).await;
        {
            let mut lease = pool.get().await.unwrap();
            lease.exec("leftover = 42").unwrap();
        }
        let mut lease = pool.get().await.unwrap();
        assert!(lease.eval("return leftover").unwrap().is_nil());
    }

    #[tokio::test]
    async fn max_uses_recycles_interpreter() {
        let mut cfg = config(1, 1);
        cfg.max_uses = Some(2);
        let (pool, factory) = make_pool(cfg).await;

        let first = pool.get().await.unwrap().id();
        let second = pool.get().await.unwrap().id();
        assert_eq!(first, second);

        let third = pool.get().await.unwrap();
        assert_ne!(third.id(), first);
        assert_eq!(factory.created(), 2);
        let m = pool.metrics();
        assert_eq!(m.total_recycled, 1);
        assert_eq!(m.total_destroyed, 1);
    }

    #[tokio::test]
    async fn tainted_interpreter_is_replaced() {
        let mut cfg = config(1, 1);
        cfg.limits.instruction_limit = 20_000;
        cfg.limits.hook_interval = 100;
        let (pool, factory) = make_pool(cfg).await;

        let original = {
            let mut lease = pool.get().await.unwrap();
            assert!(lease.exec("while true do end").is_err());
            lease.id()
        };
        let replacement = pool.get_timeout(Duration::from_secs(2)).await.unwrap();
        assert_ne!(replacement.id(), original);
        assert_eq!(factory.created(), 2);
        assert_eq!(pool.metrics().total_recycled, 1);
    }

    #[tokio::test]
    async fn library_tampering_does_not_reach_next_borrower() {
        let (pool, _) = make_pool(config(1, 1)).await;
        {
            let mut lease = pool.get().await.unwrap();
            lease
                .exec(
                    "string.upper = function() return 'pwned' end; \
                     setmetatable(_G, {__index = function() return 'ghost' end})",
                )
                .unwrap();
        }
        let mut lease = pool.get().await.unwrap();
        let (up, ghost): (String, Value) = lease
            .eval_multi("return string.upper('ok'), missing_global")
            .unwrap();
        assert_eq!(up, "OK");
        assert!(ghost.is_nil());
    }

    // ── Cleanup ──

    async fn wait_for_available(pool: &InterpreterPool, expected: usize) {
        for _ in 0..200 {
            if pool.metrics().available == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("pool never reached {expected} idle interpreters");
    }

    #[tokio::test]
    async fn sweep_evicts_expired_and_refills_to_min() {
        let (pool, factory) = make_pool(config(2, 4)).await;
        let leases: Vec<_> = {
            let mut leases = Vec::new();
            for _ in 0..4 {
                leases.push(pool.get().await.unwrap());
            }
            leases
        };
        drop(leases);
        assert_eq!(pool.metrics().available, 4);

        assert_eq!(pool.shared.sweep(Instant::now()), 0);
        let later = Instant::now() + Duration::from_secs(11 * 60);
        assert_eq!(pool.shared.sweep(later), 4);
        assert_eq!(pool.metrics().total_cleaned_up, 4);

        wait_for_available(&pool, 2).await;
        let m = pool.metrics();
        assert_eq!(m.total, 2);
        assert_eq!(factory.created(), 6);
    }

    #[tokio::test]
    async fn sweep_evicts_worn_interpreters() {
        let mut cfg = config(1, 1);
        cfg.health_threshold = 0.95;
        let (pool, factory) = make_pool(cfg).await;
        let worn = {
            let mut id = 0;
            for _ in 0..201 {
                id = pool.get().await.unwrap().id();
            }
            id
        };
        assert_eq!(pool.shared.sweep(Instant::now()), 1);
        wait_for_available(&pool, 1).await;
        let fresh = pool.get().await.unwrap();
        assert_ne!(fresh.id(), worn);
        assert_eq!(factory.created(), 2);
    }

    #[tokio::test]
    async fn sweep_skips_permits_held_by_getters() {
        let (pool, _) = make_pool(config(0, 2)).await;
        drop(pool.get().await.unwrap());
        let permit = pool.shared.idle_permits.try_acquire().unwrap();
        let later = Instant::now() + Duration::from_secs(11 * 60);
        assert_eq!(pool.shared.sweep(later), 0);
        drop(permit);
        assert_eq!(pool.shared.sweep(later), 1);
        assert_eq!(pool.metrics().total, 0);
    }

    #[tokio::test]
    async fn cleanup_task_runs_on_interval() {
        let mut cfg = config(1, 3);
        cfg.idle_timeout = Duration::from_millis(30);
        cfg.cleanup_interval = Duration::from_millis(20);
        let (pool, _) = make_pool(cfg).await;
        let leases = vec![
            pool.get().await.unwrap(),
            pool.get().await.unwrap(),
            pool.get().await.unwrap(),
        ];
        drop(leases);

        for _ in 0..200 {
            if pool.metrics().total_cleaned_up >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(pool.metrics().total_cleaned_up >= 3);
        assert!(pool.metrics().total <= 3);
        assert!(pool.get_timeout(Duration::from_secs(2)).await.is_ok());
        pool.shutdown(Duration::from_millis(200)).await.unwrap();
    }

    // ── Load balancing ──

    #[tokio::test]
    async fn load_balancing_prefers_least_used() {
        let mut cfg = config(2, 2);
        cfg.enable_load_balancing = true;
        let (pool, _) = make_pool(cfg).await;

        let x = pool.get().await.unwrap();
        let y = pool.get().await.unwrap();
        let busy = x.id();
        let quiet = y.id();
        drop(x);
        let again = pool.get().await.unwrap();
        assert_eq!(again.id(), busy);
        drop(again);
        drop(y);

        assert_eq!(pool.load_info(busy).unwrap().execution_count, 2);
        assert_eq!(pool.load_info(quiet).unwrap().execution_count, 1);
        let next = pool.get().await.unwrap();
        assert_eq!(next.id(), quiet);
    }

    // ── Scaling hooks ──

    #[tokio::test]
    async fn shrink_respects_min_size() {
        let (pool, _) = make_pool(config(2, 5)).await;
        let extra: Vec<_> = {
            let mut leases = Vec::new();
            for _ in 0..4 {
                leases.push(pool.get().await.unwrap());
            }
            leases
        };
        drop(extra);
        assert_eq!(pool.metrics().available, 4);

        assert_eq!(pool.shared.shrink(10), 2);
        let m = pool.metrics();
        assert_eq!((m.available, m.total), (2, 2));
        assert_eq!(m.predicted_scale_downs, 2);
    }

    #[tokio::test]
    async fn grow_respects_max_size() {
        let (pool, _) = make_pool(config(1, 3)).await;
        assert_eq!(pool.shared.grow(5), 2);
        for _ in 0..100 {
            if pool.metrics().available == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let m = pool.metrics();
        assert_eq!((m.available, m.total), (3, 3));
        assert_eq!(m.predicted_scale_ups, 2);
    }

    #[test]
    fn request_tracker_counts_trailing_window() {
        let tracker = RequestTracker::new(Duration::from_secs(60));
        let t0 = Instant::now();
        tracker.record(t0);
        tracker.record(t0 + Duration::from_secs(30));
        assert_eq!(tracker.count(t0 + Duration::from_secs(40)), 2);
        assert_eq!(tracker.count(t0 + Duration::from_secs(61)), 1);
        assert_eq!(tracker.count(t0 + Duration::from_secs(200)), 0);
    }

    // ── Shutdown ──

    #[tokio::test]
    async fn shutdown_closes_pool() {
        let (pool, _) = make_pool(config(2, 2)).await;
        pool.shutdown(Duration::from_millis(100)).await.unwrap();
        assert!(pool.is_closed());
        assert!(matches!(pool.get().await.err().unwrap(), PoolError::Closed));
        let m = pool.metrics();
        assert_eq!((m.available, m.total), (0, 0));
        assert!(pool.shutdown(Duration::from_millis(10)).await.is_ok());
    }

    #[tokio::test]
    async fn shutdown_times_out_with_borrowed_interpreter() {
        let (pool, _) = make_pool(config(1, 1)).await;
        let held = pool.get().await.unwrap();
        let err = pool
            .shutdown(Duration::from_millis(60))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, PoolError::ShutdownTimeout { in_use: 1 }));

        drop(held);
        assert_eq!(pool.metrics().total, 0);
    }

    #[tokio::test]
    async fn shutdown_wakes_waiters() {
        let (pool, _) = make_pool(config(1, 1)).await;
        let held = pool.get().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.get().await.map(|lease| lease.id()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let stopper = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.shutdown(Duration::from_millis(500)).await })
        };
        assert!(matches!(waiter.await.unwrap(), Err(PoolError::Closed)));
        drop(held);
        assert!(stopper.await.unwrap().is_ok());
    }
}
