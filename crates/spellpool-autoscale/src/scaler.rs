//! Periodic usage sampling and scale decisions.
//!
//! Each tick samples the target pool, appends a `UsagePattern`, predicts the
//! next tick's usage and asks the target to grow or shrink. The actual
//! instance creation and destruction is done by the `ScaleTarget`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use spellpool_core::{PoolConfig, ScalingTunables};

use crate::predict::{Thresholds, UsagePattern, UsageWindow, adjust_thresholds, predict_usage};

/// A scaling decision for one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    /// Add this many instances.
    ScaleUp(usize),
    /// Remove this many idle instances.
    ScaleDown(usize),
    /// No change needed.
    NoChange,
}

/// Point-in-time view of the pool handed to the scaler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolSnapshot {
    pub in_use: usize,
    pub available: usize,
    pub min_size: usize,
    pub max_size: usize,
    /// `get` calls in the trailing request window.
    pub request_rate: f64,
}

/// The pool side of the scaler.
pub trait ScaleTarget: Send + Sync {
    /// Current state, or `None` once the pool is gone and the loop should stop.
    fn snapshot(&self) -> Option<PoolSnapshot>;

    /// Start creating up to `count` instances. Returns how many were scheduled.
    fn scale_up(&self, count: usize) -> usize;

    /// Remove up to `count` idle instances. Returns how many were removed.
    fn scale_down(&self, count: usize) -> usize;
}

/// Scaler parameters, usually derived from a `PoolConfig`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalerConfig {
    pub interval: Duration,
    pub window_size: usize,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub max_predicted_scale_up: usize,
    pub adaptive_thresholds: bool,
    pub tunables: ScalingTunables,
}

impl From<&PoolConfig> for ScalerConfig {
    fn from(config: &PoolConfig) -> Self {
        Self {
            interval: config.prediction_interval,
            window_size: config.prediction_window_size,
            scale_up_threshold: config.scale_up_threshold,
            scale_down_threshold: config.scale_down_threshold,
            max_predicted_scale_up: config.max_predicted_scale_up,
            adaptive_thresholds: config.enable_adaptive_thresholds,
            tunables: config.tunables.clone(),
        }
    }
}

/// Counters shared between the scaler task and metrics readers.
#[derive(Debug, Default)]
pub struct ScalerStats {
    ticks: AtomicU64,
    scale_ups: AtomicU64,
    scale_downs: AtomicU64,
    instances_requested: AtomicU64,
    instances_removed: AtomicU64,
    last_prediction: AtomicU64,
    scale_up_threshold: AtomicU64,
    scale_down_threshold: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScalerStatsSnapshot {
    pub ticks: u64,
    pub scale_ups: u64,
    pub scale_downs: u64,
    pub instances_requested: u64,
    pub instances_removed: u64,
    pub last_prediction: f64,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
}

impl ScalerStats {
    fn store_f64(cell: &AtomicU64, v: f64) {
        cell.store(v.to_bits(), Ordering::Relaxed);
    }

    fn load_f64(cell: &AtomicU64) -> f64 {
        f64::from_bits(cell.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> ScalerStatsSnapshot {
        ScalerStatsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            scale_ups: self.scale_ups.load(Ordering::Relaxed),
            scale_downs: self.scale_downs.load(Ordering::Relaxed),
            instances_requested: self.instances_requested.load(Ordering::Relaxed),
            instances_removed: self.instances_removed.load(Ordering::Relaxed),
            last_prediction: Self::load_f64(&self.last_prediction),
            scale_up_threshold: Self::load_f64(&self.scale_up_threshold),
            scale_down_threshold: Self::load_f64(&self.scale_down_threshold),
        }
    }
}

/// Predicts pool usage from a sliding window and scales ahead of demand.
pub struct PredictiveScaler {
    config: ScalerConfig,
    window: UsageWindow,
    thresholds: Thresholds,
    stats: Arc<ScalerStats>,
}

impl PredictiveScaler {
    pub fn new(config: ScalerConfig) -> Self {
        let thresholds = Thresholds {
            scale_up: config.scale_up_threshold,
            scale_down: config.scale_down_threshold,
        };
        let stats = Arc::new(ScalerStats::default());
        ScalerStats::store_f64(&stats.scale_up_threshold, thresholds.scale_up);
        ScalerStats::store_f64(&stats.scale_down_threshold, thresholds.scale_down);
        ScalerStats::store_f64(&stats.last_prediction, 0.5);
        Self {
            window: UsageWindow::new(config.window_size),
            config,
            thresholds,
            stats,
        }
    }

    pub fn stats(&self) -> Arc<ScalerStats> {
        self.stats.clone()
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    pub fn window(&self) -> &UsageWindow {
        &self.window
    }

    /// Record one sample and decide what to do.
    ///
    /// An empty pool is skipped entirely: nothing is recorded.
    pub fn tick(&mut self, snapshot: PoolSnapshot, now: Instant) -> ScaleDecision {
        let current = snapshot.in_use + snapshot.available;
        if current == 0 {
            return ScaleDecision::NoChange;
        }
        self.stats.ticks.fetch_add(1, Ordering::Relaxed);

        let pattern = UsagePattern {
            timestamp: now,
            in_use: snapshot.in_use,
            available: snapshot.available,
            request_rate: snapshot.request_rate,
        };
        let usage = pattern.usage();
        self.window.push(pattern);

        let prediction = predict_usage(&self.window, &self.config.tunables);
        ScalerStats::store_f64(&self.stats.last_prediction, prediction);

        let decision = self.decide(snapshot, usage, prediction);

        if self.config.adaptive_thresholds {
            let next = adjust_thresholds(self.thresholds, &self.window, &self.config.tunables);
            if next != self.thresholds {
                debug!(
                    scale_up = next.scale_up,
                    scale_down = next.scale_down,
                    "adjusted scaling thresholds"
                );
                self.thresholds = next;
                ScalerStats::store_f64(&self.stats.scale_up_threshold, next.scale_up);
                ScalerStats::store_f64(&self.stats.scale_down_threshold, next.scale_down);
            }
        }

        debug!(
            in_use = snapshot.in_use,
            available = snapshot.available,
            usage,
            prediction,
            ?decision,
            "prediction tick"
        );
        decision
    }

    fn decide(&self, snapshot: PoolSnapshot, usage: f64, prediction: f64) -> ScaleDecision {
        let current = snapshot.in_use + snapshot.available;

        if prediction > self.thresholds.scale_up {
            let factor = 1.0 + (prediction - self.thresholds.scale_up);
            let target = (current as f64 * factor).ceil() as usize;
            let headroom = snapshot.max_size.saturating_sub(current);
            let add = target
                .saturating_sub(current)
                .max(1)
                .min(self.config.max_predicted_scale_up)
                .min(headroom);
            return if add > 0 {
                ScaleDecision::ScaleUp(add)
            } else {
                ScaleDecision::NoChange
            };
        }

        if prediction < self.thresholds.scale_down && usage < self.thresholds.scale_down {
            let removable = snapshot
                .available
                .min(current.saturating_sub(snapshot.min_size));
            if removable == 0 {
                return ScaleDecision::NoChange;
            }
            let fraction = self.config.tunables.scale_down_fraction;
            let remove = ((snapshot.available as f64 * fraction).floor() as usize)
                .max(1)
                .min(removable);
            return ScaleDecision::ScaleDown(remove);
        }

        ScaleDecision::NoChange
    }

    /// Sample `target`, decide, and apply. Returns `None` when the target
    /// is gone.
    pub fn evaluate<T: ScaleTarget + ?Sized>(&mut self, target: &T) -> Option<ScaleDecision> {
        let snapshot = target.snapshot()?;
        let decision = self.tick(snapshot, Instant::now());
        match decision {
            ScaleDecision::ScaleUp(n) => {
                let scheduled = target.scale_up(n);
                self.stats.scale_ups.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .instances_requested
                    .fetch_add(scheduled as u64, Ordering::Relaxed);
                info!(requested = n, scheduled, "predictive scale up");
            }
            ScaleDecision::ScaleDown(n) => {
                let removed = target.scale_down(n);
                self.stats.scale_downs.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .instances_removed
                    .fetch_add(removed as u64, Ordering::Relaxed);
                info!(requested = n, removed, "predictive scale down");
            }
            ScaleDecision::NoChange => {}
        }
        Some(decision)
    }

    /// Run the scaler loop until `shutdown` fires or the target goes away.
    pub async fn run<T: ScaleTarget>(
        mut self,
        target: T,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let interval = self.config.interval;
        info!(interval_ms = interval.as_millis() as u64, "predictive scaler started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if self.evaluate(&target).is_none() {
                        info!("scale target dropped; predictive scaler stopping");
                        break;
                    }
                }
                _ = shutdown.changed() => {
                    info!("predictive scaler shutting down");
                    break;
                }
            }
        }
    }
}
