//! Usage history and the prediction / threshold heuristics.

use std::collections::VecDeque;
use std::time::Instant;

use spellpool_core::ScalingTunables;

/// One observation of the pool, recorded every prediction tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UsagePattern {
    pub timestamp: Instant,
    pub in_use: usize,
    pub available: usize,
    pub request_rate: f64,
}

impl UsagePattern {
    /// Fraction of instances in use. An empty pool reports 0.
    pub fn usage(&self) -> f64 {
        let total = self.in_use + self.available;
        if total == 0 {
            0.0
        } else {
            self.in_use as f64 / total as f64
        }
    }
}

/// Fixed-capacity FIFO of usage samples.
#[derive(Debug, Clone)]
pub struct UsageWindow {
    capacity: usize,
    samples: VecDeque<UsagePattern>,
}

impl UsageWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, pattern: UsagePattern) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(pattern);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<&UsagePattern> {
        self.samples.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &UsagePattern> {
        self.samples.iter()
    }
}

/// Extrapolate usage one tick ahead with an ordinary least-squares line.
///
/// With fewer than `min_history` samples the prediction is a neutral 0.5.
/// A request-rate surge between the last two samples boosts the result.
/// The output is always within `[0, 1]`.
pub fn predict_usage(window: &UsageWindow, tunables: &ScalingTunables) -> f64 {
    let n = window.len();
    if n < tunables.min_history.max(2) {
        return 0.5;
    }

    let nf = n as f64;
    let (mut sum_x, mut sum_y, mut sum_xy, mut sum_x2) = (0.0, 0.0, 0.0, 0.0);
    for (i, pattern) in window.iter().enumerate() {
        let x = i as f64;
        let y = pattern.usage();
        sum_x += x;
        sum_y += y;
        sum_xy += x * y;
        sum_x2 += x * x;
    }

    let slope = (nf * sum_xy - sum_x * sum_y) / (nf * sum_x2 - sum_x * sum_x);
    let intercept = (sum_y - slope * sum_x) / nf;
    let mut predicted = slope * nf + intercept;

    let mut recent = window.samples.iter().rev();
    if let (Some(latest), Some(previous)) = (recent.next(), recent.next())
        && latest.request_rate > previous.request_rate * tunables.surge_ratio
    {
        predicted *= tunables.surge_boost;
    }

    if predicted.is_nan() {
        return 0.5;
    }
    predicted.clamp(0.0, 1.0)
}

/// Population variance of the usage ratios in the window.
pub fn usage_variance(window: &UsageWindow) -> f64 {
    if window.is_empty() {
        return 0.0;
    }
    let n = window.len() as f64;
    let mean = window.iter().map(UsagePattern::usage).sum::<f64>() / n;
    window
        .iter()
        .map(|p| {
            let d = p.usage() - mean;
            d * d
        })
        .sum::<f64>()
        / n
}

/// The live scale-up / scale-down band.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub scale_up: f64,
    pub scale_down: f64,
}

/// Narrow the band under high variance, widen it under low variance.
///
/// Only runs once the window is full. Both thresholds stay within
/// `[threshold_floor, threshold_ceiling]` and the band never inverts.
pub fn adjust_thresholds(
    current: Thresholds,
    window: &UsageWindow,
    tunables: &ScalingTunables,
) -> Thresholds {
    if !window.is_full() {
        return current;
    }

    let variance = usage_variance(window);
    let step = tunables.threshold_step;
    let (up, down) = if variance > tunables.high_variance {
        (current.scale_up - step, current.scale_down + step)
    } else if variance < tunables.low_variance {
        (current.scale_up + step, current.scale_down - step)
    } else {
        return current;
    };

    let floor = tunables.threshold_floor;
    let ceiling = tunables.threshold_ceiling;
    let next = Thresholds {
        scale_up: up.clamp(floor, ceiling),
        scale_down: down.clamp(floor, ceiling),
    };
    if next.scale_down >= next.scale_up {
        return current;
    }
    next
}
