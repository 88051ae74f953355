//! spellpool-autoscale — predictive interpreter pool scaling.
//!
//! Samples the pool every `prediction_interval`, keeps a sliding window of
//! usage ratios, and scales ahead of demand.
//!
//! # Scaling Algorithm
//!
//! ```text
//! usage      = in_use / (in_use + available)      (tick skipped if pool empty)
//! prediction = OLS line over the window, one step ahead
//!              (0.5 while fewer than 3 samples)
//!              x 1.1 if request rate grew by more than 20%
//!              clamped to [0, 1]
//!
//! if prediction > up:
//!     target = ceil(current * (1 + prediction - up))
//!     ScaleUp(min(target - current, max_predicted_scale_up, max - current))
//!
//! if prediction < down and usage < down:
//!     ScaleDown(max(1, floor(available * 0.2)))   never below min
//! ```
//!
//! With adaptive thresholds enabled, a full window with high usage variance
//! narrows the band and a calm one widens it.

pub mod predict;
pub mod scaler;

pub use predict::{Thresholds, UsagePattern, UsageWindow, adjust_thresholds, predict_usage};
pub use scaler::{
    PoolSnapshot, PredictiveScaler, ScaleDecision, ScaleTarget, ScalerConfig, ScalerStats,
    ScalerStatsSnapshot,
};
