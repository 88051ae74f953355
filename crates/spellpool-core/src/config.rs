//! spellpool.toml configuration.
//!
//! Every field has a default, so an empty file is a valid configuration.
//! Durations are written as strings such as `"250ms"`, `"30s"` or `"5m"`.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid duration: {0:?}")]
    InvalidDuration(String),

    #[error("unknown load profile: {0}")]
    UnknownProfile(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Pool and scaling configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub min_size: usize,
    pub max_size: usize,

    pub enable_predictive_scaling: bool,
    pub prediction_window_size: usize,
    #[serde(with = "duration_str")]
    pub prediction_interval: Duration,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub max_predicted_scale_up: usize,
    pub enable_adaptive_thresholds: bool,

    pub enable_pre_warming: bool,
    pub pre_warm_on_init: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_warm_script: Option<String>,
    #[serde(with = "duration_str")]
    pub pre_warm_timeout: Duration,

    pub enable_memory_pooling: bool,
    pub memory_pool_size: usize,
    pub memory_block_size: usize,

    pub enable_load_balancing: bool,

    /// Upper bound on how long `get` waits when no deadline is given.
    #[serde(with = "opt_duration_str", skip_serializing_if = "Option::is_none")]
    pub acquire_timeout: Option<Duration>,
    /// Recycle an instance after this many borrows.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_uses: Option<u64>,

    /// Idle instances unused for longer than this are evicted.
    #[serde(with = "duration_str")]
    pub idle_timeout: Duration,
    /// Idle instances whose health falls below this are evicted.
    pub health_threshold: f64,
    /// Period of the idle/health sweep.
    #[serde(with = "duration_str")]
    pub cleanup_interval: Duration,

    pub limits: ResourceLimits,
    pub tunables: ScalingTunables,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 10,
            enable_predictive_scaling: false,
            prediction_window_size: 10,
            prediction_interval: Duration::from_secs(30),
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.2,
            max_predicted_scale_up: 5,
            enable_adaptive_thresholds: false,
            enable_pre_warming: false,
            pre_warm_on_init: 0,
            pre_warm_script: None,
            pre_warm_timeout: Duration::from_secs(5),
            enable_memory_pooling: false,
            memory_pool_size: 10,
            memory_block_size: 1024 * 1024,
            enable_load_balancing: false,
            acquire_timeout: None,
            max_uses: None,
            idle_timeout: Duration::from_secs(10 * 60),
            health_threshold: 0.7,
            cleanup_interval: Duration::from_secs(60),
            limits: ResourceLimits::default(),
            tunables: ScalingTunables::default(),
        }
    }
}

/// Per-interpreter resource limits and sandboxing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub security: SecurityLevel,
    /// Guest heap ceiling in bytes. `0` disables the limit.
    pub memory_limit: usize,
    /// Instructions allowed per execution. `0` disables the limit.
    pub instruction_limit: u64,
    /// VM hook granularity, in instructions.
    pub hook_interval: u32,
    #[serde(with = "opt_duration_str", skip_serializing_if = "Option::is_none")]
    pub max_duration: Option<Duration>,
    /// Chunk run once on every freshly created interpreter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init_script: Option<String>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            security: SecurityLevel::Standard,
            memory_limit: 64 * 1024 * 1024,
            instruction_limit: 0,
            hook_interval: 1000,
            max_duration: None,
            init_script: None,
        }
    }
}

/// Which parts of the guest standard library are available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityLevel {
    Minimal,
    #[default]
    Standard,
    Strict,
}

/// Heuristic constants used by the predictive scaler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingTunables {
    /// Request-rate growth ratio that counts as a surge.
    pub surge_ratio: f64,
    /// Multiplier applied to the prediction during a surge.
    pub surge_boost: f64,
    pub high_variance: f64,
    pub low_variance: f64,
    pub threshold_step: f64,
    pub threshold_floor: f64,
    pub threshold_ceiling: f64,
    /// Fraction of idle instances removed per scale-down.
    pub scale_down_fraction: f64,
    /// Samples needed before regression is trusted.
    pub min_history: usize,
    /// Trailing window for the request-rate count.
    #[serde(with = "duration_str")]
    pub request_window: Duration,
}

impl Default for ScalingTunables {
    fn default() -> Self {
        Self {
            surge_ratio: 1.2,
            surge_boost: 1.1,
            high_variance: 0.1,
            low_variance: 0.05,
            threshold_step: 0.05,
            threshold_floor: 0.1,
            threshold_ceiling: 0.9,
            scale_down_fraction: 0.2,
            min_history: 3,
            request_window: Duration::from_secs(60),
        }
    }
}

/// Named presets for common traffic shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadProfile {
    Burst,
    Steady,
    Periodic,
    MemoryIntensive,
}

impl FromStr for LoadProfile {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "burst" => Ok(LoadProfile::Burst),
            "steady" => Ok(LoadProfile::Steady),
            "periodic" => Ok(LoadProfile::Periodic),
            "memory_intensive" => Ok(LoadProfile::MemoryIntensive),
            other => Err(ConfigError::UnknownProfile(other.to_string())),
        }
    }
}

impl PoolConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: PoolConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn apply_profile(&mut self, profile: LoadProfile) {
        match profile {
            LoadProfile::Burst => {
                self.scale_up_threshold = 0.6;
                self.scale_down_threshold = 0.1;
                self.max_predicted_scale_up = 10;
            }
            LoadProfile::Steady => {
                self.scale_up_threshold = 0.85;
                self.scale_down_threshold = 0.25;
                self.max_predicted_scale_up = 3;
            }
            LoadProfile::Periodic => {
                self.enable_adaptive_thresholds = true;
                self.prediction_window_size = 20;
            }
            LoadProfile::MemoryIntensive => {
                self.enable_memory_pooling = true;
                self.memory_pool_size = 20;
                self.memory_block_size = 2 * 1024 * 1024;
            }
        }
    }

    /// Replace zero or non-positive values with their defaults.
    pub fn normalized(mut self) -> Self {
        let d = PoolConfig::default();
        if self.max_size == 0 {
            self.max_size = d.max_size;
        }
        if self.min_size > self.max_size {
            self.min_size = self.max_size;
        }
        if self.prediction_window_size == 0 {
            self.prediction_window_size = d.prediction_window_size;
        }
        if self.prediction_interval.is_zero() {
            self.prediction_interval = d.prediction_interval;
        }
        if self.scale_up_threshold <= 0.0 {
            self.scale_up_threshold = d.scale_up_threshold;
        }
        if self.scale_down_threshold <= 0.0 {
            self.scale_down_threshold = d.scale_down_threshold;
        }
        if self.max_predicted_scale_up == 0 {
            self.max_predicted_scale_up = d.max_predicted_scale_up;
        }
        if self.pre_warm_timeout.is_zero() {
            self.pre_warm_timeout = d.pre_warm_timeout;
        }
        if self.memory_block_size == 0 {
            self.memory_block_size = d.memory_block_size;
        }
        if self.memory_pool_size == 0 {
            self.memory_pool_size = d.memory_pool_size;
        }
        if self.idle_timeout.is_zero() {
            self.idle_timeout = d.idle_timeout;
        }
        if self.health_threshold <= 0.0 {
            self.health_threshold = d.health_threshold;
        }
        if self.cleanup_interval.is_zero() {
            self.cleanup_interval = d.cleanup_interval;
        }
        if self.limits.hook_interval == 0 {
            self.limits.hook_interval = d.limits.hook_interval;
        }
        self.pre_warm_on_init = self.pre_warm_on_init.min(self.max_size);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_size == 0 {
            return Err(ConfigError::Invalid("max_size must be at least 1".into()));
        }
        if self.min_size > self.max_size {
            return Err(ConfigError::Invalid(format!(
                "min_size {} exceeds max_size {}",
                self.min_size, self.max_size
            )));
        }
        for (name, value) in [
            ("scale_up_threshold", self.scale_up_threshold),
            ("scale_down_threshold", self.scale_down_threshold),
            ("health_threshold", self.health_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        if self.scale_down_threshold >= self.scale_up_threshold {
            return Err(ConfigError::Invalid(format!(
                "scale_down_threshold {} must be below scale_up_threshold {}",
                self.scale_down_threshold, self.scale_up_threshold
            )));
        }
        let t = &self.tunables;
        if t.threshold_floor >= t.threshold_ceiling {
            return Err(ConfigError::Invalid(
                "tunables.threshold_floor must be below threshold_ceiling".into(),
            ));
        }
        if !(0.0..=1.0).contains(&t.scale_down_fraction) {
            return Err(ConfigError::Invalid(
                "tunables.scale_down_fraction must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

/// Parse `"250ms"`, `"30s"`, `"5m"`, `"1h"` or a bare number of seconds.
pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let s = s.trim();
    let invalid = || ConfigError::InvalidDuration(s.to_string());
    let (digits, unit_ms) = if let Some(ms) = s.strip_suffix("ms") {
        (ms, 1)
    } else if let Some(secs) = s.strip_suffix('s') {
        (secs, 1_000)
    } else if let Some(mins) = s.strip_suffix('m') {
        (mins, 60_000)
    } else if let Some(hours) = s.strip_suffix('h') {
        (hours, 3_600_000)
    } else {
        (s, 1_000)
    };
    let n: u64 = digits.trim().parse().map_err(|_| invalid())?;
    n.checked_mul(unit_ms)
        .map(Duration::from_millis)
        .ok_or_else(invalid)
}

/// Render a duration in the largest unit that represents it exactly.
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms == 0 {
        "0s".to_string()
    } else if ms % 3_600_000 == 0 {
        format!("{}h", ms / 3_600_000)
    } else if ms % 60_000 == 0 {
        format!("{}m", ms / 60_000)
    } else if ms % 1_000 == 0 {
        format!("{}s", ms / 1_000)
    } else {
        format!("{ms}ms")
    }
}

mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

mod opt_duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_str(&super::format_duration(*d)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let raw = Option::<String>::deserialize(d)?;
        raw.map(|r| super::parse_duration(&r).map_err(serde::de::Error::custom))
            .transpose()
    }
}
