use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::FlowXError;

/// Admission-control settings for one protected endpoint.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ShedConfig {
    pub enabled: bool,
    /// Total span covered by the rolling window.
    pub window_ms: u64,
    /// Number of buckets the window is split into.
    pub buckets: usize,
    /// CPU usage (0..1000) at or above which the shedder may reject.
    pub cpu_threshold: u64,
    /// Emit a stat snapshot on every passed request.
    pub debug: bool,
}

impl Default for ShedConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_ms: 10_000,
            buckets: 100,
            cpu_threshold: 900,
            debug: false,
        }
    }
}

impl ShedConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn bucket_duration(&self) -> Duration {
        self.window() / self.buckets.max(1) as u32
    }

    pub fn validate(&self) -> Result<(), FlowXError> {
        if self.buckets == 0 {
            return Err(FlowXError::InvalidConfig("shed.buckets must be > 0".into()));
        }
        if self.bucket_duration().is_zero() {
            return Err(FlowXError::InvalidConfig(format!(
                "shed.window_ms ({}) is too small for {} buckets",
                self.window_ms, self.buckets
            )));
        }
        if self.cpu_threshold > 1000 {
            return Err(FlowXError::InvalidConfig(format!(
                "shed.cpu_threshold must be within 0..=1000, got {}",
                self.cpu_threshold
            )));
        }
        Ok(())
    }
}

/// Background CPU sampling settings.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CpuConfig {
    pub interval_ms: u64,
    /// Weight of the previous value in `cpu = prev * decay + sample * (1 - decay)`.
    pub decay: f64,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            interval_ms: 250,
            decay: 0.95,
        }
    }
}

impl CpuConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn validate(&self) -> Result<(), FlowXError> {
        if self.interval_ms == 0 {
            return Err(FlowXError::InvalidConfig("cpu.interval_ms must be > 0".into()));
        }
        if !(0.0..1.0).contains(&self.decay) {
            return Err(FlowXError::InvalidConfig(format!(
                "cpu.decay must be within [0, 1), got {}",
                self.decay
            )));
        }
        Ok(())
    }
}

/// P2C picker settings.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BalancerConfig {
    pub decay_time_ms: u64,
    pub force_pick_ms: u64,
    pub log_interval_ms: u64,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            decay_time_ms: 10_000,
            force_pick_ms: 1_000,
            log_interval_ms: 60_000,
        }
    }
}

impl BalancerConfig {
    pub fn decay_time(&self) -> Duration {
        Duration::from_millis(self.decay_time_ms)
    }

    pub fn force_pick(&self) -> Duration {
        Duration::from_millis(self.force_pick_ms)
    }

    pub fn log_interval(&self) -> Duration {
        Duration::from_millis(self.log_interval_ms)
    }

    pub fn validate(&self) -> Result<(), FlowXError> {
        if self.decay_time_ms == 0 {
            return Err(FlowXError::InvalidConfig("balancer.decay_time_ms must be > 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct FlowConfig {
    pub shed: ShedConfig,
    pub cpu: CpuConfig,
    pub balancer: BalancerConfig,
}

impl FlowConfig {
    /// Parses and validates a TOML document. Missing tables and keys take defaults.
    pub fn from_toml(raw: &str) -> Result<Self, FlowXError> {
        let config: FlowConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, FlowXError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        tracing::info!("Loading flow config from {}", path.as_ref().display());
        Self::from_toml(&raw)
    }

    pub fn validate(&self) -> Result<(), FlowXError> {
        self.shed.validate()?;
        self.cpu.validate()?;
        self.balancer.validate()
    }
}
