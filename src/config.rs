use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::clock::MonotonicTicks;
use crate::ntp::NTP_PORT;

pub const MAX_POOL_SIZE: usize = 16;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub clock: ClockConfig,
    pub pool: PoolConfig,
    pub server: ServerConfig,
    pub pps: PpsConfig,
    pub gps: GpsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    pub nominal_tick_hz: u32,
    pub rate_tolerance_ppm: u32,      // spurious-edge rejection bound around nominal
    pub rate_smoothing_shift: u8,     // EMA weight 2^-shift for new rate samples
    pub holdover_timeout_secs: u64,   // PPS silence before entering holdover
    pub correlation_window_ms: u64,   // GPS message must follow its edge within this
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub host_template: String,        // "{}" is replaced by the slot index
    pub size: usize,
    pub query_timeout_ms: u64,
    pub poll_exponent: u8,            // steady-state interval 2^n seconds
    pub retry_exponent: u8,           // interval after a cycle with no responses
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PpsConfig {
    pub device: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GpsConfig {
    pub feed: Option<PathBuf>,
}

impl Default for ClockConfig {
    fn default() -> Self {
        ClockConfig {
            nominal_tick_hz: MonotonicTicks::NOMINAL_HZ,
            rate_tolerance_ppm: 500,
            rate_smoothing_shift: 3,
            holdover_timeout_secs: 5,
            correlation_window_ms: 500,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            host_template: "{}.pool.ntp.org".to_string(),
            size: 4,
            query_timeout_ms: 1000,
            poll_exponent: 12, // 4096 s
            retry_exponent: 6, // 64 s
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: IpAddr::from([0, 0, 0, 0]),
            port: NTP_PORT,
        }
    }
}

impl SystemConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: SystemConfig = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let c = &self.clock;
        if c.nominal_tick_hz == 0 {
            return Err(anyhow!("clock.nominal_tick_hz must be non-zero"));
        }
        if c.rate_tolerance_ppm == 0 || c.rate_tolerance_ppm >= 100_000 {
            return Err(anyhow!("clock.rate_tolerance_ppm must be in 1..100000"));
        }
        if c.rate_smoothing_shift > 16 {
            return Err(anyhow!("clock.rate_smoothing_shift must be at most 16"));
        }
        if c.holdover_timeout_secs == 0 {
            return Err(anyhow!("clock.holdover_timeout_secs must be non-zero"));
        }
        if c.correlation_window_ms == 0 || c.correlation_window_ms >= 1000 {
            return Err(anyhow!("clock.correlation_window_ms must be in 1..1000"));
        }

        let p = &self.pool;
        if !(1..=MAX_POOL_SIZE).contains(&p.size) {
            return Err(anyhow!("pool.size must be in 1..={}", MAX_POOL_SIZE));
        }
        if !p.host_template.contains("{}") {
            return Err(anyhow!("pool.host_template must contain '{{}}'"));
        }
        if p.retry_exponent > p.poll_exponent || p.poll_exponent > 17 {
            return Err(anyhow!("pool exponents must satisfy retry <= poll <= 17"));
        }
        if p.query_timeout_ms == 0 {
            return Err(anyhow!("pool.query_timeout_ms must be non-zero"));
        }
        Ok(())
    }
}

impl PoolConfig {
    pub fn hostname(&self, index: usize) -> String {
        self.host_template.replace("{}", &index.to_string())
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(1u64 << self.poll_exponent)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(1u64 << self.retry_exponent)
    }
}
