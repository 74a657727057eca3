use serde::Deserialize;
use std::path::Path;

use crate::lifecycle::UnjoinedPolicy;
use crate::scheduler::{
    DutyCycleConfig, DEFAULT_BASE_PERIOD_MS, DEFAULT_JITTER_MAX_MS, DEFAULT_WATCHDOG_PERIOD_MS,
};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub duty_cycle: DutyCycleSection,
    pub debounce: DebounceConfig,
    pub network: NetworkConfig,
    pub simulator: SimulatorConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// "A" or "C"
    pub class: String,
    pub region: String,
    /// DevAddr as 8 hex digits
    pub dev_addr: String,
    /// FPort for rain reports
    pub app_port: u8,
    pub unjoined_policy: UnjoinedPolicy,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DutyCycleSection {
    pub base_period_ms: u32,
    pub jitter_max_ms: u32,
    pub watchdog_period_ms: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DebounceConfig {
    pub quiet_window_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// GWMP network server
    pub server: String,
    pub bind: String,
    pub join_attempts: u32,
    pub keepalive_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Mean spacing of synthetic tips; 0 disables the rain source
    pub tip_interval_ms: u64,
    pub battery_mv: u32,
    /// Jitter RNG seed; 0 derives one from the clock
    pub seed: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {:?}: {}", path, e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file: {}", e))?;
        Ok(config)
    }

    /// DevAddr parsed from its hex form
    pub fn dev_addr(&self) -> anyhow::Result<u32> {
        u32::from_str_radix(self.device.dev_addr.trim_start_matches("0x"), 16)
            .map_err(|e| anyhow::anyhow!("Invalid dev_addr '{}': {}", self.device.dev_addr, e))
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            class: "A".to_string(),
            region: "EU868".to_string(),
            dev_addr: "260B1234".to_string(),
            app_port: 1,
            unjoined_policy: UnjoinedPolicy::Retain,
        }
    }
}

impl Default for DutyCycleSection {
    fn default() -> Self {
        Self {
            base_period_ms: DEFAULT_BASE_PERIOD_MS,
            jitter_max_ms: DEFAULT_JITTER_MAX_MS,
            watchdog_period_ms: DEFAULT_WATCHDOG_PERIOD_MS,
        }
    }
}

impl From<&DutyCycleSection> for DutyCycleConfig {
    fn from(section: &DutyCycleSection) -> Self {
        Self {
            base_period_ms: section.base_period_ms,
            jitter_max_ms: section.jitter_max_ms,
            watchdog_period_ms: section.watchdog_period_ms,
        }
    }
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            quiet_window_ms: crate::counter::MIN_QUIET_WINDOW_MS,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1:1680".to_string(),
            bind: "0.0.0.0:0".to_string(),
            join_attempts: 1,
            keepalive_secs: 10,
        }
    }
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            tip_interval_ms: 0,
            battery_mv: 3_700,
            seed: 0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [device]
            region = "US915"
            unjoined_policy = "discard"

            [duty_cycle]
            base_period_ms = 600000
            "#,
        )
        .unwrap();

        assert_eq!(config.device.region, "US915");
        assert_eq!(config.device.class, "A");
        assert_eq!(config.device.app_port, 1);
        assert_eq!(config.device.unjoined_policy, UnjoinedPolicy::Discard);

        let duty = DutyCycleConfig::from(&config.duty_cycle);
        assert_eq!(duty.base_period_ms, 600_000);
        assert_eq!(duty.watchdog_period_ms, DEFAULT_WATCHDOG_PERIOD_MS);
        assert_eq!(config.debounce.quiet_window_ms, 500);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_dev_addr_parsing() {
        let mut config = Config::default();
        assert_eq!(config.dev_addr().unwrap(), 0x260B1234);

        config.device.dev_addr = "0x01AB5678".to_string();
        assert_eq!(config.dev_addr().unwrap(), 0x01AB5678);

        config.device.dev_addr = "nope".to_string();
        assert!(config.dev_addr().is_err());
    }

    #[test]
    fn test_unknown_policy_rejected() {
        let result: Result<Config, _> = toml::from_str("[device]\nunjoined_policy = \"keep\"\n");
        assert!(result.is_err());
    }
}
