//! usbip-monitor configuration: deserialization and validation.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::MonitorError;
use crate::locator::DEFAULT_HOSTFS_PREFIX;
use crate::monitor::MonitorTimings;

/// Environment variable overriding `usbip.hostfs_prefix`.
pub const HOSTFS_PREFIX_ENV: &str = "USBIP_MONITOR_HOSTFSPREFIX";

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error", "off"];

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonitorConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub usbip: UsbIpConfig,
}

/// `[timing]`: every wait of the state machine, in milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimingConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_max_map_attempts")]
    pub max_map_attempts: u32,
    #[serde(default = "default_detach_timeout_ms")]
    pub detach_timeout_ms: u64,
}

/// `[usbip]`: where the executable lives.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UsbIpConfig {
    /// Explicit executable, skipping the search.
    pub path: Option<PathBuf>,
    #[serde(default = "default_hostfs_prefix")]
    pub hostfs_prefix: PathBuf,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_poll_interval_ms() -> u64 {
    3000
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_max_map_attempts() -> u32 {
    10
}

fn default_detach_timeout_ms() -> u64 {
    1000
}

fn default_hostfs_prefix() -> PathBuf {
    PathBuf::from(DEFAULT_HOSTFS_PREFIX)
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            timing: TimingConfig::default(),
            usbip: UsbIpConfig::default(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_map_attempts: default_max_map_attempts(),
            detach_timeout_ms: default_detach_timeout_ms(),
        }
    }
}

impl Default for UsbIpConfig {
    fn default() -> Self {
        Self {
            path: None,
            hostfs_prefix: default_hostfs_prefix(),
        }
    }
}

impl FromStr for MonitorConfig {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s).map_err(|e| MonitorError::InvalidConfig(e.to_string()))
    }
}

impl MonitorConfig {
    /// Validate the config, failing fast before anything is spawned.
    pub fn validate(&self) -> crate::Result<()> {
        if !LOG_LEVELS.contains(&self.log_level.to_ascii_lowercase().as_str()) {
            return Err(MonitorError::InvalidConfig(format!(
                "log_level '{}' must be one of {}",
                self.log_level,
                LOG_LEVELS.join(", ")
            )));
        }

        let timing = &self.timing;
        for (name, value) in [
            ("timing.poll_interval_ms", timing.poll_interval_ms),
            ("timing.retry_backoff_ms", timing.retry_backoff_ms),
            ("timing.detach_timeout_ms", timing.detach_timeout_ms),
        ] {
            if value == 0 {
                return Err(MonitorError::InvalidConfig(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }
        if timing.max_map_attempts == 0 {
            return Err(MonitorError::InvalidConfig(
                "timing.max_map_attempts must be at least 1".to_string(),
            ));
        }

        if self.usbip.hostfs_prefix.as_os_str().is_empty() {
            return Err(MonitorError::InvalidConfig(
                "usbip.hostfs_prefix must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Apply `USBIP_MONITOR_HOSTFSPREFIX` when set and non-empty.
    pub fn apply_env(&mut self, hostfs_prefix: Option<String>) {
        if let Some(prefix) = hostfs_prefix.filter(|p| !p.trim().is_empty()) {
            self.usbip.hostfs_prefix = PathBuf::from(prefix.trim());
        }
    }

    pub fn timings(&self) -> MonitorTimings {
        MonitorTimings {
            poll_interval: Duration::from_millis(self.timing.poll_interval_ms),
            retry_backoff: Duration::from_millis(self.timing.retry_backoff_ms),
            max_map_attempts: self.timing.max_map_attempts,
            detach_timeout: Duration::from_millis(self.timing.detach_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_toml(toml_str: &str) -> MonitorConfig {
        toml_str.parse().expect("valid TOML")
    }

    #[test]
    fn test_empty_file_is_defaults() {
        let config = parse_toml("");
        assert!(config.validate().is_ok());
        assert_eq!(config.log_level, "info");
        assert_eq!(config.timings(), MonitorTimings::default());
        assert_eq!(config.usbip.path, None);
        assert_eq!(config.usbip.hostfs_prefix, PathBuf::from("/hostfs"));
    }

    #[test]
    fn test_full_config() {
        let config = parse_toml(
            r#"
            log_level = "debug"

            [timing]
            poll_interval_ms = 5000
            retry_backoff_ms = 250
            max_map_attempts = 20
            detach_timeout_ms = 2000

            [usbip]
            path = "/usr/sbin/usbip"
            hostfs_prefix = "/"
            "#,
        );
        assert!(config.validate().is_ok());
        let timings = config.timings();
        assert_eq!(timings.poll_interval, Duration::from_secs(5));
        assert_eq!(timings.retry_backoff, Duration::from_millis(250));
        assert_eq!(timings.max_map_attempts, 20);
        assert_eq!(timings.detach_timeout, Duration::from_secs(2));
        assert_eq!(config.usbip.path, Some(PathBuf::from("/usr/sbin/usbip")));
        assert_eq!(config.usbip.hostfs_prefix, PathBuf::from("/"));
    }

    #[test]
    fn test_partial_timing_keeps_other_defaults() {
        let config = parse_toml("[timing]\nmax_map_attempts = 3\n");
        let timings = config.timings();
        assert_eq!(timings.max_map_attempts, 3);
        assert_eq!(timings.poll_interval, Duration::from_secs(3));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = parse_toml("[timing]\npoll_interval_ms = 0\n");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("timing.poll_interval_ms"));
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let config = parse_toml("[timing]\nmax_map_attempts = 0\n");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_log_level_rejected() {
        let config = parse_toml("log_level = \"loud\"\n");
        assert!(config.validate().is_err());
        assert!(parse_toml("log_level = \"WARN\"\n").validate().is_ok());
    }

    #[test]
    fn test_unknown_key_is_parse_error() {
        let err = "[timing]\npoll_interval = 5\n".parse::<MonitorConfig>().unwrap_err();
        assert!(matches!(err, MonitorError::InvalidConfig(_)));
    }

    #[test]
    fn test_env_overrides_hostfs_prefix() {
        let mut config = MonitorConfig::default();
        config.apply_env(Some("/mnt/host".to_string()));
        assert_eq!(config.usbip.hostfs_prefix, PathBuf::from("/mnt/host"));

        config.apply_env(Some("  ".to_string()));
        assert_eq!(config.usbip.hostfs_prefix, PathBuf::from("/mnt/host"));

        config.apply_env(None);
        assert_eq!(config.usbip.hostfs_prefix, PathBuf::from("/mnt/host"));
    }
}
