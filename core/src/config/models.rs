// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Configuration data structures.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub monitoring: MonitoringConfig,
    pub retention: RetentionConfig,
    pub license: LicenseConfig,
    pub admin: AdminConfig,
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address the API server binds to
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3330".to_string(),
        }
    }
}

/// Probe scheduling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Seconds between scheduler ticks (valid range 5-300)
    pub polling_interval_seconds: u64,
    /// Maximum concurrently running probes
    pub max_concurrency: usize,
    /// Per-device probe deadline in seconds
    pub probe_timeout_seconds: u64,
    /// Consecutive failures before a device is marked offline
    pub offline_threshold: u32,
    /// Consecutive failures before a device is marked warning
    pub warning_threshold: u32,
    /// Age of the last successful sample after which a device is
    /// considered stale; `None` means three polling intervals
    pub stale_age_seconds: Option<u64>,
    /// How long `stop()` waits for in-flight probes before aborting
    pub shutdown_grace_seconds: u64,
    /// Run the detailed RouterOS probe every Nth cycle
    pub detailed_probe_every: u32,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            polling_interval_seconds: 30,
            max_concurrency: 80,
            probe_timeout_seconds: 10,
            offline_threshold: 3,
            warning_threshold: 1,
            stale_age_seconds: None,
            shutdown_grace_seconds: 5,
            detailed_probe_every: 10,
        }
    }
}

impl MonitoringConfig {
    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_seconds)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_seconds)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }

    /// Effective stale threshold: explicit value or three intervals.
    pub fn stale_age(&self) -> Duration {
        Duration::from_secs(
            self.stale_age_seconds
                .unwrap_or(self.polling_interval_seconds * 3),
        )
    }
}

/// History retention settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Hours of metrics / bandwidth / event history to keep
    pub metrics_retention_hours: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            metrics_retention_hours: 720,
        }
    }
}

/// Licensing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LicenseConfig {
    /// Path of the license file
    pub file_path: PathBuf,
    /// Optional remote licensing server
    pub server_url: Option<String>,
}

impl Default for LicenseConfig {
    fn default() -> Self {
        Self {
            file_path: PathBuf::from("./license.json"),
            server_url: None,
        }
    }
}

/// Operator recovery settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub recovery_secret: Option<String>,
    pub recovery_password: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.monitoring.polling_interval_seconds, 30);
        assert_eq!(config.monitoring.max_concurrency, 80);
        assert_eq!(config.monitoring.offline_threshold, 3);
        assert_eq!(config.retention.metrics_retention_hours, 720);
        assert_eq!(config.license.file_path, PathBuf::from("./license.json"));
    }

    #[test]
    fn test_stale_age_follows_interval() {
        let mut monitoring = MonitoringConfig::default();
        assert_eq!(monitoring.stale_age(), Duration::from_secs(90));

        monitoring.stale_age_seconds = Some(300);
        assert_eq!(monitoring.stale_age(), Duration::from_secs(300));
    }
}
