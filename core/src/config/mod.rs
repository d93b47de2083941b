// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Configuration management.
//!
//! Layered loading with the following precedence (highest wins):
//!
//! 1. Dedicated environment variables (`POLLING_INTERVAL_SECONDS`,
//!    `MAX_PROBE_CONCURRENCY`, `OFFLINE_THRESHOLD`,
//!    `METRICS_RETENTION_HOURS`, `LICENSING_SERVER_URL`,
//!    `ADMIN_RECOVERY_SECRET`, `ADMIN_RECOVERY_PASSWORD`)
//! 2. Prefixed environment variables (`COREBIT_`, `__` as separator, e.g.
//!    `COREBIT_SERVER__LISTEN_ADDR`)
//! 3. Config file (`corebit.toml` by default)
//! 4. Built-in defaults
//!
//! Runtime-mutable settings (polling interval, thresholds, retention) are
//! additionally overridable through the repository settings table; this
//! module only produces the process-level baseline.

pub mod models;

use anyhow::{bail, Context, Result};
use config::{Config as ConfigBuilder, Environment, File};
use std::path::{Path, PathBuf};

pub use models::{AdminConfig, Config, LicenseConfig, MonitoringConfig, RetentionConfig, ServerConfig};

/// Default configuration file name
const CONFIG_FILE_NAME: &str = "corebit.toml";

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "COREBIT";

/// Separator for nested keys, e.g. `COREBIT_MONITORING__MAX_CONCURRENCY`
const ENV_SEPARATOR: &str = "__";

/// Smallest accepted polling interval in seconds
pub const MIN_POLLING_INTERVAL: u64 = 5;

/// Largest accepted polling interval in seconds
pub const MAX_POLLING_INTERVAL: u64 = 300;

/// Configuration loader with builder pattern
#[derive(Debug, Default)]
pub struct ConfigLoader {
    custom_file: Option<PathBuf>,
    skip_env: bool,
}

impl ConfigLoader {
    /// Create a new configuration loader with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Specify a custom configuration file path
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.custom_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Skip all environment sources (used by tests)
    pub fn without_env(mut self) -> Self {
        self.skip_env = true;
        self
    }

    /// Load and validate the configuration from all sources.
    pub fn load(self) -> Result<Config> {
        let mut builder = ConfigBuilder::builder();

        let file = self
            .custom_file
            .clone()
            .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
        let required = self.custom_file.is_some();
        builder = builder.add_source(File::from(file).required(required));

        if !self.skip_env {
            builder = builder.add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            );
        }

        let mut config: Config = builder
            .build()
            .context("failed to assemble configuration sources")?
            .try_deserialize()
            .context("invalid configuration")?;

        if !self.skip_env {
            apply_dedicated_env(&mut config)?;
        }
        validate(&config)?;
        Ok(config)
    }
}

/// Apply the dedicated (unprefixed) environment variables.
fn apply_dedicated_env(config: &mut Config) -> Result<()> {
    if let Some(value) = env_parse::<u64>("POLLING_INTERVAL_SECONDS")? {
        config.monitoring.polling_interval_seconds = value;
    }
    if let Some(value) = env_parse::<usize>("MAX_PROBE_CONCURRENCY")? {
        config.monitoring.max_concurrency = value;
    }
    if let Some(value) = env_parse::<u32>("OFFLINE_THRESHOLD")? {
        config.monitoring.offline_threshold = value;
    }
    if let Some(value) = env_parse::<u64>("METRICS_RETENTION_HOURS")? {
        config.retention.metrics_retention_hours = value;
    }
    if let Ok(value) = std::env::var("LICENSING_SERVER_URL") {
        if !value.is_empty() {
            config.license.server_url = Some(value);
        }
    }
    if let Ok(value) = std::env::var("ADMIN_RECOVERY_SECRET") {
        if !value.is_empty() {
            config.admin.recovery_secret = Some(value);
        }
    }
    if let Ok(value) = std::env::var("ADMIN_RECOVERY_PASSWORD") {
        if !value.is_empty() {
            config.admin.recovery_password = Some(value);
        }
    }
    Ok(())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if !raw.is_empty() => match raw.parse() {
            Ok(value) => Ok(Some(value)),
            Err(e) => bail!("invalid {name}={raw}: {e}"),
        },
        _ => Ok(None),
    }
}

/// Validate cross-field constraints.
pub fn validate(config: &Config) -> Result<()> {
    let interval = config.monitoring.polling_interval_seconds;
    if !(MIN_POLLING_INTERVAL..=MAX_POLLING_INTERVAL).contains(&interval) {
        bail!(
            "polling_interval_seconds must be in {MIN_POLLING_INTERVAL}..={MAX_POLLING_INTERVAL}, got {interval}"
        );
    }
    if config.monitoring.max_concurrency == 0 {
        bail!("max_concurrency must be at least 1");
    }
    if config.monitoring.offline_threshold == 0 {
        bail!("offline_threshold must be at least 1");
    }
    if config.retention.metrics_retention_hours == 0 {
        bail!("metrics_retention_hours must be at least 1");
    }
    Ok(())
}
