pub mod license;
pub mod scan;
pub mod serve;

use anyhow::{Context, Result};
use corebit_core::config::{Config, ConfigLoader};
use std::path::PathBuf;

/// Load configuration, honouring an explicit `--config` path.
pub fn load_config(path: Option<PathBuf>) -> Result<Config> {
    let loader = match path {
        Some(path) => ConfigLoader::new().with_file(path),
        None => ConfigLoader::new(),
    };
    loader.load().context("failed to load configuration")
}
