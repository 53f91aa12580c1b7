//! Config file loading for the CLI
//!
//! The file holds a `pgtemplate_core::Config` in TOML; command-line flags
//! override individual fields afterwards.

use std::path::Path;

use anyhow::{Context, Result};
use pgtemplate_core::Config;
use tracing::debug;

/// Load `path` if given, otherwise start from defaults.
pub fn load(path: Option<&Path>) -> Result<Config> {
    let Some(path) = path else {
        debug!("No config file given, using defaults");
        return Ok(Config::default());
    };

    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    debug!("Loaded config from {}", path.display());
    Ok(config)
}
