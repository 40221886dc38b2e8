//! Configuration layering
//!
//! Lowest to highest precedence: built-in defaults, an optional TOML file,
//! `OBD_*` environment variables (`__` separates nested keys, so
//! `OBD_DEVICE__NAME=rfcomm0`), then command-line flags.

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use obd_protocol::ConnectionConfig;
use std::path::Path;

/// Settings given directly on the command line
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub device: Option<String>,
    pub protocol: Option<String>,
    pub timeout_ms: Option<u64>,
    pub retry_count: Option<u32>,
}

/// Build the connection config from every layer
pub fn load(path: Option<&Path>, overrides: &Overrides) -> Result<ConnectionConfig> {
    let mut builder = Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(File::from(path).required(true));
    }

    let settings = builder
        .add_source(
            Environment::with_prefix("OBD")
                .separator("__")
                .try_parsing(true),
        )
        .set_override_option("device.name", overrides.device.clone())?
        .set_override_option("protocol_preference", overrides.protocol.clone())?
        .set_override_option("timeout_ms", overrides.timeout_ms.map(|v| v as i64))?
        .set_override_option("retry_count", overrides.retry_count.map(|v| v as i64))?
        .build()
        .context("failed to read configuration")?;

    let config: ConnectionConfig = settings
        .try_deserialize()
        .context("invalid configuration")?;
    config.validate()?;
    Ok(config)
}
