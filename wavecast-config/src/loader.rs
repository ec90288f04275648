//! TOML config loading.

use std::path::Path;

use thiserror::Error;
use tracing::info;

use crate::models::ServerConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Load and validate a config file.
pub fn load(path: &Path) -> Result<ServerConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    let config: ServerConfig = toml::from_str(&contents)?;
    validate(&config)?;
    info!(
        mounts = config.mounts.len(),
        "configuration loaded from {}",
        path.display()
    );
    Ok(config)
}

fn validate(config: &ServerConfig) -> Result<(), ConfigError> {
    for (mount, mc) in &config.mounts {
        if !mount.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "mount name must begin with '/': {mount}"
            )));
        }
        if let Some(auth) = &mc.auth
            && auth.kind.is_empty()
        {
            return Err(ConfigError::Invalid(format!(
                "mount {mount} has an auth block without a type"
            )));
        }
    }
    Ok(())
}
