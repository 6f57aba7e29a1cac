mod types;

pub use types::*;

use anyhow::{Context, Result};
use std::path::Path;
use taxi_db::{Engine, EngineOptions};

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    validate_config(&config)?;

    Ok(config)
}

/// Load config from default locations or return default config
pub fn load_config_or_default(custom_path: Option<&Path>) -> Result<Config> {
    if let Some(path) = custom_path {
        return load_config(path);
    }

    let default_paths = [
        "./taxi.toml",
        "~/.config/taxi/config.toml",
        "/etc/taxi/config.toml",
    ];

    for path_str in default_paths {
        let path = shellexpand::tilde(path_str);
        let path = Path::new(path.as_ref());
        if path.exists() {
            return load_config(path);
        }
    }

    Ok(Config::default())
}

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    let db = &config.database;

    match db.url {
        Some(ref url) => {
            Engine::from_url(url, EngineOptions::default())
                .with_context(|| format!("Invalid database.url: {url}"))?;
        }
        None => {
            if db.path.as_os_str().is_empty() {
                anyhow::bail!("database.path cannot be empty");
            }
            if let Some(parent) = db.path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    tracing::warn!("Database directory does not exist: {:?}", parent);
                }
            }
        }
    }

    if !db.future {
        tracing::warn!("database.future is disabled; sessions will commit on every flush");
    }

    Ok(())
}
