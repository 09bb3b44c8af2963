//! Configuration loading

use std::path::Path;

use crate::{Config, Error, Result};

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "REALTIME_CONFIG_PATH";

/// Load configuration from a config file or environment variables
///
/// Config file search order:
/// 1. `explicit_path` (the `--config` flag); must exist when given
/// 2. `REALTIME_CONFIG_PATH` environment variable
/// 3. ./config.yaml (current working directory)
/// 4. /config/config.yaml (container mount path)
/// 5. Fall back to environment variables only
///
/// Logging is not initialised yet at this point, so progress goes to stderr.
pub fn load_config(explicit_path: Option<&str>) -> Result<Config> {
    if let Some(path) = explicit_path {
        if !Path::new(path).exists() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("config file {path} does not exist"),
            )));
        }
    }

    let config_path = explicit_path
        .map(str::to_string)
        .or_else(|| {
            std::env::var(CONFIG_PATH_ENV)
                .ok()
                .filter(|p| Path::new(p).exists())
        })
        .or_else(|| {
            ["config.yaml", "/config/config.yaml"]
                .into_iter()
                .find(|p| Path::new(p).exists())
                .map(str::to_string)
        });

    let config = if let Some(path) = config_path {
        eprintln!("Loading config from {path}");
        Config::from_file(&path)?
    } else {
        eprintln!("No config file found, using environment variables");
        Config::from_env()?
    };

    config.validate().map_err(Error::InvalidConfig)?;

    Ok(config)
}
