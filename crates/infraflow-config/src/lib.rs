//! Configuration for the InfraFlow daemon
//!
//! The configuration is read once at startup and handed to every component
//! explicitly. Nothing below this crate looks at environment variables.

pub mod error;
pub mod model;
pub mod parser;

pub use error::*;
pub use model::*;
pub use parser::parse_config_str;

use std::path::{Path, PathBuf};

/// Environment variable pointing directly at a config file
pub const CONFIG_ENV: &str = "INFRAFLOW_CONFIG";

const CANDIDATES: [&str; 2] = ["infraflow.local.kdl", "infraflow.kdl"];

/// InfraFlow's per-user config directory (`~/.config/infraflow`)
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or(ConfigError::ConfigDirNotFound)?
        .join("infraflow");
    Ok(config_dir)
}

/// Locate the daemon config file.
///
/// Search order:
/// 1. `INFRAFLOW_CONFIG`
/// 2. current directory: `infraflow.local.kdl`, `infraflow.kdl`
/// 3. `./.infraflow/` with the same names
/// 4. `~/.config/infraflow/infraflow.kdl`
///
/// Returns `Ok(None)` when nothing is found; the daemon then runs on defaults.
pub fn find_config_file() -> Result<Option<PathBuf>> {
    if let Ok(config_path) = std::env::var(CONFIG_ENV) {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Ok(Some(path));
        }
        return Err(ConfigError::FileNotFound(path));
    }

    let current_dir = std::env::current_dir()?;
    for dir in [current_dir.clone(), current_dir.join(".infraflow")] {
        for filename in &CANDIDATES {
            let path = dir.join(filename);
            if path.exists() {
                return Ok(Some(path));
            }
        }
    }

    if let Ok(config_dir) = get_config_dir() {
        let global = config_dir.join("infraflow.kdl");
        if global.exists() {
            return Ok(Some(global));
        }
    }

    Ok(None)
}

/// Parse a config file
pub fn load_config_file(path: impl AsRef<Path>) -> Result<DaemonConfig> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.to_path_buf()));
    }
    let content = std::fs::read_to_string(path)?;
    let config = parse_config_str(&content)?;
    tracing::info!("Loaded config from {}", path.display());
    Ok(config)
}

/// Load the explicit path if given, otherwise the discovered file, otherwise defaults
pub fn load(explicit: Option<&Path>) -> Result<DaemonConfig> {
    match explicit {
        Some(path) => load_config_file(path),
        None => match find_config_file()? {
            Some(path) => load_config_file(path),
            None => {
                tracing::info!("No config file found, using defaults");
                Ok(DaemonConfig::default())
            }
        },
    }
}
