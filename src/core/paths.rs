use crate::error::{Error, Result};
use std::env;
use std::path::PathBuf;

/// Base config directory (~/.config/clusterup/, or $CLUSTERUP_HOME when set)
pub fn clusterup() -> Result<PathBuf> {
    if let Ok(dir) = env::var("CLUSTERUP_HOME") {
        let trimmed = dir.trim();
        if !trimmed.is_empty() {
            return Ok(PathBuf::from(trimmed));
        }
    }

    #[cfg(windows)]
    {
        let appdata = env::var("APPDATA").map_err(|_| {
            Error::internal_unexpected(
                "APPDATA environment variable not set on Windows".to_string(),
            )
        })?;
        Ok(PathBuf::from(appdata).join("clusterup"))
    }

    #[cfg(not(windows))]
    {
        let home = env::var("HOME").map_err(|_| {
            Error::internal_unexpected(
                "HOME environment variable not set on Unix-like system".to_string(),
            )
        })?;
        Ok(PathBuf::from(home).join(".config").join("clusterup"))
    }
}

/// Settings file
pub fn config_toml() -> Result<PathBuf> {
    Ok(clusterup()?.join("config.toml"))
}

/// Node inventory file
pub fn nodes_json() -> Result<PathBuf> {
    Ok(clusterup()?.join("nodes.json"))
}

/// Override scripts directory
pub fn scripts() -> Result<PathBuf> {
    Ok(clusterup()?.join("scripts"))
}

/// Staged package artifacts directory
pub fn packages() -> Result<PathBuf> {
    Ok(clusterup()?.join("packages"))
}

/// Durable command log database
pub fn logs_db() -> Result<PathBuf> {
    Ok(clusterup()?.join("logs.db"))
}
