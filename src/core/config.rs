//! Engine settings.
//!
//! Loaded from `config.toml` in the clusterup directory. Every field has a
//! default, so a missing file is the same as an empty one. Selected values
//! can be overridden from `CLUSTERUP_*` environment variables.

use crate::error::{Error, Result};
use crate::paths;
use crate::utils::io;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Upper bound for any single remote command.
    pub command_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Pause after steps that restart daemons or change kernel state.
    pub settle_delay_ms: u64,
    pub join_query_attempts: u32,
    pub join_query_delay_ms: u64,
    pub pod_cidr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_repository: Option<String>,
    pub network_addon_manifest: String,
    pub join: JoinSettings,
}

/// Join credential supplied from outside, used when no primary is deployed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JoinSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            command_timeout_secs: 600,
            connect_timeout_secs: 10,
            settle_delay_ms: 2_000,
            join_query_attempts: 3,
            join_query_delay_ms: 5_000,
            pod_cidr: "10.244.0.0/16".to_string(),
            image_repository: None,
            network_addon_manifest:
                "https://raw.githubusercontent.com/flannel-io/flannel/master/Documentation/kube-flannel.yml"
                    .to_string(),
            join: JoinSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from the default location, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = paths::config_toml()?;
        let mut settings = if path.exists() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        settings.apply_env(|key| std::env::var(key).ok());
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = io::read_file(path, "read settings")?;
        toml::from_str(&content)
            .map_err(|e| Error::config_invalid_toml(path.display().to_string(), e))
    }

    /// Overlay `CLUSTERUP_*` variables. `lookup` is injected so tests never
    /// touch the process environment.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(secs) = get("CLUSTERUP_COMMAND_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.command_timeout_secs = secs;
        }
        if let Some(cidr) = get("CLUSTERUP_POD_CIDR") {
            self.pod_cidr = cidr;
        }
        if let Some(repo) = get("CLUSTERUP_IMAGE_REPOSITORY") {
            self.image_repository = Some(repo);
        }
        if let Some(token) = get("CLUSTERUP_JOIN_TOKEN") {
            self.join.token = Some(token);
        }
        if let Some(hash) = get("CLUSTERUP_JOIN_CA_HASH") {
            self.join.ca_hash = Some(hash);
        }
        if let Some(endpoint) = get("CLUSTERUP_JOIN_ENDPOINT") {
            self.join.endpoint = Some(endpoint);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.command_timeout_secs == 0 {
            return Err(Error::config_invalid_value(
                "command_timeout_secs",
                Some("0".to_string()),
                "must be greater than zero",
            ));
        }
        if self.join_query_attempts == 0 {
            return Err(Error::config_invalid_value(
                "join_query_attempts",
                Some("0".to_string()),
                "must be at least 1",
            ));
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn join_query_delay(&self) -> Duration {
        Duration::from_millis(self.join_query_delay_ms)
    }

    /// Settings with every delay zeroed, for tests and dry environments.
    pub fn without_delays() -> Self {
        Self {
            settle_delay_ms: 0,
            join_query_delay_ms: 0,
            ..Self::default()
        }
    }
}
