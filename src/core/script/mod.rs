//! Step script resolution.
//!
//! - `builtin` - default scripts, specialized by distribution family
//! - `store` - override sources (directory, in-memory)
//!
//! Lookup order for a step on a distribution, first match wins:
//! 1. override `<distro>_<step>`
//! 2. legacy override names for the step, distro-qualified then bare
//! 3. override `<step>`
//! 4. built-in script

pub mod builtin;
mod store;

pub use store::{DirScriptStore, MemoryScriptStore};

use crate::error::{Error, Result};
use crate::pipeline::StepName;
use crate::utils::template;
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::{Arc, LazyLock};

/// Source of operator-supplied override scripts.
pub trait ScriptSource: Send + Sync {
    fn get_script(&self, name: &str) -> Option<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptOrigin {
    Override,
    LegacyOverride,
    GenericOverride,
    Builtin,
}

impl ScriptOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptOrigin::Override => "override",
            ScriptOrigin::LegacyOverride => "legacy_override",
            ScriptOrigin::GenericOverride => "generic_override",
            ScriptOrigin::Builtin => "builtin",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedScript {
    pub step: StepName,
    /// Override key that matched, `None` for built-ins.
    pub key: Option<String>,
    pub origin: ScriptOrigin,
    pub text: String,
    /// Hex sha256 of `text`.
    pub fingerprint: String,
    /// Overrides that were found but refused.
    pub rejected: Vec<Error>,
}

impl ResolvedScript {
    fn new(step: StepName, key: Option<String>, origin: ScriptOrigin, text: String) -> Self {
        let fingerprint = format!("{:x}", Sha256::digest(text.as_bytes()));
        Self {
            step,
            key,
            origin,
            text,
            fingerprint,
            rejected: Vec::new(),
        }
    }

    pub fn render(&self, vars: &[(&str, &str)]) -> String {
        template::render(&self.text, vars)
    }

    /// One-line description for the transcript.
    pub fn describe(&self) -> String {
        match &self.key {
            Some(key) => format!(
                "{} '{}' (sha256 {})",
                self.origin.as_str(),
                key,
                &self.fingerprint[..12]
            ),
            None => format!("{} (sha256 {})", self.origin.as_str(), &self.fingerprint[..12]),
        }
    }
}

pub struct ScriptResolver {
    source: Arc<dyn ScriptSource>,
}

impl ScriptResolver {
    pub fn new(source: Arc<dyn ScriptSource>) -> Self {
        Self { source }
    }

    pub fn resolve(&self, step: StepName, distro: &str) -> Result<ResolvedScript> {
        let mut rejected = Vec::new();

        for (key, origin) in lookup_keys(step, distro) {
            let Some(text) = self.source.get_script(&key) else {
                continue;
            };
            if text.trim().is_empty() {
                continue;
            }

            if step.requires_integrity_check() {
                let missing = integrity_gaps(&text);
                if !missing.is_empty() {
                    let err = Error::script_integrity_rejected(&key, missing);
                    log_status!("script", "{}; using built-in script", err.message);
                    rejected.push(err);
                    // a rejected override falls straight through to the built-in
                    break;
                }
            }

            let mut resolved = ResolvedScript::new(step, Some(key), origin, text);
            resolved.rejected = rejected;
            return Ok(resolved);
        }

        let text = builtin::script(step, distro)?;
        let mut resolved = ResolvedScript::new(step, None, ScriptOrigin::Builtin, text);
        resolved.rejected = rejected;
        Ok(resolved)
    }
}

impl ScriptResolver {
    /// Script for a helper action outside the step pipeline: the override
    /// named `name` when present, otherwise `default`.
    pub fn auxiliary(&self, name: &str, default: &str) -> String {
        self.source
            .get_script(name)
            .filter(|text| !text.trim().is_empty())
            .unwrap_or_else(|| default.to_string())
    }
}

/// Override keys to try, in precedence order.
pub fn lookup_keys(step: StepName, distro: &str) -> Vec<(String, ScriptOrigin)> {
    let mut keys = Vec::new();
    if !distro.is_empty() {
        keys.push((format!("{}_{}", distro, step.as_str()), ScriptOrigin::Override));
    }
    for legacy in step.legacy_names() {
        if !distro.is_empty() {
            keys.push((format!("{}_{}", distro, legacy), ScriptOrigin::LegacyOverride));
        }
        keys.push((legacy.to_string(), ScriptOrigin::LegacyOverride));
    }
    keys.push((step.as_str().to_string(), ScriptOrigin::GenericOverride));
    keys
}

static START_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(re)?start\b").unwrap());

static ENABLE_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\benable\b").unwrap());

static RELOAD_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(daemon-)?reload\b").unwrap());

/// Service-management actions an override is missing. Empty means accepted.
pub fn integrity_gaps(text: &str) -> Vec<String> {
    let mut missing = Vec::new();
    if !START_PATTERN.is_match(text) {
        missing.push("restart/start".to_string());
    }
    if !ENABLE_PATTERN.is_match(text) {
        missing.push("enable".to_string());
    }
    if !RELOAD_PATTERN.is_match(text) {
        missing.push("daemon-reload".to_string());
    }
    missing
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(entries: &[(&str, &str)]) -> ScriptResolver {
        let store = MemoryScriptStore::from_pairs(entries);
        ScriptResolver::new(Arc::new(store))
    }

    #[test]
    fn distro_override_beats_generic_override() {
        let r = resolver(&[
            ("ubuntu_components_install", "echo ubuntu"),
            ("components_install", "echo generic"),
        ]);
        let resolved = r.resolve(StepName::ComponentsInstall, "ubuntu").unwrap();
        assert_eq!(resolved.text, "echo ubuntu");
        assert_eq!(resolved.origin, ScriptOrigin::Override);
    }

    #[test]
    fn legacy_name_beats_generic_override() {
        let r = resolver(&[
            ("install_k8s", "echo legacy"),
            ("components_install", "echo generic"),
        ]);
        let resolved = r.resolve(StepName::ComponentsInstall, "centos").unwrap();
        assert_eq!(resolved.text, "echo legacy");
        assert_eq!(resolved.origin, ScriptOrigin::LegacyOverride);
        assert_eq!(resolved.key.as_deref(), Some("install_k8s"));
    }

    #[test]
    fn generic_override_used_for_other_distros() {
        let r = resolver(&[
            ("ubuntu_components_install", "echo ubuntu"),
            ("components_install", "echo generic"),
        ]);
        let resolved = r.resolve(StepName::ComponentsInstall, "rocky").unwrap();
        assert_eq!(resolved.text, "echo generic");
    }

    #[test]
    fn falls_back_to_builtin() {
        let r = resolver(&[]);
        let resolved = r.resolve(StepName::RepositoryConfiguration, "debian").unwrap();
        assert_eq!(resolved.origin, ScriptOrigin::Builtin);
        assert!(resolved.text.contains("pkgs.k8s.io"));
        assert_eq!(resolved.fingerprint.len(), 64);
    }

    #[test]
    fn unknown_distro_without_override_is_unsupported() {
        let r = resolver(&[]);
        let err = r.resolve(StepName::ContainerRuntimeInstall, "gentoo").unwrap_err();
        assert_eq!(err.code.as_str(), "script.unsupported_distribution");
    }

    #[test]
    fn unknown_distro_with_generic_override_is_fine() {
        let r = resolver(&[("container_runtime_install", "emerge containerd")]);
        let resolved = r.resolve(StepName::ContainerRuntimeInstall, "gentoo").unwrap();
        assert_eq!(resolved.text, "emerge containerd");
    }

    #[test]
    fn incomplete_runtime_override_is_rejected() {
        let r = resolver(&[(
            "ubuntu_container_runtime_configure",
            "containerd config default > /etc/containerd/config.toml",
        )]);
        let resolved = r
            .resolve(StepName::ContainerRuntimeConfigure, "ubuntu")
            .unwrap();
        assert_eq!(resolved.origin, ScriptOrigin::Builtin);
        assert_eq!(resolved.rejected.len(), 1);
        assert_eq!(
            resolved.rejected[0].code.as_str(),
            "script.integrity_rejected"
        );
        assert!(resolved.text.contains("systemctl restart containerd"));
    }

    #[test]
    fn complete_runtime_override_is_accepted() {
        let text = "systemctl daemon-reload\nsystemctl enable containerd\nsystemctl restart containerd";
        let r = resolver(&[("container_runtime_configure", text)]);
        let resolved = r
            .resolve(StepName::ContainerRuntimeConfigure, "ubuntu")
            .unwrap();
        assert_eq!(resolved.origin, ScriptOrigin::GenericOverride);
        assert!(resolved.rejected.is_empty());
    }

    #[test]
    fn integrity_check_only_applies_to_runtime_configuration() {
        let r = resolver(&[("components_install", "echo hi")]);
        let resolved = r.resolve(StepName::ComponentsInstall, "ubuntu").unwrap();
        assert_eq!(resolved.text, "echo hi");
    }

    #[test]
    fn integrity_gaps_lists_each_missing_action() {
        assert_eq!(
            integrity_gaps("systemctl enable containerd"),
            vec!["restart/start".to_string(), "daemon-reload".to_string()]
        );
        assert!(integrity_gaps("service containerd start; systemctl enable containerd; systemctl daemon-reload").is_empty());
    }

    #[test]
    fn render_substitutes_placeholders() {
        let r = resolver(&[("components_install", "install kubeadm={{version}}")]);
        let resolved = r.resolve(StepName::ComponentsInstall, "ubuntu").unwrap();
        assert_eq!(
            resolved.render(&[("version", "1.28.2")]),
            "install kubeadm=1.28.2"
        );
    }
}
