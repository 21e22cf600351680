//! Pre-staged package artifacts.
//!
//! Steps that would otherwise download packages from the network ask the
//! cache first. A hit makes the built-in script install from the staged
//! directory on the node instead of the upstream repository.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub trait PackageCache: Send + Sync {
    fn resolve_path(&self, name: &str, version: &str, arch: &str, distro: &str)
        -> Option<PathBuf>;
}

/// Directory layout: `<root>/<name>/<version>/<distro>-<arch>/`.
///
/// The version directory may carry a leading `v` or not; both are accepted.
pub struct DirPackageCache {
    root: PathBuf,
}

impl DirPackageCache {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn candidate(&self, name: &str, version: &str, arch: &str, distro: &str) -> PathBuf {
        self.root
            .join(name)
            .join(version)
            .join(format!("{}-{}", distro, arch))
    }
}

fn has_entries(path: &Path) -> bool {
    std::fs::read_dir(path)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

impl PackageCache for DirPackageCache {
    fn resolve_path(
        &self,
        name: &str,
        version: &str,
        arch: &str,
        distro: &str,
    ) -> Option<PathBuf> {
        let bare = version.trim_start_matches('v');
        [bare.to_string(), format!("v{}", bare)]
            .iter()
            .map(|v| self.candidate(name, v, arch, distro))
            .find(|path| path.is_dir() && has_entries(path))
    }
}

/// Fixed lookup table, keyed by `(name, version, arch, distro)`.
#[derive(Default)]
pub struct MemoryPackageCache {
    entries: HashMap<(String, String, String, String), PathBuf>,
}

impl MemoryPackageCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, version: &str, arch: &str, distro: &str, path: PathBuf) {
        self.entries.insert(
            (
                name.to_string(),
                version.to_string(),
                arch.to_string(),
                distro.to_string(),
            ),
            path,
        );
    }
}

impl PackageCache for MemoryPackageCache {
    fn resolve_path(
        &self,
        name: &str,
        version: &str,
        arch: &str,
        distro: &str,
    ) -> Option<PathBuf> {
        self.entries
            .get(&(
                name.to_string(),
                version.to_string(),
                arch.to_string(),
                distro.to_string(),
            ))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn dir_cache_accepts_v_prefixed_versions() {
        let dir = TempDir::new().unwrap();
        let staged = dir.path().join("kubeadm").join("v1.28.2").join("ubuntu-amd64");
        std::fs::create_dir_all(&staged).unwrap();
        std::fs::write(staged.join("kubeadm.deb"), b"deb").unwrap();

        let cache = DirPackageCache::new(dir.path().to_path_buf());
        assert_eq!(
            cache.resolve_path("kubeadm", "1.28.2", "amd64", "ubuntu"),
            Some(staged)
        );
        assert_eq!(cache.resolve_path("kubeadm", "1.28.2", "arm64", "ubuntu"), None);
    }

    #[test]
    fn dir_cache_ignores_empty_directories() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("kubeadm").join("1.29.0").join("centos-amd64"))
            .unwrap();

        let cache = DirPackageCache::new(dir.path().to_path_buf());
        assert!(cache.resolve_path("kubeadm", "1.29.0", "amd64", "centos").is_none());
    }
}
