use super::ScriptSource;
use std::collections::HashMap;
use std::path::PathBuf;

/// Overrides stored as `<dir>/<name>.sh`.
pub struct DirScriptStore {
    dir: PathBuf,
}

impl DirScriptStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Names of every override present, sorted.
    pub fn list(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let path = e.path();
                if path.extension().is_some_and(|ext| ext == "sh") {
                    path.file_stem().map(|s| s.to_string_lossy().to_string())
                } else {
                    None
                }
            })
            .filter(|name| is_valid_name(name))
            .collect();
        names.sort();
        names
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl ScriptSource for DirScriptStore {
    fn get_script(&self, name: &str) -> Option<String> {
        if !is_valid_name(name) {
            return None;
        }
        std::fs::read_to_string(self.dir.join(format!("{}.sh", name))).ok()
    }
}

#[derive(Default)]
pub struct MemoryScriptStore {
    scripts: HashMap<String, String>,
}

impl MemoryScriptStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        Self {
            scripts: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, text: impl Into<String>) {
        self.scripts.insert(name.into(), text.into());
    }
}

impl ScriptSource for MemoryScriptStore {
    fn get_script(&self, name: &str) -> Option<String> {
        self.scripts.get(name).cloned()
    }
}
