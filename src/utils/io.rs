//! File I/O with consistent error handling.

use crate::error::{Error, Result};
use std::fs;
use std::path::Path;

/// Read a file, mapping failures to `internal.io_error` tagged with `operation`.
pub fn read_file(path: &Path, operation: &str) -> Result<String> {
    fs::read_to_string(path)
        .map_err(|e| Error::internal_io(e.to_string(), Some(operation.to_string())))
}

/// Write through a sibling `.tmp` file and rename over the target, so the
/// inventory is never observed half-written.
pub fn write_file_atomic(path: &Path, content: &str, operation: &str) -> Result<()> {
    let (Some(parent), Some(filename)) = (path.parent(), path.file_name()) else {
        return Err(Error::internal_io(
            format!("Invalid path: {}", path.display()),
            Some(operation.to_string()),
        ));
    };

    let tmp_path = parent.join(format!("{}.tmp", filename.to_string_lossy()));

    fs::write(&tmp_path, content).map_err(|e| {
        Error::internal_io(e.to_string(), Some(format!("{} (write temp)", operation)))
    })?;

    fs::rename(&tmp_path, path)
        .map_err(|e| Error::internal_io(e.to_string(), Some(format!("{} (rename)", operation))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_maps_to_io_error() {
        let err = read_file(Path::new("/nonexistent/nodes.json"), "read inventory").unwrap_err();
        assert_eq!(err.code.as_str(), "internal.io_error");
        assert_eq!(err.details["context"], "read inventory");
    }

    #[test]
    fn atomic_write_replaces_content_and_leaves_no_temp() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nodes.json");
        std::fs::write(&path, "[]").unwrap();

        write_file_atomic(&path, "[{}]", "write inventory").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[{}]");
        assert!(!dir.path().join("nodes.json.tmp").exists());
    }
}
