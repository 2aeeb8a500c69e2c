//! Atomic file writes.
//!
//! Every file the graph owns is replaced wholesale: content is written to a
//! temp sibling in the same directory, then renamed over the target.  A
//! reader therefore sees either the old file or the new file, never a
//! partial prefix.  A crash mid-write leaves at worst an orphan temp file.

use std::fs;
use std::path::Path;

use uuid::Uuid;

use crate::error::GraphError;

/// Write `contents` to `path` atomically.  The parent directory must exist.
pub fn atomic_write(path: &Path, contents: &str) -> Result<(), GraphError> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let suffix: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
    let tmp = dir.join(format!(".tmp-{suffix}"));

    fs::write(&tmp, contents).map_err(|e| GraphError::io(&tmp, e))?;

    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(GraphError::io(path, err));
    }
    Ok(())
}

/// Like [`atomic_write`], but creates the parent directory first.
pub fn atomic_write_creating(path: &Path, contents: &str) -> Result<(), GraphError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| GraphError::io(parent, e))?;
    }
    atomic_write(path, contents)
}

/// Read a file to string, mapping ENOENT to `Ok(None)`.
pub fn read_optional(path: &Path) -> Result<Option<String>, GraphError> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(GraphError::io(path, err)),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("omg-fsio-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = scratch_dir();
        let path = dir.join("a.md");
        atomic_write(&path, "hello").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "hello");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn overwrite_replaces_content_completely() {
        let dir = scratch_dir();
        let path = dir.join("a.md");
        atomic_write(&path, "a very long first version of the file").unwrap();
        atomic_write(&path, "short").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "short");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = scratch_dir();
        let path = dir.join("nope").join("a.md");
        assert!(atomic_write(&path, "x").is_err());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn creating_variant_makes_parents() {
        let dir = scratch_dir();
        let path = dir.join("deep/nested/a.md");
        atomic_write_creating(&path, "x").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "x");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn no_temp_files_left_after_success() {
        let dir = scratch_dir();
        atomic_write(&dir.join("a.md"), "x").unwrap();
        let leftovers: Vec<_> = fs::read_dir(&dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn read_optional_maps_enoent_to_none() {
        let dir = scratch_dir();
        assert!(read_optional(&dir.join("absent.md")).unwrap().is_none());
        let _ = fs::remove_dir_all(dir);
    }
}
