//! Atomic JSON files.
//!
//! Every durable structure in the crate (session index, session detail files, the vector index
//! snapshot) goes through [`write_json_atomic`]: the value is serialized into a temporary file
//! created in the destination directory, flushed to disk, then renamed over the target. A reader
//! therefore sees either the previous file or the new one, never a torn write.
//!
//! [`read_json`] tells a missing file (`Ok(None)`) apart from an unreadable or malformed one
//! (`Err(PersistenceFailure)`).

use serde::{Serialize, de::DeserializeOwned};
use std::{
    fs,
    io::{BufWriter, ErrorKind, Write},
    path::Path,
};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{Error, Result};

/// Create `dir` (and parents) if it does not exist yet.
pub fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| Error::persistence(dir, e))
}

/// Serialize `value` as pretty JSON and atomically replace `path` with it.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    ensure_dir(dir)?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| Error::persistence(dir, e))?;
    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        serde_json::to_writer_pretty(&mut writer, value).map_err(|e| Error::persistence(path, e))?;
        writer
            .write_all(b"\n")
            .and_then(|_| writer.flush())
            .map_err(|e| Error::persistence(path, e))?;
    }
    tmp.as_file()
        .sync_all()
        .map_err(|e| Error::persistence(path, e))?;
    tmp.persist(path).map_err(|e| Error::persistence(path, e))?;
    sync_dir(dir);

    debug!("Wrote {}", path.display());
    Ok(())
}

/// Read and decode a JSON file. A missing file is `Ok(None)`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::persistence(path, e)),
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| Error::persistence(path, e))
}

/// Remove a file, treating "already gone" as success.
pub fn remove_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::persistence(path, e)),
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    // Best effort: the rename is already visible to readers of this process.
    if let Ok(handle) = fs::File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/sample.json");
        let value = Sample {
            name: "laptops".to_string(),
            count: 3,
        };

        write_json_atomic(&path, &value).unwrap();
        let loaded: Option<Sample> = read_json(&path).unwrap();
        assert_eq!(loaded, Some(value));
    }

    #[test]
    fn test_missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        let loaded: Option<Sample> = read_json(&dir.path().join("absent.json")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_malformed_file_is_persistence_failure() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{ not json").unwrap();

        let loaded: Result<Option<Sample>> = read_json(&path);
        assert!(matches!(loaded, Err(Error::PersistenceFailure { .. })));
    }

    #[test]
    fn test_overwrite_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sample.json");
        for count in 0..3 {
            let value = Sample {
                name: "x".to_string(),
                count,
            };
            write_json_atomic(&path, &value).unwrap();
        }

        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let loaded: Sample = read_json(&path).unwrap().unwrap();
        assert_eq!(loaded.count, 2);
    }

    #[test]
    fn test_remove_missing_file_is_ok() {
        let dir = TempDir::new().unwrap();
        assert!(remove_file(&dir.path().join("gone.json")).is_ok());
    }
}
