//! PathFS helpers: recursive directory creation, safe mkdir, file writing.
//!
//! Grounded on `examples/original_source/utils.c`'s `mkdirp`/`mkdir_safe`/
//! `write_file` trio. Rust's `std::fs::create_dir_all` already gives
//! `mkdirp`'s behavior (and is what's used below instead of hand-rolling the
//! truncate-and-walk loop), but `mkdir_safe`'s "ignore EEXIST" and
//! `write_file`'s single-shot write are kept as named operations since
//! higher-level Filesystem Builder code calls them by these semantics.

use std::io::Write;
use std::path::Path;

use crate::error::MicroboxError;

/// Creates `path` and all missing parent directories, tolerating a
/// pre-existing directory at `path` itself (mirrors `mkdirp`/`maybe_mkdir`'s
/// EEXIST tolerance at every level, which `create_dir_all` already gives).
pub fn mkdirp(path: impl AsRef<Path>) -> Result<(), MicroboxError> {
    std::fs::create_dir_all(&path).map_err(|e| MicroboxError::io("mkdir -p", e))
}

/// Creates a single directory, ignoring `EEXIST` (`mkdir_safe`).
pub fn mkdir_safe(path: impl AsRef<Path>) -> Result<(), MicroboxError> {
    match std::fs::create_dir(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(MicroboxError::io("mkdir", e)),
    }
}

/// Creates an empty regular file at `path`, creating parent directories
/// first. Used for bind-mount targets whose host source is a file rather
/// than a directory.
pub fn touch(path: impl AsRef<Path>) -> Result<(), MicroboxError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        mkdirp(parent)?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(path)
        .map(|_| ())
        .map_err(|e| MicroboxError::io("touch", e))
}

/// Writes `data` to `path` as a single `write_all` call on an already-open
/// file. Short writes are surfaced as an error by `write_all` itself.
pub fn write_file(path: impl AsRef<Path>, data: &str) -> Result<(), MicroboxError> {
    let mut f = std::fs::OpenOptions::new()
        .write(true)
        .open(&path)
        .map_err(|e| MicroboxError::io("open", e))?;
    f.write_all(data.as_bytes())
        .map_err(|e| MicroboxError::io("write", e))
}

/// `is_directory` from `utils.c`: true only if `path` exists and is a
/// directory; any stat failure (including non-existence) yields `false`.
pub fn is_directory(path: impl AsRef<Path>) -> bool {
    path.as_ref().is_dir()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn mkdirp_creates_nested_dirs() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a/b/c");
        mkdirp(&nested).unwrap();
        assert!(nested.is_dir());
    }

    #[test]
    fn mkdirp_tolerates_existing_dir() {
        let dir = tempdir().unwrap();
        mkdirp(dir.path()).unwrap();
        mkdirp(dir.path()).unwrap();
    }

    #[test]
    fn touch_creates_parent_and_file() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("nested/file.txt");
        touch(&file).unwrap();
        assert!(file.is_file());
    }

    #[test]
    fn is_directory_false_for_missing_path() {
        assert!(!is_directory("/no/such/path/microbox-test"));
    }
}
