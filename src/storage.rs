//! # Storage Adapter
//!
//! The one port the core requires of a remote repository: durable puts,
//! streaming-free gets, deletes, and prefix listing. Names use `/` as the
//! separator regardless of platform; the repository layout is
//! `objects/{first_3_hex}/{full_hex}` plus `snapshots/{uuid}` and a single
//! well-known recovery object.
//!
//! The local filesystem adapter ships in-crate and mirrors the cloud
//! adapters' API so the engine and tests are backend-agnostic. Cloud
//! backends (HTTP object stores with their own retry/backoff policies) are
//! external collaborators and plug in through the same trait.

use crate::error::StorageError;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

type Result<T> = std::result::Result<T, StorageError>;

/// The storage port. Implementations must provide per-object read-after-write
/// consistency at a fully qualified name; nothing more is assumed.
pub trait Storage: Send + Sync {
    /// Durably stores `data` at `name`, overwriting any existing content.
    fn put(&self, name: &str, data: &[u8]) -> Result<()>;

    /// Retrieves the content stored at `name`.
    fn get(&self, name: &str) -> Result<Vec<u8>>;

    /// Removes (or tombstones) `name`.
    fn delete(&self, name: &str) -> Result<()>;

    /// Enumerates stored names beginning with `prefix`.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Stores repository contents under a local directory.
pub struct FilesystemStorage {
    base_dir: PathBuf,
}

impl FilesystemStorage {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn resolve(&self, name: &str) -> PathBuf {
        let mut path = self.base_dir.clone();
        for part in name.split('/') {
            path.push(part);
        }
        path
    }
}

impl Storage for FilesystemStorage {
    fn put(&self, name: &str, data: &[u8]) -> Result<()> {
        let path = self.resolve(name);
        let parent = path.parent().unwrap_or(&self.base_dir);
        fs::create_dir_all(parent)?;

        // Write-then-rename so a crash never leaves a torn object behind.
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(data)?;
        tmp.persist(&path).map_err(|e| StorageError::Io(e.error))?;
        Ok(())
    }

    fn get(&self, name: &str) -> Result<Vec<u8>> {
        match fs::read(self.resolve(name)) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.resolve(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        if !self.base_dir.exists() {
            return Ok(names);
        }

        for entry in walkdir::WalkDir::new(&self.base_dir) {
            let entry = entry.map_err(|e| {
                StorageError::Io(std::io::Error::other(e.to_string()))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&self.base_dir)
                .unwrap_or(entry.path());
            let name = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if name.starts_with(prefix) {
                names.push(name);
            }
        }

        names.sort();
        Ok(names)
    }
}

/// Returns the file path of a directory-backed storage for a stored name.
/// Used by tests to poke at repository internals.
pub fn local_path(base_dir: &Path, name: &str) -> PathBuf {
    FilesystemStorage::new(base_dir).resolve(name)
}
