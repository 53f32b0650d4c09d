use crate::bundle::BackupBundle;
use crate::state::StateManifest;
use crate::{fsync_dir, StateError};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub size: u64,
    pub modified: Option<String>,
}

/// Read/write access to named documents (local files or remote objects).
///
/// Writers must be atomic enough that a reader never observes a partial
/// document, and a missing document must surface as [`StateError::NotFound`].
pub trait Storage: Send + Sync {
    fn read(&self, path: &str) -> Result<Vec<u8>, StateError>;

    fn write(&self, path: &str, data: &[u8]) -> Result<(), StateError>;

    fn stat(&self, path: &str) -> Result<FileInfo, StateError>;

    /// Verify that `path` can be written before any work starts.
    fn check(&self, path: &str) -> Result<(), StateError>;
}

/// Local filesystem storage rooted at a directory.
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StateError> {
        let rel = Path::new(path);
        if path.is_empty()
            || rel
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(StateError::InvalidPath(path.to_owned()));
        }
        Ok(self.root.join(rel))
    }
}

fn map_not_found(err: std::io::Error, path: &str) -> StateError {
    if err.kind() == ErrorKind::NotFound {
        StateError::NotFound(path.to_owned())
    } else {
        StateError::Io(err)
    }
}

impl Storage for FsStorage {
    fn read(&self, path: &str) -> Result<Vec<u8>, StateError> {
        let full = self.resolve(path)?;
        fs::read(&full).map_err(|e| map_not_found(e, path))
    }

    fn write(&self, path: &str, data: &[u8]) -> Result<(), StateError> {
        let full = self.resolve(path)?;
        let dir = full
            .parent()
            .map_or_else(|| self.root.clone(), Path::to_path_buf);
        fs::create_dir_all(&dir)?;

        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&full).map_err(|e| StateError::Io(e.error))?;
        fsync_dir(&dir)?;
        debug!("wrote {} bytes to {}", data.len(), full.display());
        Ok(())
    }

    fn stat(&self, path: &str) -> Result<FileInfo, StateError> {
        let full = self.resolve(path)?;
        let meta = fs::metadata(&full).map_err(|e| map_not_found(e, path))?;
        let modified = meta
            .modified()
            .ok()
            .map(|t| chrono::DateTime::<chrono::Utc>::from(t).to_rfc3339());
        Ok(FileInfo {
            size: meta.len(),
            modified,
        })
    }

    fn check(&self, path: &str) -> Result<(), StateError> {
        let full = self.resolve(path)?;
        let dir = full
            .parent()
            .map_or_else(|| self.root.clone(), Path::to_path_buf);
        fs::create_dir_all(&dir)?;
        // A temp file in the target directory proves the final rename will work.
        let probe = NamedTempFile::new_in(&dir)?;
        drop(probe);
        if full.exists() && fs::metadata(&full)?.permissions().readonly() {
            return Err(StateError::Io(std::io::Error::new(
                ErrorKind::PermissionDenied,
                format!("{} is read-only", full.display()),
            )));
        }
        Ok(())
    }
}

/// Loads and saves the state document through a [`Storage`] backend.
pub struct StateStore {
    storage: Box<dyn Storage>,
    key: String,
}

impl StateStore {
    pub fn new(storage: Box<dyn Storage>, key: impl Into<String>) -> Self {
        Self {
            storage,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn check(&self) -> Result<(), StateError> {
        self.storage.check(&self.key)
    }

    /// Load the persisted state, or `None` on a first run.
    pub fn load(&self) -> Result<Option<StateManifest>, StateError> {
        match self.storage.read(&self.key) {
            Ok(content) => Ok(Some(StateManifest::from_json(&content, &self.key)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn save(&self, state: &StateManifest) -> Result<(), StateError> {
        let json = state.to_json()?;
        self.storage.write(&self.key, json.as_bytes())
    }

    pub fn write_bundle(&self, key: &str, bundle: &BackupBundle) -> Result<(), StateError> {
        let json = bundle.to_json()?;
        self.storage.write(key, json.as_bytes())
    }

    pub fn read_bundle(&self, key: &str) -> Result<BackupBundle, StateError> {
        BackupBundle::from_json(&self.storage.read(key)?)
    }
}
