use crate::storage::FsStorage;
use crate::StateError;
use std::fs;
use std::path::{Path, PathBuf};

const STATE_FILE: &str = "state.json";

/// Directory layout of a local stackhub state directory.
///
/// Storage keys are relative to [`root`](Self::root); the lock file is a
/// local path because it is held with an OS-level advisory lock.
#[derive(Debug, Clone)]
pub struct StateLayout {
    root: PathBuf,
}

impl StateLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn state_key(&self) -> &'static str {
        STATE_FILE
    }

    #[inline]
    pub fn state_file(&self) -> PathBuf {
        self.root.join(STATE_FILE)
    }

    #[inline]
    pub fn lock_file(&self) -> PathBuf {
        self.root.join(".lock")
    }

    #[inline]
    pub fn backups_dir(&self) -> PathBuf {
        self.root.join("backups")
    }

    pub fn bundle_key(&self, name: &str) -> String {
        format!("backups/{name}.json")
    }

    pub fn storage(&self) -> FsStorage {
        FsStorage::new(&self.root)
    }

    pub fn initialize(&self) -> Result<(), StateError> {
        fs::create_dir_all(&self.root)?;
        fs::create_dir_all(self.backups_dir())?;
        Ok(())
    }
}
