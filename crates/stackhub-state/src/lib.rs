//! Durable stack state for stackhub.
//!
//! This crate provides the persistence layer: the versioned `StateManifest`
//! snapshot with per-component `StateStep` records and the operations log,
//! the `BackupBundle` artifact, a `Storage` collaborator trait with an atomic
//! local filesystem implementation (`FsStorage`), and `StateLayout` for the
//! on-disk state directory.

pub mod bundle;
pub mod layout;
pub mod state;
pub mod storage;

pub use bundle::{BackupBundle, BundleComponent, BundleStatus, BUNDLE_KIND};
pub use layout::StateLayout;
pub use state::{
    generate_deployment_id, CapturedOutput, ComponentStatus, LockedParameter, Operation,
    OperationStatus, StackStatus, StateManifest, StateMeta, StateStep, Verb, STATE_FORMAT_VERSION,
    STATE_KIND,
};
pub use storage::{FileInfo, FsStorage, StateStore, Storage};

use std::path::Path;
use thiserror::Error;

/// Fsync a directory so that a preceding `rename()` is durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("integrity check failed for '{path}': expected {expected}, got {actual}")]
    IntegrityFailure {
        path: String,
        expected: String,
        actual: String,
    },
    #[error("unsupported {kind} document version {found}, expected {expected}")]
    VersionMismatch {
        kind: String,
        expected: u32,
        found: u32,
    },
    #[error("unexpected document kind '{found}', expected '{expected}'")]
    KindMismatch { expected: String, found: String },
    #[error("invalid storage path: {0}")]
    InvalidPath(String),
}

impl StateError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StateError::NotFound(_))
    }
}
