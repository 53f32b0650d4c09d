use crate::state::CapturedOutput;
use crate::StateError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const BUNDLE_KIND: &str = "backup";
const BUNDLE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BundleStatus {
    Success,
    Partial,
    Error,
}

impl fmt::Display for BundleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BundleStatus::Success => write!(f, "success"),
            BundleStatus::Partial => write!(f, "partial"),
            BundleStatus::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BundleComponent {
    pub timestamp: String,
    pub status: BundleStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub outputs: Vec<CapturedOutput>,
}

/// Output artifact of a backup run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupBundle {
    pub version: u32,
    pub kind: String,
    pub timestamp: String,
    pub status: BundleStatus,
    #[serde(default)]
    pub components: BTreeMap<String, BundleComponent>,
}

impl Default for BackupBundle {
    fn default() -> Self {
        Self::new()
    }
}

impl BackupBundle {
    pub fn new() -> Self {
        Self {
            version: BUNDLE_FORMAT_VERSION,
            kind: BUNDLE_KIND.to_owned(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            status: BundleStatus::Success,
            components: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, component: &str, entry: BundleComponent) {
        self.components.insert(component.to_owned(), entry);
        self.status = self.overall_status();
    }

    /// `success` when every component succeeded, `error` when none did.
    pub fn overall_status(&self) -> BundleStatus {
        let total = self.components.len();
        let ok = self
            .components
            .values()
            .filter(|c| c.status == BundleStatus::Success)
            .count();
        if ok == total {
            BundleStatus::Success
        } else if ok == 0 {
            BundleStatus::Error
        } else {
            BundleStatus::Partial
        }
    }

    pub fn to_json(&self) -> Result<String, StateError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(content: &[u8]) -> Result<Self, StateError> {
        let bundle: BackupBundle = serde_json::from_slice(content)?;
        if bundle.kind != BUNDLE_KIND {
            return Err(StateError::KindMismatch {
                expected: BUNDLE_KIND.to_owned(),
                found: bundle.kind,
            });
        }
        if bundle.version != BUNDLE_FORMAT_VERSION {
            return Err(StateError::VersionMismatch {
                kind: BUNDLE_KIND.to_owned(),
                expected: BUNDLE_FORMAT_VERSION,
                found: bundle.version,
            });
        }
        Ok(bundle)
    }
}
