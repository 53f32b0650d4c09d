use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// User defaults read from `~/.config/stackhub/config.json`.
/// Command-line flags take precedence over every field.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CliConfig {
    #[serde(default)]
    pub state_dir: Option<String>,
    /// Overrides the manifest's `lifecycle.delegate`.
    #[serde(default)]
    pub delegate: Option<String>,
    #[serde(default)]
    pub ready_interval_secs: Option<u64>,
    #[serde(default)]
    pub ready_wait_secs: Option<u64>,
    /// Requirement tuning rules applied before the ones given on the command line.
    #[serde(default)]
    pub optional_requires: Vec<String>,
}

impl CliConfig {
    /// Load the default config file; a missing file yields the defaults.
    pub fn load_default() -> Result<Self, String> {
        match default_config_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn load(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config {}: {e}", path.display()))?;
        serde_json::from_str(&content)
            .map_err(|e| format!("invalid config {}: {e}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| format!("create config dir: {e}"))?;
        }
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| format!("JSON serialization failed: {e}"))?;
        std::fs::write(path, content).map_err(|e| format!("write config: {e}"))
    }
}

fn default_config_path() -> Option<PathBuf> {
    let home = std::env::var("HOME").ok()?;
    Some(PathBuf::from(home).join(".config/stackhub/config.json"))
}
