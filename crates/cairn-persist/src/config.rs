//! Persistence configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Where standalone segment stores live and how carefully files are written.
///
/// Every field has a default, so a JSON config only needs the keys it
/// changes:
///
/// ```
/// use cairn_persist::config::PersistConfig;
///
/// let config = PersistConfig::from_json_str(r#"{ "backup_slots": 5 }"#).unwrap();
/// assert_eq!(config.backup_slots, 5);
/// assert!(config.sync);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PersistConfig {
    /// Directory holding one file per segment at rest.
    pub segment_dir: PathBuf,
    /// Number of rotating backups kept next to the artifact. Zero disables
    /// backups.
    pub backup_slots: u32,
    /// Whether to fsync files and their directories before relying on them.
    pub sync: bool,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            segment_dir: PathBuf::from("segments"),
            backup_slots: 3,
            sync: true,
        }
    }
}

impl PersistConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }
}
