//! Runtime configuration for the launch engine.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{NestboxError, Result};

/// Root configuration for the nestbox launcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NestboxConfig {
    /// Directory holding per-container staging mounts (`<name>.dev`, ...).
    pub state_dir: PathBuf,
    /// Bind a pre-populated meminfo snapshot over `/proc/meminfo`.
    pub meminfo_virtualization: bool,
    /// Stack size in bytes for the duplicated child.
    pub stack_size: usize,
}

impl Default for NestboxConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(crate::constants::DEFAULT_STATE_DIR),
            meminfo_virtualization: false,
            stack_size: crate::constants::DEFAULT_STACK_SIZE,
        }
    }
}

impl NestboxConfig {
    /// Loads a configuration from a JSON file. Missing keys take defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| NestboxError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(serde_json::from_str(&raw)?)
    }
}
