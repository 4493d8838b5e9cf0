//! Instance configuration loaded from `forge.toml`.

use crate::core::error::ForgeError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

fn default_timelock_secs() -> u64 {
    86_400
}
fn default_max_code_size() -> u64 {
    24_576
}
fn default_max_chunk_size() -> u64 {
    8_192
}
fn default_fee_per_byte() -> u64 {
    2
}
fn default_base_fee() -> u64 {
    100
}
fn default_engine_id() -> String {
    "routeforge.engine.v1".to_string()
}
fn default_bootstrap_admin() -> String {
    "operator".to_string()
}

/// Per-instance tunables. Missing file or missing keys fall back to defaults,
/// so a bare `init` is immediately usable.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ForgeConfig {
    /// Mandatory delay between commit and activation, in seconds.
    #[serde(default = "default_timelock_secs")]
    pub timelock_secs: u64,
    /// Ceiling for a directly deployed code unit, in bytes.
    #[serde(default = "default_max_code_size")]
    pub max_code_size: u64,
    /// Ceiling for one staged chunk, in bytes.
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u64,
    /// Deploy fee: base + per-byte component.
    #[serde(default = "default_base_fee")]
    pub base_fee: u64,
    #[serde(default = "default_fee_per_byte")]
    pub fee_per_byte: u64,
    /// Identity folded into address derivation. Two targets running the same
    /// engine id and code produce identical addresses for identical inputs.
    #[serde(default = "default_engine_id")]
    pub engine_id: String,
    /// Principal granted every permission at `init`.
    #[serde(default = "default_bootstrap_admin")]
    pub bootstrap_admin: String,
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            timelock_secs: default_timelock_secs(),
            max_code_size: default_max_code_size(),
            max_chunk_size: default_max_chunk_size(),
            base_fee: default_base_fee(),
            fee_per_byte: default_fee_per_byte(),
            engine_id: default_engine_id(),
            bootstrap_admin: default_bootstrap_admin(),
        }
    }
}

/// Load config from `<dir>/forge.toml`. No file = defaults (not an error).
pub fn load_config(dir: &Path) -> Result<ForgeConfig, ForgeError> {
    let config_path = dir.join("forge.toml");
    if !config_path.exists() {
        return Ok(ForgeConfig::default());
    }
    let content = fs::read_to_string(&config_path).map_err(ForgeError::IoError)?;
    let config: ForgeConfig =
        toml::from_str(&content).map_err(|e| ForgeError::Validation(e.to_string()))?;
    Ok(config)
}

pub fn write_default_config(dir: &Path) -> Result<(), ForgeError> {
    let config_path = dir.join("forge.toml");
    if config_path.exists() {
        return Ok(());
    }
    let rendered = toml::to_string_pretty(&ForgeConfig::default())
        .map_err(|e| ForgeError::Validation(e.to_string()))?;
    fs::write(&config_path, rendered).map_err(ForgeError::IoError)?;
    Ok(())
}
