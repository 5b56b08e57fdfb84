//! Agent profiles loaded from YAML.

use std::path::Path;

use serde::Deserialize;

use crate::error::{ForgeError, Result};

/// A named configuration overriding the system prompt, tool allowlist,
/// provider, model, and iteration limit.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub max_iterations: usize,
}

impl Profile {
    /// Read a profile from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| ForgeError::Profile(format!("reading {}: {e}", path.display())))?;
        serde_yaml::from_str(&data)
            .map_err(|e| ForgeError::Profile(format!("parsing {}: {e}", path.display())))
    }
}
