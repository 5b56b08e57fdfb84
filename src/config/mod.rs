//! Configuration loaded from `forge.yaml`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{ForgeError, Result};
use crate::tools::ToolServerConfig;
use crate::util::expand_env;

/// One LLM provider endpoint. The `models` map holds named roles; `default`
/// is the conversation model, `utility` an optional lightweight one.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub models: HashMap<String, String>,
}

impl ProviderConfig {
    /// Heuristic: does this look like an Ollama instance?
    pub fn is_ollama(&self) -> bool {
        self.base_url.contains(":11434") || self.base_url.to_lowercase().contains("ollama")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub max_iterations: usize,
    pub context_max_tokens: usize,
    pub profiles_dir: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            context_max_tokens: 6000,
            profiles_dir: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        Self {
            db_path: format!("{home}/.forge/forge.db"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub providers: HashMap<String, ProviderConfig>,
    pub default_provider: String,
    pub agent: AgentConfig,
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub tools: HashMap<String, ToolServerConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            providers: HashMap::new(),
            default_provider: "ollama".into(),
            agent: AgentConfig::default(),
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            tools: HashMap::new(),
        }
    }
}

impl Config {
    /// Load `forge.yaml` from the working directory or `~/.forge/`.
    pub fn load() -> Result<Self> {
        let mut candidates = vec![PathBuf::from("forge.yaml")];
        if let Ok(home) = std::env::var("HOME") {
            candidates.push(Path::new(&home).join(".forge").join("forge.yaml"));
        }
        for path in &candidates {
            if path.exists() {
                return Self::load_from(path);
            }
        }
        Err(ForgeError::Configuration(
            "forge.yaml not found in . or ~/.forge".into(),
        ))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| ForgeError::Configuration(format!("reading {}: {e}", path.display())))?;
        Self::parse(&data)
    }

    pub fn parse(data: &str) -> Result<Self> {
        let mut cfg: Config = serde_yaml::from_str(data)
            .map_err(|e| ForgeError::Configuration(format!("parsing config: {e}")))?;
        for provider in cfg.providers.values_mut() {
            provider.api_key = expand_env(&provider.api_key);
        }
        Ok(cfg)
    }

    /// Config for a named provider; an empty name means the default.
    pub fn provider(&self, name: &str) -> Result<&ProviderConfig> {
        let name = if name.is_empty() {
            &self.default_provider
        } else {
            name
        };
        self.providers
            .get(name)
            .ok_or_else(|| ForgeError::Configuration(format!("unknown provider: {name}")))
    }
}
