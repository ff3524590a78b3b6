use crate::types::{ProviderRef, SearchStrategy, ToolDescriptor};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

const DEFAULT_MODEL: &str = "claude-sonnet-4-5";
const DEFAULT_CONFIG_PATH: &str = "config/toolscout.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config from {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config from {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub model: ModelConfig,
    pub engine: EngineConfig,
    pub tools: Vec<ToolEntry>,
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model_name")]
    pub name: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Embedding model for the semantic index; semantic search is disabled
    /// when absent.
    #[serde(default)]
    pub embedding_model: Option<String>,
    #[serde(default)]
    pub embedding_base_url: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            name: default_model_name(),
            api_key: None,
            embedding_model: None,
            embedding_base_url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    #[serde(default = "default_strategy")]
    pub default_strategy: SearchStrategy,
    #[serde(default = "default_similarity_floor")]
    pub similarity_floor: f32,
    #[serde(default = "default_dispatch_timeout")]
    pub dispatch_timeout_secs: u64,
    #[serde(default = "default_exchange_timeout")]
    pub exchange_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            default_strategy: default_strategy(),
            similarity_floor: default_similarity_floor(),
            dispatch_timeout_secs: default_dispatch_timeout(),
            exchange_timeout_secs: default_exchange_timeout(),
        }
    }
}

/// One locally-executed tool declared in configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolEntry {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: Option<Value>,
    #[serde(default)]
    pub examples: Vec<String>,
    #[serde(default)]
    pub eager: bool,
}

impl ToolEntry {
    pub fn into_descriptor(self) -> ToolDescriptor {
        ToolDescriptor {
            id: self.name,
            description: self.description,
            input_schema: self
                .input_schema
                .unwrap_or_else(|| serde_json::json!({ "type": "object", "properties": {} })),
            examples: self.examples.into_iter().map(Value::String).collect(),
            eager: self.eager,
            provider: ProviderRef::Local,
        }
    }
}

/// Command line and environment for one remote capability provider.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub workdir: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawConfig {
    #[serde(default)]
    model: Option<ModelConfig>,
    #[serde(default)]
    engine: Option<EngineConfig>,
    #[serde(default)]
    tools: Vec<ToolEntry>,
    #[serde(default)]
    providers: Vec<ProviderConfig>,
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return read_config(path);
        }
        let default_path = Path::new(DEFAULT_CONFIG_PATH);
        match read_config(default_path) {
            Ok(config) => Ok(config),
            Err(ConfigError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                info!("Configuration file not found; using defaults");
                Ok(Self::default())
            }
            Err(other) => Err(other),
        }
    }

    pub fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            engine: EngineConfig::default(),
            tools: Vec::new(),
            providers: Vec::new(),
        }
    }
}

fn read_config(path: &Path) -> Result<AppConfig, ConfigError> {
    debug!(path = %path.display(), "Reading engine configuration file");
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let parsed: RawConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(AppConfig {
        model: parsed.model.unwrap_or_default(),
        engine: parsed.engine.unwrap_or_default(),
        tools: parsed.tools,
        providers: parsed.providers,
    })
}

fn default_base_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_model_name() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_max_turns() -> usize {
    10
}

fn default_strategy() -> SearchStrategy {
    SearchStrategy::LexicalRanked
}

fn default_similarity_floor() -> f32 {
    0.25
}

fn default_dispatch_timeout() -> u64 {
    30
}

fn default_exchange_timeout() -> u64 {
    120
}
