//! Server configuration sections.
//!
//! Loaded by the binary from built-in defaults, then the TOML config file,
//! then `PARLEY__SECTION__KEY` environment variables.

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::auth::AuthConfig;
use crate::coordinator::CoordinatorConfig;
use crate::producer::DEFAULT_MAX_ATTEMPTS;
use crate::store::DEFAULT_MAX_BATCH_ENTRIES;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub producer: ProducerConfig,
    pub tools: ToolsConfig,
    pub coordinator: CoordinatorConfig,
    pub provider: ProviderConfig,
    pub auth: AuthConfig,
    pub metadata: MetadataConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Request body limit in megabytes.
    pub max_body_mb: usize,
    /// Allowed CORS origins. Empty denies cross-origin requests outside dev mode.
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            max_body_mb: 10,
            cors_origins: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn max_body_bytes(&self) -> usize {
        self.max_body_mb.max(1) * 1024 * 1024
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// A Durable-Streams-style server over HTTP.
    #[default]
    Http,
    /// Process-local streams, lost on restart.
    Memory,
}

impl std::fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreBackend::Http => write!(f, "http"),
            StoreBackend::Memory => write!(f, "memory"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Base URL of the stream server; a session lives at `{base_url}/{id}`.
    pub base_url: String,
    /// Timeout for catch-up reads and appends. Live reads are unbounded.
    pub timeout_secs: u64,
    /// Catch-up batch cap of the memory backend.
    pub max_batch_entries: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Http,
            base_url: "http://127.0.0.1:4437/v1/stream".to_string(),
            timeout_secs: 30,
            max_batch_entries: DEFAULT_MAX_BATCH_ENTRIES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    pub max_attempts: u32,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// JSON file listing the client-side tools advertised to the model.
    pub definitions_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// OpenAI-compatible API base, without `/chat/completions`.
    pub base_url: String,
    /// API key. Supports `env:VAR_NAME` indirection.
    pub api_key: Option<String>,
    pub connect_timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: Some("env:OPENAI_API_KEY".to_string()),
            connect_timeout_secs: 10,
        }
    }
}

impl ProviderConfig {
    /// Resolve the API key, expanding `env:VAR_NAME` syntax. A referenced
    /// variable that is unset resolves to no key.
    pub fn resolve_api_key(&self) -> Result<Option<String>> {
        let Some(value) = &self.api_key else {
            return Ok(None);
        };
        match value.strip_prefix("env:") {
            Some("") => Err(anyhow!("provider.api_key names an empty variable")),
            Some(var) => Ok(std::env::var(var).ok().filter(|v| !v.is_empty())),
            None => Ok(Some(value.clone())),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    /// SQLite database path. `:memory:` keeps metadata in process; unset
    /// uses `parley.db` in the data directory.
    pub database: Option<String>,
}

impl MetadataConfig {
    pub fn is_in_memory(&self) -> bool {
        self.database.as_deref() == Some(":memory:")
    }
}
