use crate::error::{GatewayError, Result};
use crate::providers::Provider;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Ceiling for a whole unary upstream call.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Longest allowed gap between two chunks of an upstream stream.
    #[serde(default = "default_stream_idle_timeout")]
    pub stream_idle_timeout_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_usage_log")]
    pub usage_log: PathBuf,
    #[serde(default)]
    pub providers: ProvidersConfig,
    /// Model aliases: requested name -> upstream name.
    #[serde(default)]
    pub models: HashMap<String, String>,
    /// Keys callers present to the gateway. Empty means the gateway is open.
    #[serde(default)]
    pub access_keys: Vec<AccessKey>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub openai: ProviderConfig,
    #[serde(default)]
    pub anthropic: ProviderConfig,
    #[serde(default)]
    pub gemini: ProviderConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Environment variable holding the key; the preset's variable when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessKey {
    pub key: String,
    pub name: String,
    /// When set, the key may only reach models served by this provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<Provider>,
}

/// Everything needed to call one provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub base_url: String,
    pub api_key: String,
}

fn default_port() -> u16 {
    4222
}

fn default_request_timeout() -> u64 {
    300
}

fn default_stream_idle_timeout() -> u64 {
    120
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_usage_log() -> PathBuf {
    PathBuf::from("ai-gateway-usage.jsonl")
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
            stream_idle_timeout_secs: default_stream_idle_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            usage_log: default_usage_log(),
            providers: ProvidersConfig::default(),
            models: HashMap::new(),
            access_keys: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Search standard locations for a config file, falling back to defaults.
    /// Priority: CLI arg > CWD > XDG config > home dir
    pub fn find_and_load(explicit_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit_path {
            return Self::load(path);
        }

        for candidate in config_search_paths() {
            if candidate.exists() {
                tracing::info!(path = %candidate.display(), "Loading config");
                return Self::load(&candidate);
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Upstream model name for a requested one.
    pub fn resolve_model<'a>(&'a self, requested: &'a str) -> &'a str {
        self.models.get(requested).map_or(requested, String::as_str)
    }

    pub fn provider(&self, provider: Provider) -> &ProviderConfig {
        match provider {
            Provider::OpenAi => &self.providers.openai,
            Provider::Anthropic => &self.providers.anthropic,
            Provider::Gemini => &self.providers.gemini,
        }
    }

    /// Configured base URL or the preset default, without a trailing slash.
    pub fn effective_base_url(&self, provider: Provider) -> String {
        self.provider(provider)
            .base_url
            .as_deref()
            .unwrap_or(provider.preset().base_url)
            .trim_end_matches('/')
            .to_string()
    }

    /// Inline key first, then the configured or preset environment variable.
    pub fn resolve_api_key(&self, provider: Provider) -> Result<String> {
        let config = self.provider(provider);
        if let Some(key) = config.api_key.as_ref().filter(|k| !k.is_empty()) {
            return Ok(key.clone());
        }

        let env = config
            .api_key_env
            .as_deref()
            .unwrap_or(provider.preset().default_api_key_env);
        std::env::var(env).map_err(|_| {
            GatewayError::config(format!(
                "No API key for provider '{provider}': environment variable '{env}' not set"
            ))
        })
    }

    pub fn credentials(&self, provider: Provider) -> Result<Credentials> {
        Ok(Credentials {
            base_url: self.effective_base_url(provider),
            api_key: self.resolve_api_key(provider)?,
        })
    }

    pub fn requires_access_key(&self) -> bool {
        !self.access_keys.is_empty()
    }

    pub fn find_access_key(&self, presented: &str) -> Option<&AccessKey> {
        self.access_keys.iter().find(|k| k.key == presented)
    }
}

pub fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // CWD
    paths.push(PathBuf::from("ai-gateway.toml"));

    // XDG / platform config dir
    if cfg!(target_os = "macos") {
        if let Some(home) = home_dir() {
            paths.push(
                home.join("Library")
                    .join("Application Support")
                    .join("ai-gateway")
                    .join("config.toml"),
            );
        }
    } else {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            paths.push(PathBuf::from(xdg).join("ai-gateway").join("config.toml"));
        }
        if let Some(home) = home_dir() {
            paths.push(home.join(".config").join("ai-gateway").join("config.toml"));
        }
    }

    // Home directory fallback
    if let Some(home) = home_dir() {
        paths.push(home.join(".ai-gateway.toml"));
    }

    paths
}

fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
