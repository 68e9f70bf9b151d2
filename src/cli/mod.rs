use anyhow::{Context, Result};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use crate::security::failover::FailoverConfig;

pub const DEFAULT_ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_COPILOT_BASE_URL: &str = "https://api.githubcopilot.com";
pub const DEFAULT_AZURE_API_VERSION: &str = "2024-02-01";

/// Models served through the Copilot compatibility layer
pub const DEFAULT_COPILOT_MODELS: &[&str] = &["copilot-gpt-4", "copilot-gpt-3.5-turbo"];

/// Azure deployment environment keys, by the OpenAI model name they serve
const DEPLOYMENT_KEYS: &[(&str, &str)] = &[
    ("gpt-4", "AZURE_GPT4_DEPLOYMENT"),
    ("gpt-4o-mini", "AZURE_GPT4_MINI_DEPLOYMENT"),
    ("gpt-3.5-turbo", "AZURE_GPT35_DEPLOYMENT"),
];

/// Optional TOML file: a `[server]` section plus an `[env]` table whose
/// entries act as defaults for unset environment variables.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: Option<ServerConfig>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl FileConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_content(&content, &path.display().to_string())
    }

    pub fn from_content(content: &str, source_label: &str) -> Result<Self> {
        toml::from_str(content).with_context(|| format!("Failed to parse config from {}", source_label))
    }
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8082
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Timeout configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_api_timeout")]
    pub api_timeout_ms: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            api_timeout_ms: default_api_timeout(),
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

fn default_api_timeout() -> u64 {
    600_000 // 10 minutes
}

fn default_connect_timeout() -> u64 {
    10_000 // 10 seconds
}

/// Native Anthropic backend
#[derive(Debug, Clone)]
pub struct AnthropicSettings {
    pub api_key: Option<SecretString>,
    pub base_url: String,
}

/// Azure OpenAI backend (Chat-Completions or Responses)
#[derive(Debug, Clone)]
pub struct AzureSettings {
    pub api_key: Option<SecretString>,
    pub endpoint: Option<String>,
    pub api_version: String,
    pub default_deployment: Option<String>,
    /// OpenAI model name → deployment name
    pub deployments: BTreeMap<String, String>,
}

impl AzureSettings {
    /// Deployment serving `model`: explicit mapping, then the default deployment, then the model name.
    pub fn deployment_for(&self, model: &str) -> String {
        self.deployments
            .get(model)
            .or(self.default_deployment.as_ref())
            .cloned()
            .unwrap_or_else(|| model.to_string())
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some() && self.endpoint.is_some()
    }
}

/// GitHub Copilot compatibility layer
#[derive(Debug, Clone)]
pub struct CopilotSettings {
    pub enabled: bool,
    pub token: Option<SecretString>,
    pub base_url: String,
    pub models: Vec<String>,
}

impl CopilotSettings {
    pub fn is_configured(&self) -> bool {
        self.enabled && self.token.is_some()
    }
}

/// Claude model family → backend model name
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelAliases {
    pub big: String,
    pub small: String,
}

impl ModelAliases {
    /// Haiku maps to the small model; everything else to the big one.
    pub fn resolve(&self, model: &str) -> &str {
        let lower = model.to_ascii_lowercase();
        if lower.contains("haiku") {
            &self.small
        } else {
            &self.big
        }
    }
}

/// Retry settings for one backend attempt cycle
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

/// SSRF guard settings
#[derive(Debug, Clone, Default)]
pub struct SecuritySettings {
    pub allow_private: bool,
    pub allowlist: Vec<String>,
}

/// Output-token clamp applied to Responses API requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenLimits {
    pub min: u32,
    pub max: u32,
}

impl TokenLimits {
    /// Clamp `requested` into `[min, max]`; a request of 0 or 1 gets `max`.
    pub fn clamp(&self, requested: u32) -> u32 {
        if requested > 1 {
            requested.max(self.min).min(self.max)
        } else {
            self.max
        }
    }
}

/// Immutable gateway configuration, assembled once at startup.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub server: ServerConfig,
    pub anthropic: AnthropicSettings,
    pub azure: AzureSettings,
    pub openai_api_key: Option<SecretString>,
    pub copilot: CopilotSettings,
    pub models: ModelAliases,
    pub passthrough_mode: bool,
    pub failover: FailoverConfig,
    pub retry: RetrySettings,
    pub security: SecuritySettings,
    pub token_limits: TokenLimits,
    pub preferred_provider: String,
}

/// Key lookup with typed accessors and contextual errors.
struct Lookup<F: Fn(&str) -> Option<String>>(F);

impl<F: Fn(&str) -> Option<String>> Lookup<F> {
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn secret(&self, key: &str) -> Option<SecretString> {
        self.string(key).map(SecretString::new)
    }

    fn flag(&self, key: &str) -> Option<bool> {
        self.string(key)
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on"))
    }

    fn number<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: std::str::FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        match self.string(key) {
            Some(raw) => raw
                .parse::<T>()
                .with_context(|| format!("Invalid value for {}: '{}'", key, raw)),
            None => Ok(default),
        }
    }

    fn seconds(&self, key: &str, default: f64) -> Result<Duration> {
        let secs: f64 = self.number(key, default)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            anyhow::anyhow!(
                "Invalid value for {}: must be a non-negative number of seconds",
                key
            )
        })
    }
}

impl ProxyConfig {
    /// Load from the process environment, with an optional TOML file supplying defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => FileConfig::from_file(path)?,
            None => FileConfig::default(),
        };
        Self::from_sources(|key| std::env::var(key).ok(), &file)
    }

    /// Build from an arbitrary key lookup; `file.env` fills keys the lookup lacks.
    pub fn from_sources<F>(lookup: F, file: &FileConfig) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(|key: &str| lookup(key).or_else(|| file.env.get(key).cloned()));

        let mut server = file.server.clone().unwrap_or_default();
        if let Some(host) = env.string("BRIDGEWAY_HOST") {
            server.host = host;
        }
        server.port = env.number("BRIDGEWAY_PORT", server.port)?;
        if let Some(level) = env.string("BRIDGEWAY_LOG_LEVEL") {
            server.log_level = level;
        }
        server.timeouts.api_timeout_ms =
            env.number("BRIDGEWAY_API_TIMEOUT_MS", server.timeouts.api_timeout_ms)?;
        server.timeouts.connect_timeout_ms =
            env.number("BRIDGEWAY_CONNECT_TIMEOUT_MS", server.timeouts.connect_timeout_ms)?;

        let anthropic = AnthropicSettings {
            api_key: env.secret("ANTHROPIC_API_KEY"),
            base_url: env
                .string("ANTHROPIC_BASE_URL")
                .unwrap_or_else(|| DEFAULT_ANTHROPIC_BASE_URL.to_string()),
        };

        let deployments = DEPLOYMENT_KEYS
            .iter()
            .filter_map(|(model, key)| env.string(key).map(|d| (model.to_string(), d)))
            .collect();
        let azure = AzureSettings {
            api_key: env.secret("AZURE_OPENAI_KEY").or_else(|| env.secret("AZURE_API_KEY")),
            endpoint: env
                .string("OPENAI_BASE_URL")
                .or_else(|| env.string("AZURE_ENDPOINT"))
                .map(|e| e.trim_end_matches('/').to_string()),
            api_version: env
                .string("AZURE_API_VERSION")
                .unwrap_or_else(|| DEFAULT_AZURE_API_VERSION.to_string()),
            default_deployment: env.string("AZURE_OPENAI_DEPLOYMENT_NAME"),
            deployments,
        };

        let github_token = env.secret("GITHUB_TOKEN");
        let copilot = CopilotSettings {
            // A token without an explicit flag turns the layer on.
            enabled: env
                .flag("GITHUB_COPILOT_ENABLED")
                .unwrap_or(github_token.is_some()),
            token: github_token,
            base_url: env
                .string("GITHUB_COPILOT_BASE_URL")
                .unwrap_or_else(|| DEFAULT_COPILOT_BASE_URL.to_string()),
            models: env
                .string("GITHUB_COPILOT_MODELS")
                .map(|v| split_list(&v))
                .unwrap_or_else(|| DEFAULT_COPILOT_MODELS.iter().map(|m| m.to_string()).collect()),
        };

        let retry = RetrySettings {
            max_attempts: env.number("PASSTHROUGH_MAX_RETRIES", 3u32)?.max(1),
            base_delay: env.seconds("PASSTHROUGH_RETRY_DELAY", 1.0)?,
            max_delay: env.seconds("PASSTHROUGH_MAX_RETRY_DELAY", 60.0)?,
        };

        let failover = FailoverConfig {
            enabled: env.flag("PASSTHROUGH_FALLBACK_ENABLED").unwrap_or(true),
            fallback_after_failures: env
                .number("PASSTHROUGH_FALLBACK_AFTER_FAILURES", 3u32)?
                .max(1),
        };

        let token_limits = TokenLimits {
            min: env.number("MIN_TOKENS_LIMIT", 4096u32)?,
            max: env.number("MAX_TOKENS_LIMIT", 512_000u32)?,
        };
        if token_limits.min > token_limits.max {
            anyhow::bail!(
                "MIN_TOKENS_LIMIT ({}) exceeds MAX_TOKENS_LIMIT ({})",
                token_limits.min,
                token_limits.max
            );
        }

        let config = Self {
            server,
            anthropic,
            azure,
            openai_api_key: env.secret("OPENAI_API_KEY"),
            copilot,
            models: ModelAliases {
                big: env.string("BIG_MODEL").unwrap_or_else(|| "gpt-4.1".to_string()),
                small: env
                    .string("SMALL_MODEL")
                    .unwrap_or_else(|| "gpt-4.1-mini".to_string()),
            },
            passthrough_mode: env.flag("PASSTHROUGH_MODE").unwrap_or(false),
            failover,
            retry,
            security: SecuritySettings {
                allow_private: env.flag("BRIDGEWAY_ALLOW_PRIVATE").unwrap_or(false),
                allowlist: env
                    .string("BRIDGEWAY_ALLOWLIST")
                    .map(|v| split_list(&v))
                    .unwrap_or_default(),
            },
            token_limits,
            preferred_provider: env
                .string("PREFERRED_PROVIDER")
                .unwrap_or_else(|| "openai".to_string()),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot serve any request.
    pub fn validate(&self) -> Result<()> {
        if self.passthrough_mode && self.anthropic.api_key.is_none() {
            anyhow::bail!("PASSTHROUGH_MODE=true requires ANTHROPIC_API_KEY");
        }
        if self.azure.api_key.is_some() && self.azure.endpoint.is_none() {
            anyhow::bail!(
                "An Azure API key is set but no endpoint; set OPENAI_BASE_URL or AZURE_ENDPOINT"
            );
        }
        if let Some(ref endpoint) = self.azure.endpoint {
            url::Url::parse(endpoint)
                .with_context(|| format!("Invalid Azure endpoint URL: '{}'", endpoint))?;
        }
        url::Url::parse(&self.anthropic.base_url).with_context(|| {
            format!("Invalid ANTHROPIC_BASE_URL: '{}'", self.anthropic.base_url)
        })?;
        Ok(())
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_millis(self.server.timeouts.api_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.server.timeouts.connect_timeout_ms)
    }

    /// Credential-free summary for `/status` and the `status` command.
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "anthropic_api_key_configured": self.anthropic.api_key.is_some(),
            "azure_api_key_configured": self.azure.api_key.is_some(),
            "openai_api_key_configured": self.openai_api_key.is_some(),
            "github_token_configured": self.copilot.token.is_some(),
            "github_copilot_enabled": self.copilot.enabled,
            "github_copilot_models": self.copilot.models,
            "passthrough_mode": self.passthrough_mode,
            "preferred_provider": self.preferred_provider,
            "azure_endpoint": self.azure.endpoint,
            "azure_api_version": self.azure.api_version,
            "model_aliases": self.models,
            "deployments": self.azure.deployments,
        })
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
