//! Concrete backends: where to send a request and how to authenticate it.

use super::classify::{extract_resource_name, BackendKind, EndpointClassifier};
use super::error::ProviderError;
use crate::cli::ProxyConfig;
use crate::security::headers::sanitize_headers;
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use url::Url;

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// One configured backend
#[derive(Debug, Clone)]
pub struct BackendDescriptor {
    /// Stable identifier used for fail-over bookkeeping
    pub id: String,
    pub kind: BackendKind,
    pub base_url: String,
    pub credential: SecretString,
    pub api_version: Option<String>,
    pub resource_name: Option<String>,
}

impl BackendDescriptor {
    pub fn new(
        id: &str,
        kind: BackendKind,
        base_url: &str,
        credential: SecretString,
        api_version: Option<String>,
    ) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        Self {
            id: id.to_string(),
            kind,
            resource_name: extract_resource_name(&base_url),
            base_url,
            credential,
            api_version,
        }
    }

    /// Concrete request URL. `deployment` only matters for Azure Chat.
    pub fn endpoint_url(&self, deployment: Option<&str>) -> Result<String, ProviderError> {
        let base = self.base_url.as_str();
        let url = match self.kind {
            BackendKind::Native => {
                if base.ends_with("/v1/messages") {
                    base.to_string()
                } else if base.ends_with("/v1") {
                    format!("{}/messages", base)
                } else {
                    format!("{}/v1/messages", base)
                }
            }
            BackendKind::AzureResponses => {
                if base.contains("/openai/responses") {
                    self.with_api_version(base)?
                } else {
                    self.with_api_version(&format!("{}/openai/responses", base))?
                }
            }
            BackendKind::AzureChat => {
                if base.contains("/chat/completions") {
                    self.with_api_version(base)?
                } else {
                    let path = match deployment {
                        Some(d) => format!("{}/openai/deployments/{}/chat/completions", base, d),
                        None => format!("{}/openai/chat/completions", base),
                    };
                    self.with_api_version(&path)?
                }
            }
            BackendKind::Compatibility => {
                if base.ends_with("/chat/completions") {
                    base.to_string()
                } else {
                    format!("{}/chat/completions", base)
                }
            }
            BackendKind::Unknown => {
                return Err(ProviderError::Config(format!(
                    "Backend '{}' at {} has no recognised API dialect",
                    self.id, self.base_url
                )))
            }
        };
        Ok(url)
    }

    fn with_api_version(&self, raw: &str) -> Result<String, ProviderError> {
        let mut url = Url::parse(raw)
            .map_err(|e| ProviderError::Config(format!("Invalid backend URL '{}': {}", raw, e)))?;
        let has_version = url.query_pairs().any(|(k, _)| k == "api-version");
        if !has_version {
            if let Some(ref version) = self.api_version {
                url.query_pairs_mut().append_pair("api-version", version);
            }
        }
        Ok(url.to_string())
    }

    /// Authentication and dialect headers for this backend.
    pub fn auth_headers(&self) -> Vec<(&'static str, String)> {
        let secret = self.credential.expose_secret().to_string();
        match self.kind {
            BackendKind::Native => vec![
                ("x-api-key", secret),
                ("anthropic-version", ANTHROPIC_VERSION.to_string()),
            ],
            BackendKind::AzureChat | BackendKind::AzureResponses => vec![("api-key", secret)],
            BackendKind::Compatibility | BackendKind::Unknown => {
                vec![("authorization", format!("Bearer {}", secret))]
            }
        }
    }

    pub fn authorize(&self, mut builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (name, value) in self.auth_headers() {
            builder = builder.header(name, value);
        }
        builder
    }

    /// Outbound headers with credentials masked, for logging.
    pub fn loggable_headers(&self) -> Vec<(String, String)> {
        sanitize_headers(self.auth_headers())
    }
}

/// Primary and optional fallback, chosen once from configuration.
#[derive(Debug, Clone)]
pub struct BackendSet {
    pub primary: Arc<BackendDescriptor>,
    pub fallback: Option<Arc<BackendDescriptor>>,
}

impl BackendSet {
    /// Passthrough mode: native primary, Azure fallback. Otherwise the first
    /// configured of Azure, Copilot, native is primary and the next is fallback.
    pub fn from_config(
        config: &ProxyConfig,
        classifier: &EndpointClassifier,
    ) -> Result<Self, ProviderError> {
        let native = native_descriptor(config, classifier);
        let azure = azure_descriptor(config, classifier);
        let copilot = copilot_descriptor(config, classifier);

        let ordered: Vec<BackendDescriptor> = if config.passthrough_mode {
            let native = native.ok_or_else(|| {
                ProviderError::Config("Passthrough mode requires ANTHROPIC_API_KEY".to_string())
            })?;
            std::iter::once(native).chain(azure).collect()
        } else {
            azure.into_iter().chain(copilot).chain(native).collect()
        };

        let mut ordered = ordered.into_iter().map(Arc::new);
        let primary = ordered.next().ok_or_else(|| {
            ProviderError::Config(
                "No backend configured; set ANTHROPIC_API_KEY, AZURE_OPENAI_KEY or GITHUB_TOKEN"
                    .to_string(),
            )
        })?;
        Ok(Self {
            primary,
            fallback: ordered.next(),
        })
    }

    /// The backend that is not `id`, if any.
    pub fn other(&self, id: &str) -> Option<Arc<BackendDescriptor>> {
        if self.primary.id == id {
            self.fallback.clone()
        } else {
            Some(Arc::clone(&self.primary))
        }
    }
}

fn native_descriptor(config: &ProxyConfig, classifier: &EndpointClassifier) -> Option<BackendDescriptor> {
    let key = config.anthropic.api_key.clone()?;
    let base = &config.anthropic.base_url;
    Some(BackendDescriptor::new(
        "anthropic",
        classifier.classify(Some(base), config),
        base,
        key,
        None,
    ))
}

fn azure_descriptor(config: &ProxyConfig, classifier: &EndpointClassifier) -> Option<BackendDescriptor> {
    let key = config.azure.api_key.clone()?;
    let endpoint = config.azure.endpoint.as_deref()?;
    Some(BackendDescriptor::new(
        "azure",
        classifier.classify(Some(endpoint), config),
        endpoint,
        key,
        Some(config.azure.api_version.clone()),
    ))
}

fn copilot_descriptor(config: &ProxyConfig, classifier: &EndpointClassifier) -> Option<BackendDescriptor> {
    if !config.copilot.enabled {
        return None;
    }
    let token = config.copilot.token.clone()?;
    let base = &config.copilot.base_url;
    Some(BackendDescriptor::new(
        "copilot",
        classifier.classify(Some(base), config),
        base,
        token,
        None,
    ))
}
