//! Backend kind detection.
//!
//! A URL (or, with no URL, the configured credentials) is run through a fixed
//! table of [`EndpointRule`]s; the first rule that answers wins. Results are
//! memoized per [`Fingerprint`] until [`EndpointClassifier::invalidate`].

use crate::cli::ProxyConfig;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;
use url::{Host, Url};

const AZURE_HOST_SUFFIXES: &[&str] = &[
    "openai.azure.com",
    "openai.azure.us",
    "openai.azure.cn",
    "cognitiveservices.azure.com",
];

const COPILOT_HOST_SUFFIX: &str = "githubcopilot.com";
const ANTHROPIC_HOST: &str = "api.anthropic.com";

/// Wire dialect a backend speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Native,
    AzureChat,
    AzureResponses,
    Compatibility,
    Unknown,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Native => "native",
            BackendKind::AzureChat => "azure-chat",
            BackendKind::AzureResponses => "azure-responses",
            BackendKind::Compatibility => "compatibility",
            BackendKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The configuration facts the rules consult.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointFacts {
    pub anthropic_key: bool,
    pub anthropic_base_url: String,
    pub azure_key: bool,
    pub azure_endpoint: Option<String>,
    pub copilot_active: bool,
    pub copilot_base_url: String,
}

impl EndpointFacts {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            anthropic_key: config.anthropic.api_key.is_some(),
            anthropic_base_url: config.anthropic.base_url.clone(),
            azure_key: config.azure.api_key.is_some(),
            azure_endpoint: config.azure.endpoint.clone(),
            copilot_active: config.copilot.is_configured(),
            copilot_base_url: config.copilot.base_url.clone(),
        }
    }
}

/// Cache key: the URL plus every fact a rule may read.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub url: Option<String>,
    pub facts: EndpointFacts,
}

/// One classification rule. `None` means "not mine, ask the next rule".
pub trait EndpointRule: Send + Sync {
    fn name(&self) -> &'static str;
    fn evaluate(&self, url: Option<&Url>, facts: &EndpointFacts) -> Option<BackendKind>;
}

struct AzureRule;
struct CompatibilityRule;
struct NativeRule;
struct ConfigOnlyAzureRule;

impl EndpointRule for AzureRule {
    fn name(&self) -> &'static str {
        "azure"
    }

    fn evaluate(&self, url: Option<&Url>, facts: &EndpointFacts) -> Option<BackendKind> {
        let url = url?;
        let by_host = url.scheme() == "https" && host_matches(url, AZURE_HOST_SUFFIXES);
        let by_config = facts
            .azure_endpoint
            .as_deref()
            .is_some_and(|endpoint| same_origin(url, endpoint));
        (by_host || by_config).then(|| azure_kind(url))
    }
}

impl EndpointRule for CompatibilityRule {
    fn name(&self) -> &'static str {
        "compatibility"
    }

    fn evaluate(&self, url: Option<&Url>, facts: &EndpointFacts) -> Option<BackendKind> {
        let matched = match url {
            Some(url) => {
                host_matches(url, &[COPILOT_HOST_SUFFIX])
                    || (facts.copilot_active && same_origin(url, &facts.copilot_base_url))
            }
            None => facts.copilot_active,
        };
        matched.then_some(BackendKind::Compatibility)
    }
}

impl EndpointRule for NativeRule {
    fn name(&self) -> &'static str {
        "native"
    }

    fn evaluate(&self, url: Option<&Url>, facts: &EndpointFacts) -> Option<BackendKind> {
        let matched = match url {
            Some(url) => {
                url.host_str()
                    .is_some_and(|h| h.eq_ignore_ascii_case(ANTHROPIC_HOST))
                    || same_origin(url, &facts.anthropic_base_url)
            }
            None => facts.anthropic_key && !facts.azure_key && !facts.copilot_active,
        };
        matched.then_some(BackendKind::Native)
    }
}

impl EndpointRule for ConfigOnlyAzureRule {
    fn name(&self) -> &'static str {
        "azure-config"
    }

    fn evaluate(&self, url: Option<&Url>, facts: &EndpointFacts) -> Option<BackendKind> {
        if url.is_some() || !facts.azure_key {
            return None;
        }
        let kind = match facts.azure_endpoint.as_deref() {
            Some(endpoint) if uses_responses_path(endpoint) => BackendKind::AzureResponses,
            _ => BackendKind::AzureChat,
        };
        Some(kind)
    }
}

/// Evaluated in order.
static RULES: &[&dyn EndpointRule] = &[
    &AzureRule,
    &ConfigOnlyAzureRule,
    &CompatibilityRule,
    &NativeRule,
];

fn host_matches(url: &Url, suffixes: &[&str]) -> bool {
    let Some(Host::Domain(host)) = url.host() else {
        return false;
    };
    let host = host.to_ascii_lowercase();
    suffixes
        .iter()
        .any(|suffix| host == *suffix || host.ends_with(&format!(".{}", suffix)))
}

fn same_origin(url: &Url, other: &str) -> bool {
    Url::parse(other).is_ok_and(|other| url.origin() == other.origin())
}

fn azure_kind(url: &Url) -> BackendKind {
    if url.path().contains("/openai/responses") {
        BackendKind::AzureResponses
    } else {
        BackendKind::AzureChat
    }
}

fn evaluate(url: Option<&str>, facts: &EndpointFacts) -> BackendKind {
    let parsed = match url.map(Url::parse) {
        Some(Ok(parsed)) => Some(parsed),
        Some(Err(_)) => return BackendKind::Unknown,
        None => None,
    };
    RULES
        .iter()
        .find_map(|rule| {
            rule.evaluate(parsed.as_ref(), facts).inspect(|kind| {
                tracing::debug!("Endpoint {:?} classified as {} by rule '{}'", url, kind, rule.name());
            })
        })
        .unwrap_or(BackendKind::Unknown)
}

/// Memoizing classifier. Shared across requests.
#[derive(Debug, Default)]
pub struct EndpointClassifier {
    cache: RwLock<HashMap<Fingerprint, BackendKind>>,
    evaluations: AtomicUsize,
}

impl EndpointClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn classify(&self, base_url: Option<&str>, config: &ProxyConfig) -> BackendKind {
        let key = Fingerprint {
            url: base_url.map(str::to_string),
            facts: EndpointFacts::from_config(config),
        };

        if let Some(kind) = self
            .cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
        {
            return *kind;
        }

        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        if let Some(kind) = cache.get(&key) {
            return *kind;
        }
        self.evaluations.fetch_add(1, Ordering::Relaxed);
        let kind = evaluate(key.url.as_deref(), &key.facts);
        cache.insert(key, kind);
        kind
    }

    /// Number of uncached rule evaluations so far.
    pub fn evaluation_count(&self) -> usize {
        self.evaluations.load(Ordering::Relaxed)
    }

    pub fn invalidate(&self) {
        self.cache.write().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

/// Leftmost DNS label of the host; `None` for IP literals.
pub fn extract_resource_name(url: &str) -> Option<String> {
    match Url::parse(url).ok()?.host()? {
        Host::Domain(domain) => domain
            .split('.')
            .next()
            .filter(|label| !label.is_empty())
            .map(str::to_string),
        Host::Ipv4(_) | Host::Ipv6(_) => None,
    }
}

/// URL rule when a URL is given, otherwise presence of an Azure credential.
pub fn is_azure_endpoint(base_url: Option<&str>, config: &ProxyConfig) -> bool {
    let facts = EndpointFacts::from_config(config);
    match base_url {
        Some(raw) => Url::parse(raw)
            .ok()
            .is_some_and(|url| AzureRule.evaluate(Some(&url), &facts).is_some()),
        None => facts.azure_key,
    }
}

pub fn uses_responses_path(url: &str) -> bool {
    match Url::parse(url) {
        Ok(parsed) => parsed.path().contains("/openai/responses"),
        Err(_) => url.contains("/openai/responses"),
    }
}
