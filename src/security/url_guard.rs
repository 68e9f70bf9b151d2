//! SSRF guard for outbound backend URLs.
//!
//! Every URL the gateway dials passes through [`UrlGuard::validate`] first.
//! Hostnames are resolved before the range check, and a host that cannot be
//! resolved is rejected.

use async_trait::async_trait;
use ipnet::IpNet;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, OnceLock};
use url::{Host, Url};

/// Rejection reasons produced by the guard.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SecurityError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("HTTPS required: {url}")]
    HttpsRequired { url: String },
    #[error("Private IP blocked: {host} resolves to {ip} ({range})")]
    PrivateIpBlocked {
        host: String,
        ip: String,
        range: &'static str,
    },
    #[error("Private IP blocked: {host} is a cloud metadata endpoint")]
    MetadataHost { host: String },
    #[error("DNS resolution failed for {host}: {reason}")]
    Unresolvable { host: String, reason: String },
    #[error("Redirect blocked: backend answered {status} towards {location}")]
    RedirectBlocked { status: u16, location: String },
}

/// Hostname resolution used by the guard.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<IpAddr>>;
}

/// Resolver backed by the system (`getaddrinfo` through tokio).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, port)).await?;
        Ok(addrs.map(|addr| addr.ip()).collect())
    }
}

/// Fixed host table, for offline checks and tests.
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    entries: HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: &str, ips: &[IpAddr]) -> Self {
        self.entries.insert(host.to_ascii_lowercase(), ips.to_vec());
        self
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, host: &str, _port: u16) -> std::io::Result<Vec<IpAddr>> {
        self.entries
            .get(&host.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, "no such host")
            })
    }
}

const BLOCKED_CIDRS: &[(&str, &str)] = &[
    ("0.0.0.0/8", "this-network"),
    ("10.0.0.0/8", "private"),
    ("100.64.0.0/10", "shared"),
    ("127.0.0.0/8", "loopback"),
    ("169.254.0.0/16", "link-local"),
    ("172.16.0.0/12", "private"),
    ("192.0.0.0/24", "reserved"),
    ("192.168.0.0/16", "private"),
    ("198.18.0.0/15", "reserved"),
    ("224.0.0.0/4", "multicast"),
    ("240.0.0.0/4", "reserved"),
    ("::/128", "unspecified"),
    ("::1/128", "loopback"),
    ("fc00::/7", "private"),
    ("fe80::/10", "link-local"),
    ("ff00::/8", "multicast"),
];

const METADATA_HOSTS: &[&str] = &["metadata.google.internal", "metadata.azure.internal"];

fn blocked_networks() -> &'static [(IpNet, &'static str)] {
    static NETWORKS: OnceLock<Vec<(IpNet, &'static str)>> = OnceLock::new();
    NETWORKS.get_or_init(|| {
        BLOCKED_CIDRS
            .iter()
            .filter_map(|(cidr, label)| match cidr.parse::<IpNet>() {
                Ok(net) => Some((net, *label)),
                Err(e) => {
                    tracing::error!("Invalid blocked range {}: {}", cidr, e);
                    None
                }
            })
            .collect()
    })
}

/// Name of the blocked range `ip` falls in, if any. IPv4-mapped IPv6
/// addresses are checked as IPv4.
pub fn blocked_range(ip: IpAddr) -> Option<&'static str> {
    let ip = match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        IpAddr::V4(_) => ip,
    };
    blocked_networks()
        .iter()
        .find(|(net, _)| net.contains(&ip))
        .map(|(_, label)| *label)
}

/// Validates outbound URLs against the blocked address table.
#[derive(Clone)]
pub struct UrlGuard {
    allowed_hosts: HashSet<String>,
    allowed_ips: HashSet<IpAddr>,
    resolver: Arc<dyn Resolver>,
}

impl std::fmt::Debug for UrlGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlGuard")
            .field("allowed_hosts", &self.allowed_hosts)
            .field("allowed_ips", &self.allowed_ips)
            .finish_non_exhaustive()
    }
}

impl Default for UrlGuard {
    fn default() -> Self {
        Self::new(std::iter::empty::<&str>())
    }
}

impl UrlGuard {
    /// Build a guard; allow-list entries may be hostnames or IP literals.
    pub fn new<I, S>(allowlist: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut allowed_hosts = HashSet::new();
        let mut allowed_ips = HashSet::new();
        for entry in allowlist {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                continue;
            }
            let bare = entry.trim_start_matches('[').trim_end_matches(']');
            match bare.parse::<IpAddr>() {
                Ok(ip) => {
                    allowed_ips.insert(ip);
                }
                Err(_) => {
                    allowed_hosts.insert(entry.to_ascii_lowercase());
                }
            }
        }
        Self {
            allowed_hosts,
            allowed_ips,
            resolver: Arc::new(SystemResolver),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Accept `url` only if it is HTTPS and every address it resolves to is
    /// public or allow-listed. `allow_private` skips both checks.
    pub async fn validate(&self, url: &str, allow_private: bool) -> Result<(), SecurityError> {
        let parsed = Url::parse(url).map_err(|e| SecurityError::InvalidUrl(e.to_string()))?;

        if parsed.scheme() != "https" && !allow_private {
            return Err(SecurityError::HttpsRequired {
                url: parsed.as_str().to_string(),
            });
        }
        if allow_private {
            return Ok(());
        }

        let host = parsed
            .host()
            .ok_or_else(|| SecurityError::InvalidUrl(format!("{} has no host", url)))?;

        let (host_label, ips) = match host {
            Host::Ipv4(v4) => (v4.to_string(), vec![IpAddr::V4(v4)]),
            Host::Ipv6(v6) => (v6.to_string(), vec![IpAddr::V6(v6)]),
            Host::Domain(domain) => {
                let domain = domain.to_ascii_lowercase();
                if self.allowed_hosts.contains(&domain) {
                    return Ok(());
                }
                if METADATA_HOSTS.contains(&domain.as_str()) {
                    return Err(SecurityError::MetadataHost { host: domain });
                }
                let port = parsed.port_or_known_default().unwrap_or(443);
                let ips = self.resolver.resolve(&domain, port).await.map_err(|e| {
                    SecurityError::Unresolvable {
                        host: domain.clone(),
                        reason: e.to_string(),
                    }
                })?;
                if ips.is_empty() {
                    return Err(SecurityError::Unresolvable {
                        host: domain,
                        reason: "no addresses".to_string(),
                    });
                }
                (domain, ips)
            }
        };

        if self.allowed_hosts.contains(&host_label) {
            return Ok(());
        }

        for ip in ips {
            if self.allowed_ips.contains(&ip) {
                continue;
            }
            if let Some(range) = blocked_range(ip) {
                tracing::warn!("Blocked outbound target {} ({}, {})", host_label, ip, range);
                return Err(SecurityError::PrivateIpBlocked {
                    host: host_label,
                    ip: ip.to_string(),
                    range,
                });
            }
        }

        Ok(())
    }
}
