use crate::security::headers::sanitize_error_message;
use crate::security::url_guard::SecurityError;
use std::time::Duration;

/// Coarse error category, used for retry and fail-over decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connection,
    Timeout,
    RateLimit,
    Server,
    Client,
    Security,
    Config,
    Translation,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Server => "server",
            ErrorKind::Client => "client",
            ErrorKind::Security => "security",
            ErrorKind::Config => "config",
            ErrorKind::Translation => "translation",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("Request timed out: {message}")]
    Timeout { message: String },

    #[error("Rate limited: {message}")]
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },

    #[error("Upstream error ({status}): {message}")]
    Server {
        status: u16,
        retryable: bool,
        message: String,
    },

    #[error("Request rejected ({status}): {message}")]
    Client { status: u16, message: String },

    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Translation error: {0}")]
    Translation(String),
}

impl ProviderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::Connection { .. } => ErrorKind::Connection,
            ProviderError::Timeout { .. } => ErrorKind::Timeout,
            ProviderError::RateLimited { .. } => ErrorKind::RateLimit,
            ProviderError::Server { .. } => ErrorKind::Server,
            ProviderError::Client { .. } => ErrorKind::Client,
            ProviderError::Security(_) => ErrorKind::Security,
            ProviderError::Config(_) => ErrorKind::Config,
            ProviderError::Translation(_) => ErrorKind::Translation,
        }
    }

    /// Worth another attempt against the same backend.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Connection { .. }
            | ProviderError::Timeout { .. }
            | ProviderError::RateLimited { .. } => true,
            ProviderError::Server { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Counts against the backend's failure streak once retries are spent.
    pub fn counts_toward_failover(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Connection | ErrorKind::Timeout | ErrorKind::RateLimit | ErrorKind::Server
        )
    }

    /// Message for the caller's error envelope. Operator hints, backend URLs
    /// and local failure details stay in the logs.
    pub fn client_message(&self) -> String {
        match self {
            ProviderError::Client { message, .. } => {
                let upstream = [AUTH_HINT, NOT_FOUND_HINT, CONFIG_HINT]
                    .iter()
                    .find_map(|hint| message.strip_prefix(hint))
                    .unwrap_or(message);
                upstream.to_string()
            }
            ProviderError::RateLimited { .. } => "Rate limit exceeded, retry later".to_string(),
            ProviderError::Server { status, .. } => format!("Upstream service error ({})", status),
            ProviderError::Timeout { .. } => "Upstream request timed out".to_string(),
            ProviderError::Connection { .. } => "Upstream service unreachable".to_string(),
            ProviderError::Security(_) | ProviderError::Config(_) | ProviderError::Translation(_) => {
                "The gateway could not complete the request".to_string()
            }
        }
    }

    /// Upstream HTTP status, when the error came from a response.
    pub fn status(&self) -> Option<u16> {
        match self {
            ProviderError::Server { status, .. } | ProviderError::Client { status, .. } => {
                Some(*status)
            }
            ProviderError::RateLimited { .. } => Some(429),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        let message = sanitize_error_message(&err.to_string());
        if err.is_timeout() {
            ProviderError::Timeout { message }
        } else if err.is_connect() || err.is_request() || err.is_body() {
            ProviderError::Connection { message }
        } else if err.is_decode() {
            ProviderError::Translation(message)
        } else {
            ProviderError::Connection { message }
        }
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        ProviderError::Translation(err.to_string())
    }
}

/// Pull a human-readable message out of an upstream error body.
fn upstream_message(body: &str) -> String {
    let parsed = serde_json::from_str::<serde_json::Value>(body).ok();
    let message = parsed
        .as_ref()
        .and_then(|v| {
            v.pointer("/error/message")
                .or_else(|| v.get("message"))
                .or_else(|| v.get("error"))
        })
        .and_then(|m| m.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| body.trim().chars().take(500).collect());
    sanitize_error_message(&message)
}

const AUTH_HINT: &str = "Authentication failed: ";
const NOT_FOUND_HINT: &str = "Resource not found (check deployment name): ";
const CONFIG_HINT: &str = "Configuration error: ";

/// Map a non-2xx upstream response onto a [`ProviderError`].
pub fn classify_status(status: u16, body: &str, retry_after: Option<Duration>) -> ProviderError {
    let message = upstream_message(body);
    match status {
        401 | 403 => ProviderError::Client {
            status,
            message: format!("{}{}", AUTH_HINT, message),
        },
        404 => ProviderError::Client {
            status,
            message: format!("{}{}", NOT_FOUND_HINT, message),
        },
        400 if mentions_configuration(&message) => ProviderError::Client {
            status,
            message: format!("{}{}", CONFIG_HINT, message),
        },
        408 => ProviderError::Timeout { message },
        429 => ProviderError::RateLimited {
            retry_after,
            message,
        },
        500 | 502 | 503 | 504 => ProviderError::Server {
            status,
            retryable: true,
            message,
        },
        501 | 505 => ProviderError::Server {
            status,
            retryable: false,
            message,
        },
        s if s >= 500 => ProviderError::Server {
            status,
            retryable: false,
            message,
        },
        _ => ProviderError::Client { status, message },
    }
}

fn mentions_configuration(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    ["deployment", "model", "endpoint"]
        .iter()
        .any(|word| lower.contains(word))
}

/// Upper bound on an upstream `Retry-After`.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

/// `Retry-After` in seconds, capped at one day. HTTP-date values are ignored.
pub fn parse_retry_after(value: Option<&str>) -> Option<Duration> {
    let secs = value?.trim().parse::<f64>().ok()?;
    let after = match Duration::try_from_secs_f64(secs) {
        Ok(after) => after,
        // Finite but beyond what `Duration` holds
        Err(_) if secs.is_finite() && secs > 0.0 => MAX_RETRY_AFTER,
        Err(_) => return None,
    };
    Some(after.min(MAX_RETRY_AFTER))
}
