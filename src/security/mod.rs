//! Outbound request safety: SSRF validation, credential redaction and
//! primary/fallback failure tracking.

pub mod failover;
pub mod headers;
pub mod url_guard;

pub use failover::{FailoverConfig, FailoverController};
pub use headers::{sanitize_error_message, sanitize_headers};
pub use url_guard::{SecurityError, UrlGuard};
