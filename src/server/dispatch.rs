//! Backend selection, retry and fail-over for one Anthropic Messages call.

use crate::cli::ProxyConfig;
use crate::models::AnthropicRequest;
use crate::providers::backend::{BackendDescriptor, BackendSet};
use crate::providers::classify::{BackendKind, EndpointClassifier};
use crate::providers::error::{classify_status, parse_retry_after, ProviderError};
use crate::providers::retry::{Backoff, RetryPolicy, Sleeper, TokioSleeper};
use crate::providers::streaming::{SseStream, UsageTrackingStream};
use crate::providers::{build_provider_client, ByteStream, ProviderResponse, StreamResponse};
use crate::security::failover::FailoverController;
use crate::security::url_guard::{SecurityError, UrlGuard};
use crate::translate::{
    error_event, translate_request, translate_response, translate_stream_chunk, StreamTranslator,
};
use bytes::Bytes;
use futures::stream::{StreamExt, TryStreamExt};
use reqwest::Client;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Upstream response headers passed back to the client on streaming calls.
const FORWARDED_HEADER_PREFIXES: &[&str] = &["anthropic-ratelimit-", "x-ratelimit-"];
const FORWARDED_HEADERS: &[&str] = &["request-id", "x-request-id", "retry-after"];

/// Result of a dispatched call
pub enum DispatchResult {
    Complete {
        response: ProviderResponse,
        backend: String,
    },
    Streaming {
        response: StreamResponse,
        backend: String,
    },
}

impl DispatchResult {
    pub fn backend(&self) -> &str {
        match self {
            DispatchResult::Complete { backend, .. } | DispatchResult::Streaming { backend, .. } => {
                backend
            }
        }
    }
}

impl std::fmt::Debug for DispatchResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchResult::Complete { response, backend } => f
                .debug_struct("Complete")
                .field("backend", backend)
                .field("response", response)
                .finish(),
            DispatchResult::Streaming { response, backend } => f
                .debug_struct("Streaming")
                .field("backend", backend)
                .field("response", response)
                .finish(),
        }
    }
}

/// Owns everything a request needs on its way to a backend.
pub struct Gateway {
    config: Arc<ProxyConfig>,
    client: Client,
    backends: BackendSet,
    failover: Arc<FailoverController>,
    guard: UrlGuard,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl Gateway {
    pub fn new(config: Arc<ProxyConfig>) -> Result<Self, ProviderError> {
        let backends = BackendSet::from_config(&config, &EndpointClassifier::new())?;
        let client = build_provider_client(config.connect_timeout(), config.api_timeout());
        let retry = RetryPolicy {
            max_attempts: config.retry.max_attempts,
            base_delay: config.retry.base_delay,
            max_delay: config.retry.max_delay,
            backoff: Backoff::Exponential,
        };

        info!(
            "Gateway ready: primary={} ({}), fallback={}",
            backends.primary.id,
            backends.primary.kind,
            backends
                .fallback
                .as_ref()
                .map(|b| format!("{} ({})", b.id, b.kind))
                .unwrap_or_else(|| "none".to_string())
        );

        Ok(Self {
            failover: Arc::new(FailoverController::new(config.failover)),
            guard: UrlGuard::new(config.security.allowlist.iter()),
            client,
            backends,
            retry,
            sleeper: Arc::new(TokioSleeper),
            config,
        })
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_url_guard(mut self, guard: UrlGuard) -> Self {
        self.guard = guard;
        self
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn backends(&self) -> &BackendSet {
        &self.backends
    }

    pub fn failover(&self) -> &FailoverController {
        &self.failover
    }

    /// Whether the next call is routed to the fallback.
    fn routed_to_fallback(&self) -> bool {
        self.backends.fallback.is_some()
            && self.failover.should_use_fallback(&self.backends.primary.id)
    }

    /// The backend the next call goes to first.
    pub fn active_backend(&self) -> Arc<BackendDescriptor> {
        match self.backends.fallback {
            Some(ref fallback) if self.routed_to_fallback() => Arc::clone(fallback),
            _ => Arc::clone(&self.backends.primary),
        }
    }

    /// Model name the backend is asked for.
    pub fn target_model(&self, backend: &BackendDescriptor, model: &str) -> String {
        match backend.kind {
            BackendKind::Native | BackendKind::Unknown => model.to_string(),
            BackendKind::AzureChat | BackendKind::AzureResponses => self
                .config
                .azure
                .deployment_for(self.config.models.resolve(model)),
            BackendKind::Compatibility => {
                if self.config.copilot.models.iter().any(|m| m == model) {
                    model.to_string()
                } else {
                    self.config.models.resolve(model).to_string()
                }
            }
        }
    }

    /// Send `request` to the active backend, failing over once to the other
    /// backend when the first exhausts its retries with a countable error.
    pub async fn dispatch(
        &self,
        request: &AnthropicRequest,
        req_id: &str,
    ) -> Result<DispatchResult, ProviderError> {
        let rerouted = self.routed_to_fallback();
        let first = self.active_backend();
        if rerouted {
            warn!(
                "[{}] {} has {} consecutive failures, routing to {}",
                req_id,
                self.backends.primary.id,
                self.failover.failure_count(&self.backends.primary.id),
                first.id
            );
        }

        let err = match self.attempt(&first, request, req_id).await {
            Ok(result) => {
                self.failover.record_success(&first.id);
                if rerouted {
                    self.failover.record_success(&self.backends.primary.id);
                }
                return Ok(result);
            }
            Err(err) => err,
        };

        if !err.counts_toward_failover() {
            self.count_request(&first, "error");
            return Err(err);
        }
        let failures = self.failover.record_failure(&first.id);
        self.count_request(&first, "error");

        let second = match self.backends.other(&first.id) {
            Some(second) if self.failover.config().enabled => second,
            _ => return Err(err),
        };

        warn!(
            "[{}] {} failed ({} consecutive): {}; failing over to {}",
            req_id, first.id, failures, err, second.id
        );
        metrics::counter!(
            "bridgeway_failovers_total",
            "from" => first.id.clone(),
            "to" => second.id.clone()
        )
        .increment(1);

        match self.attempt(&second, request, req_id).await {
            Ok(result) => {
                self.failover.record_success(&second.id);
                Ok(result)
            }
            Err(second_err) => {
                if second_err.counts_toward_failover() {
                    self.failover.record_failure(&second.id);
                }
                self.count_request(&second, "error");
                Err(second_err)
            }
        }
    }

    fn count_request(&self, backend: &BackendDescriptor, outcome: &'static str) {
        metrics::counter!(
            "bridgeway_requests_total",
            "backend" => backend.id.clone(),
            "kind" => backend.kind.as_str(),
            "outcome" => outcome
        )
        .increment(1);
    }

    /// One backend: validate, translate, send with retries, translate back.
    async fn attempt(
        &self,
        backend: &BackendDescriptor,
        request: &AnthropicRequest,
        req_id: &str,
    ) -> Result<DispatchResult, ProviderError> {
        let target_model = self.target_model(backend, &request.model);
        let deployment = (backend.kind == BackendKind::AzureChat).then_some(target_model.as_str());
        let url = backend.endpoint_url(deployment)?;
        self.guard
            .validate(&url, self.config.security.allow_private)
            .await?;

        let payload = translate_request(
            request,
            backend.kind,
            &target_model,
            self.config.token_limits,
        )?;

        info!(
            "[{}] {} → {} ({}, resource={}, model={}, stream={})",
            req_id,
            request.model,
            backend.id,
            backend.kind,
            backend.resource_name.as_deref().unwrap_or("-"),
            target_model,
            request.is_streaming()
        );
        debug!(
            "[{}] POST {} headers={:?} messages={}",
            req_id,
            url,
            backend.loggable_headers(),
            request.messages.len()
        );

        let started = Instant::now();
        let response = {
            let gateway = self;
            let url = url.as_str();
            let payload = &payload;
            self.retry
                .run(self.sleeper.as_ref(), &backend.id, move |_attempt| {
                    gateway.send_once(backend, url, payload)
                })
                .await?
        };

        self.count_request(backend, "success");
        metrics::histogram!(
            "bridgeway_upstream_latency_seconds",
            "backend" => backend.id.clone()
        )
        .record(started.elapsed().as_secs_f64());

        if request.is_streaming() {
            let headers = forwarded_headers(response.headers());
            let stream = translate_body_stream(response, backend, &request.model);
            return Ok(DispatchResult::Streaming {
                response: StreamResponse { stream, headers },
                backend: backend.id.clone(),
            });
        }

        let body = response.bytes().await?;
        let raw: Value = serde_json::from_slice(&body)?;
        let translated = translate_response(raw, backend.kind, &request.model)?;
        info!(
            "[{}] {} done in {}ms (in={}, out={}, stop={})",
            req_id,
            backend.id,
            started.elapsed().as_millis(),
            translated.usage.input_tokens,
            translated.usage.output_tokens,
            translated.stop_reason.as_deref().unwrap_or("-")
        );
        Ok(DispatchResult::Complete {
            response: translated,
            backend: backend.id.clone(),
        })
    }

    /// A single HTTP exchange; non-2xx statuses become typed errors.
    async fn send_once(
        &self,
        backend: &BackendDescriptor,
        url: &str,
        payload: &Value,
    ) -> Result<reqwest::Response, ProviderError> {
        let response = backend
            .authorize(self.client.post(url))
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status.is_redirection() {
            let location = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("-")
                .to_string();
            warn!("{} answered {} towards {}; not following", backend.id, status, location);
            return Err(SecurityError::RedirectBlocked {
                status: status.as_u16(),
                location,
            }
            .into());
        }

        let retry_after = parse_retry_after(
            response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok()),
        );
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status.as_u16(), &body, retry_after))
    }
}

fn forwarded_headers(headers: &reqwest::header::HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter(|(name, _)| {
            let name = name.as_str();
            FORWARDED_HEADERS.contains(&name)
                || FORWARDED_HEADER_PREFIXES.iter().any(|p| name.starts_with(p))
        })
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

/// Upstream SSE body → Anthropic SSE bytes. Native bodies pass through.
fn translate_body_stream(
    response: reqwest::Response,
    backend: &BackendDescriptor,
    model: &str,
) -> ByteStream {
    let upstream = response.bytes_stream().map_err(ProviderError::from);
    if backend.kind == BackendKind::Native {
        return Box::pin(UsageTrackingStream::new(upstream, &backend.id, model));
    }

    let events = Box::pin(SseStream::new(upstream));
    let translator = StreamTranslator::new(backend.kind, model);
    let backend_id = backend.id.clone();

    let translated = futures::stream::unfold(
        (events, translator, false),
        move |(mut events, mut translator, done)| {
            let backend_id = backend_id.clone();
            async move {
                if done {
                    return None;
                }
                loop {
                    match events.next().await {
                        Some(Ok(event)) => match translate_stream_chunk(&event, &mut translator) {
                            Ok(out) if out.is_empty() => continue,
                            Ok(out) => {
                                return Some((Ok(Bytes::from(out)), (events, translator, false)))
                            }
                            Err(err) => {
                                warn!("{} stream translation failed: {}", backend_id, err);
                                let out = error_event("api_error", &err.client_message());
                                return Some((Ok(Bytes::from(out)), (events, translator, true)));
                            }
                        },
                        Some(Err(err)) => {
                            warn!("{} stream interrupted: {}", backend_id, err);
                            let out = error_event("api_error", &err.client_message());
                            return Some((Ok(Bytes::from(out)), (events, translator, true)));
                        }
                        None => {
                            let tail = translator.finish();
                            if tail.is_empty() {
                                return None;
                            }
                            return Some((Ok(Bytes::from(tail)), (events, translator, true)));
                        }
                    }
                }
            }
        },
    );

    Box::pin(UsageTrackingStream::new(translated, &backend.id, model))
}
