use bytes::Bytes;
use futures::stream::Stream;
use pin_project::pin_project;
use serde_json::Value;
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

/// One server-sent event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    /// Render in wire format, terminated by a blank line.
    pub fn to_wire(&self) -> String {
        match self.event {
            Some(ref event) => format!("event: {}\ndata: {}\n\n", event, self.data),
            None => format!("data: {}\n\n", self.data),
        }
    }
}

/// Parse complete SSE events out of `input`. Comment lines and `id:`/`retry:`
/// fields are ignored.
pub fn parse_sse_events(input: &str) -> Vec<SseEvent> {
    let mut events = Vec::new();
    let mut event: Option<String> = None;
    let mut data = String::new();

    for line in input.lines() {
        if line.is_empty() {
            if !data.is_empty() {
                events.push(SseEvent {
                    event: event.take(),
                    data: std::mem::take(&mut data),
                });
            }
            event = None;
        } else if let Some(rest) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(rest.strip_prefix(' ').unwrap_or(rest));
        } else if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim().to_string());
        }
    }

    if !data.is_empty() {
        events.push(SseEvent { event, data });
    }
    events
}

/// Splits a byte stream into [`SseEvent`]s, reassembling events that span chunks.
#[pin_project]
pub struct SseStream<S> {
    #[pin]
    inner: S,
    /// Raw bytes; only complete frames are decoded, so split UTF-8 sequences survive
    buffer: Vec<u8>,
    pending: VecDeque<SseEvent>,
}

impl<S> SseStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            pending: VecDeque::new(),
        }
    }
}

fn rfind_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).rposition(|w| w == needle)
}

/// End of the last complete frame in `buffer`.
fn frame_end(buffer: &[u8]) -> Option<usize> {
    match (rfind_bytes(buffer, b"\n\n"), rfind_bytes(buffer, b"\r\n\r\n")) {
        (Some(a), Some(b)) => Some((a + 2).max(b + 4)),
        (Some(a), None) => Some(a + 2),
        (None, Some(b)) => Some(b + 4),
        (None, None) => None,
    }
}

impl<S, E> Stream for SseStream<S>
where
    S: Stream<Item = Result<Bytes, E>>,
{
    type Item = Result<SseEvent, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            if let Some(event) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(event)));
            }

            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    this.buffer.extend_from_slice(&bytes);
                    if let Some(end) = frame_end(this.buffer) {
                        let frames: Vec<u8> = this.buffer.drain(..end).collect();
                        this.pending
                            .extend(parse_sse_events(&String::from_utf8_lossy(&frames)));
                    }
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(None) => {
                    if this.buffer.is_empty() {
                        return Poll::Ready(None);
                    }
                    let rest = std::mem::take(this.buffer);
                    this.pending
                        .extend(parse_sse_events(&String::from_utf8_lossy(&rest)));
                    if this.pending.is_empty() {
                        return Poll::Ready(None);
                    }
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Passes Anthropic-format SSE bytes through unchanged while tallying usage;
/// logs a summary and records metrics when the stream ends.
#[pin_project]
pub struct UsageTrackingStream<S> {
    #[pin]
    inner: S,
    backend: String,
    model: String,
    buffer: Vec<u8>,
    started: Instant,
    first_delta: Option<Instant>,
    input_tokens: u64,
    output_tokens: u64,
    finished: bool,
}

impl<S> UsageTrackingStream<S> {
    pub fn new(inner: S, backend: &str, model: &str) -> Self {
        Self {
            inner,
            backend: backend.to_string(),
            model: model.to_string(),
            buffer: Vec::new(),
            started: Instant::now(),
            first_delta: None,
            input_tokens: 0,
            output_tokens: 0,
            finished: false,
        }
    }
}

fn usage_field(value: &Value, pointer: &str) -> Option<u64> {
    value.pointer(pointer).and_then(|v| v.as_u64())
}

impl<S, E> Stream for UsageTrackingStream<S>
where
    S: Stream<Item = Result<Bytes, E>>,
{
    type Item = Result<Bytes, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        match this.inner.poll_next(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                this.buffer.extend_from_slice(&bytes);
                if let Some(end) = frame_end(this.buffer) {
                    let frames: Vec<u8> = this.buffer.drain(..end).collect();
                    for event in parse_sse_events(&String::from_utf8_lossy(&frames)) {
                        let Ok(json) = serde_json::from_str::<Value>(&event.data) else {
                            continue;
                        };
                        match event.event.as_deref() {
                            Some("message_start") => {
                                if let Some(n) = usage_field(&json, "/message/usage/input_tokens") {
                                    *this.input_tokens = n;
                                }
                            }
                            Some("content_block_delta") if this.first_delta.is_none() => {
                                *this.first_delta = Some(Instant::now());
                            }
                            Some("message_delta") => {
                                if let Some(n) = usage_field(&json, "/usage/output_tokens") {
                                    *this.output_tokens = n;
                                }
                                if let Some(n) = usage_field(&json, "/usage/input_tokens") {
                                    if *this.input_tokens == 0 {
                                        *this.input_tokens = n;
                                    }
                                }
                            }
                            _ => {}
                        }
                    }
                }
                Poll::Ready(Some(Ok(bytes)))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
            Poll::Ready(None) => {
                if !*this.finished {
                    *this.finished = true;
                    let total = this.started.elapsed();
                    let ttft = this.first_delta.map(|t| t.duration_since(*this.started));
                    tracing::info!(
                        "stream {}:{} {}ms ttft:{}ms in:{} out:{}",
                        this.backend,
                        this.model,
                        total.as_millis(),
                        ttft.unwrap_or(total).as_millis(),
                        this.input_tokens,
                        this.output_tokens
                    );
                    let (backend, model) = (this.backend.clone(), this.model.clone());
                    metrics::histogram!("bridgeway_stream_duration_seconds",
                        "backend" => backend.clone(), "model" => model.clone()
                    )
                    .record(total.as_secs_f64());
                    metrics::counter!("bridgeway_tokens_input_total",
                        "backend" => backend.clone(), "model" => model.clone()
                    )
                    .increment(*this.input_tokens);
                    metrics::counter!("bridgeway_tokens_output_total",
                        "backend" => backend, "model" => model
                    )
                    .increment(*this.output_tokens);
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
