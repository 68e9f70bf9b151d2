//! Backend SSE → Anthropic SSE, one event at a time.
//!
//! Anthropic event order: `message_start`, then per block
//! `content_block_start` / `content_block_delta`* / `content_block_stop`,
//! then `message_delta` (stop reason and usage) and `message_stop`.

use super::chat::map_finish_reason;
use super::message_id;
use super::types::{ChatStreamChunk, ChatToolCallDelta, StreamErrorPayload};
use crate::providers::classify::BackendKind;
use crate::providers::error::ProviderError;
use crate::providers::streaming::SseEvent;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};

fn push_event(out: &mut String, name: &str, data: Value) {
    out.push_str("event: ");
    out.push_str(name);
    out.push_str("\ndata: ");
    out.push_str(&data.to_string());
    out.push_str("\n\n");
}

/// Render an Anthropic `error` event, for failures after the stream has started.
pub fn error_event(error_type: &str, message: &str) -> String {
    let mut out = String::new();
    push_event(
        &mut out,
        "error",
        json!({ "type": "error", "error": { "type": error_type, "message": message } }),
    );
    out
}

/// Tool call that started while another tool block was open. Emitted
/// whole once the message finishes.
#[derive(Debug)]
struct DeferredTool {
    id: String,
    name: String,
    arguments: String,
}

/// Per-stream translation state.
#[derive(Debug)]
pub struct StreamTranslator {
    kind: BackendKind,
    model: String,
    message_id: String,
    started: bool,
    finished: bool,
    next_index: u32,
    /// Index of the currently open text or thinking block, with its type
    open_block: Option<(u32, &'static str)>,
    /// Open tool block: backend tool key (chat index or responses output
    /// index) and Anthropic block index
    open_tool: Option<(u32, u32)>,
    deferred_tools: BTreeMap<u32, DeferredTool>,
    /// Tool keys whose block is already stopped
    closed_tools: HashSet<u32>,
    had_tool_calls: bool,
    pending_stop: Option<&'static str>,
    input_tokens: u32,
    output_tokens: u32,
}

impl StreamTranslator {
    pub fn new(kind: BackendKind, model: &str) -> Self {
        Self {
            kind,
            model: model.to_string(),
            message_id: message_id(None),
            started: false,
            finished: false,
            next_index: 0,
            open_block: None,
            open_tool: None,
            deferred_tools: BTreeMap::new(),
            closed_tools: HashSet::new(),
            had_tool_calls: false,
            pending_stop: None,
            input_tokens: 0,
            output_tokens: 0,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Translate one backend event. Returns the Anthropic SSE text to emit,
    /// possibly empty. Native events pass through unchanged.
    pub fn translate(&mut self, event: &SseEvent) -> Result<String, ProviderError> {
        if self.finished {
            return Ok(String::new());
        }
        match self.kind {
            BackendKind::Native => {
                if event.event.as_deref() == Some("message_stop") {
                    self.finished = true;
                }
                Ok(event.to_wire())
            }
            BackendKind::AzureChat | BackendKind::Compatibility => self.translate_chat(event),
            BackendKind::AzureResponses => self.translate_responses(event),
            BackendKind::Unknown => Err(ProviderError::Config(
                "Cannot translate a stream from an unclassified backend".to_string(),
            )),
        }
    }

    /// Close the message if the backend never did. Idempotent.
    pub fn finish(&mut self) -> String {
        if self.finished || self.kind == BackendKind::Native {
            self.finished = true;
            return String::new();
        }
        let mut out = String::new();
        self.ensure_started(&mut out);
        self.close_text(&mut out);
        self.close_tool(&mut out);
        self.flush_deferred_tools(&mut out);

        let stop_reason = if self.had_tool_calls {
            "tool_use"
        } else {
            self.pending_stop.unwrap_or("end_turn")
        };
        push_event(
            &mut out,
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": { "stop_reason": stop_reason, "stop_sequence": null },
                "usage": { "input_tokens": self.input_tokens, "output_tokens": self.output_tokens }
            }),
        );
        push_event(&mut out, "message_stop", json!({ "type": "message_stop" }));
        self.finished = true;
        out
    }

    fn ensure_started(&mut self, out: &mut String) {
        if self.started {
            return;
        }
        self.started = true;
        push_event(
            out,
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": self.message_id,
                    "type": "message",
                    "role": "assistant",
                    "content": [],
                    "model": self.model,
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": { "input_tokens": self.input_tokens, "output_tokens": 0 }
                }
            }),
        );
    }

    fn close_text(&mut self, out: &mut String) {
        if let Some((index, _)) = self.open_block.take() {
            push_event(out, "content_block_stop", json!({ "type": "content_block_stop", "index": index }));
        }
    }

    fn close_tool(&mut self, out: &mut String) {
        if let Some((key, index)) = self.open_tool.take() {
            self.closed_tools.insert(key);
            push_event(out, "content_block_stop", json!({ "type": "content_block_stop", "index": index }));
        }
    }

    fn knows_tool(&self, key: u32) -> bool {
        self.open_tool.is_some_and(|(open, _)| open == key)
            || self.deferred_tools.contains_key(&key)
            || self.closed_tools.contains(&key)
    }

    fn open_tool_block(&mut self, out: &mut String, id: &str, name: &str) -> u32 {
        let index = self.next_index;
        self.next_index += 1;
        push_event(
            out,
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": index,
                "content_block": { "type": "tool_use", "id": id, "name": name, "input": {} }
            }),
        );
        index
    }

    fn push_arguments(out: &mut String, index: u32, partial: &str) {
        push_event(
            out,
            "content_block_delta",
            json!({
                "type": "content_block_delta",
                "index": index,
                "delta": { "type": "input_json_delta", "partial_json": partial }
            }),
        );
    }

    /// Emit every deferred tool as a complete start/delta/stop block, in key order.
    fn flush_deferred_tools(&mut self, out: &mut String) {
        for (key, tool) in std::mem::take(&mut self.deferred_tools) {
            let index = self.open_tool_block(out, &tool.id, &tool.name);
            if !tool.arguments.is_empty() {
                Self::push_arguments(out, index, &tool.arguments);
            }
            push_event(out, "content_block_stop", json!({ "type": "content_block_stop", "index": index }));
            self.closed_tools.insert(key);
        }
    }

    /// Append to the open text/thinking block of `block_type`, opening one if needed.
    fn delta(&mut self, out: &mut String, block_type: &'static str, text: &str) {
        if text.is_empty() {
            return;
        }
        self.ensure_started(out);
        let index = match self.open_block {
            Some((index, open)) if open == block_type => index,
            _ => {
                self.close_text(out);
                self.close_tool(out);
                let index = self.next_index;
                self.next_index += 1;
                self.open_block = Some((index, block_type));
                let content_block = if block_type == "thinking" {
                    json!({ "type": "thinking", "thinking": "" })
                } else {
                    json!({ "type": "text", "text": "" })
                };
                push_event(
                    out,
                    "content_block_start",
                    json!({ "type": "content_block_start", "index": index, "content_block": content_block }),
                );
                index
            }
        };
        let delta = if block_type == "thinking" {
            json!({ "type": "thinking_delta", "thinking": text })
        } else {
            json!({ "type": "text_delta", "text": text })
        };
        push_event(
            out,
            "content_block_delta",
            json!({ "type": "content_block_delta", "index": index, "delta": delta }),
        );
    }

    /// Start a tool block, or defer it while another tool block is still
    /// open so late argument deltas for that one keep a live block.
    fn start_tool(&mut self, out: &mut String, key: u32, id: &str, name: &str) {
        self.ensure_started(out);
        self.had_tool_calls = true;
        if self.open_tool.is_some() {
            tracing::debug!("Tool call {} ({}) deferred behind an open tool block", name, id);
            self.deferred_tools.insert(
                key,
                DeferredTool {
                    id: id.to_string(),
                    name: name.to_string(),
                    arguments: String::new(),
                },
            );
            return;
        }
        self.close_text(out);
        let index = self.open_tool_block(out, id, name);
        self.open_tool = Some((key, index));
        tracing::debug!("Tool call {} ({}) at block {}", name, id, index);
    }

    fn tool_arguments(&mut self, out: &mut String, key: u32, partial: &str) {
        if partial.is_empty() {
            return;
        }
        if !self.knows_tool(key) {
            let id = format!("toolu_{}", uuid::Uuid::new_v4().simple());
            self.start_tool(out, key, &id, "unknown");
        }
        match self.open_tool {
            Some((open, index)) if open == key => Self::push_arguments(out, index, partial),
            _ => match self.deferred_tools.get_mut(&key) {
                Some(tool) => tool.arguments.push_str(partial),
                None => tracing::warn!(
                    "Dropping arguments for tool {} after its block was closed",
                    key
                ),
            },
        }
    }

    fn translate_chat(&mut self, event: &SseEvent) -> Result<String, ProviderError> {
        let data = event.data.trim();
        if data == "[DONE]" {
            return Ok(self.finish());
        }
        let value: Value = serde_json::from_str(data)
            .map_err(|e| ProviderError::Translation(format!("Invalid stream chunk: {}", e)))?;
        if value.get("error").is_some() {
            return Err(stream_error(value));
        }
        let chunk: ChatStreamChunk = serde_json::from_value(value)?;

        let mut out = String::new();
        if let Some(usage) = chunk.usage {
            self.input_tokens = usage.prompt_tokens;
            self.output_tokens = usage.completion_tokens;
        }
        if chunk.choices.is_empty() {
            self.ensure_started(&mut out);
        }
        for choice in &chunk.choices {
            if let Some(ref reasoning) = choice.delta.reasoning {
                self.delta(&mut out, "thinking", reasoning);
            }
            if let Some(ref text) = choice.delta.content {
                self.delta(&mut out, "text", text);
            }
            for call in choice.delta.tool_calls.iter().flatten() {
                self.chat_tool_call(&mut out, call);
            }
            if let Some(ref reason) = choice.finish_reason {
                self.ensure_started(&mut out);
                self.pending_stop = Some(map_finish_reason(reason));
            }
        }
        // Usage arrives with or after the finish chunk.
        if self.pending_stop.is_some() && chunk.usage.is_some() {
            out.push_str(&self.finish());
        }
        Ok(out)
    }

    fn chat_tool_call(&mut self, out: &mut String, call: &ChatToolCallDelta) {
        let function = call.function.as_ref();
        let name = function.and_then(|f| f.name.as_deref());
        if let (Some(id), Some(name)) = (call.id.as_deref(), name) {
            if !self.knows_tool(call.index) {
                self.start_tool(out, call.index, id, name);
            }
        }
        if let Some(args) = function.and_then(|f| f.arguments.as_deref()) {
            self.tool_arguments(out, call.index, args);
        }
    }

    fn translate_responses(&mut self, event: &SseEvent) -> Result<String, ProviderError> {
        let value: Value = serde_json::from_str(event.data.trim())
            .map_err(|e| ProviderError::Translation(format!("Invalid stream event: {}", e)))?;
        let event_type = event
            .event
            .as_deref()
            .or_else(|| value.get("type").and_then(|t| t.as_str()))
            .unwrap_or_default()
            .to_string();
        let output_index = value
            .get("output_index")
            .and_then(|i| i.as_u64())
            .unwrap_or(0) as u32;

        let mut out = String::new();
        match event_type.as_str() {
            "response.created" | "response.in_progress" => self.ensure_started(&mut out),
            "response.output_text.delta" => {
                let delta = value.get("delta").and_then(|d| d.as_str()).unwrap_or_default();
                self.delta(&mut out, "text", delta);
            }
            "response.reasoning_summary_text.delta" | "response.reasoning_text.delta" => {
                let delta = value.get("delta").and_then(|d| d.as_str()).unwrap_or_default();
                self.delta(&mut out, "thinking", delta);
            }
            "response.output_item.added" => {
                let item = value.get("item").cloned().unwrap_or(Value::Null);
                if item.get("type").and_then(|t| t.as_str()) == Some("function_call") {
                    let id = item
                        .get("call_id")
                        .or_else(|| item.get("id"))
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    let name = item
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown")
                        .to_string();
                    self.start_tool(&mut out, output_index, &id, &name);
                    if let Some(args) = item.get("arguments").and_then(|a| a.as_str()) {
                        self.tool_arguments(&mut out, output_index, args);
                    }
                }
            }
            "response.function_call_arguments.delta" => {
                let delta = value.get("delta").and_then(|d| d.as_str()).unwrap_or_default();
                self.tool_arguments(&mut out, output_index, delta);
            }
            "response.completed" | "response.incomplete" => {
                if let Some(usage) = value.pointer("/response/usage") {
                    self.input_tokens = usage_u32(usage, "input_tokens");
                    self.output_tokens = usage_u32(usage, "output_tokens");
                }
                if event_type == "response.incomplete" {
                    self.pending_stop = Some("max_tokens");
                }
                out.push_str(&self.finish());
            }
            "response.failed" | "error" => return Err(stream_error(value)),
            _ => {}
        }
        Ok(out)
    }
}

fn usage_u32(usage: &Value, key: &str) -> u32 {
    usage.get(key).and_then(|v| v.as_u64()).unwrap_or(0) as u32
}

fn stream_error(value: Value) -> ProviderError {
    let message = match serde_json::from_value::<StreamErrorPayload>(value.clone()) {
        Ok(payload) => {
            if let Some(code) = payload.error.code {
                tracing::debug!("Upstream stream error code: {}", code);
            }
            payload.error.message
        }
        Err(_) => value
            .pointer("/response/error/message")
            .or_else(|| value.get("message"))
            .and_then(|m| m.as_str())
            .unwrap_or("Upstream stream error")
            .to_string(),
    };
    ProviderError::Server {
        status: 502,
        retryable: false,
        message: crate::security::headers::sanitize_error_message(&message),
    }
}
