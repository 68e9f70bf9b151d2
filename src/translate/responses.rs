use super::message_id;
use super::tools::{to_backend_tool_choice, to_backend_tools};
use super::types::*;
use crate::cli::TokenLimits;
use crate::models::{AnthropicRequest, ContentBlock, KnownContentBlock, MessageContent};
use crate::providers::classify::BackendKind;
use crate::providers::{ProviderResponse, Usage};
use serde_json::{json, Value};

/// Fixed sampling temperature for the Responses API.
pub const RESPONSES_TEMPERATURE: f32 = 1.0;

/// Anthropic request → Responses API request.
pub(crate) fn build_request(request: &AnthropicRequest, model: &str, limits: TokenLimits) -> ResponsesRequest {
    let mut input = Vec::with_capacity(request.messages.len());

    for msg in &request.messages {
        let assistant = msg.role == "assistant";
        let blocks = match &msg.content {
            MessageContent::Text(text) => vec![ContentBlock::text(text.clone())],
            MessageContent::Blocks(blocks) => blocks.clone(),
        };

        let mut parts = Vec::new();
        let mut calls = Vec::new();
        for block in blocks {
            match block {
                ContentBlock::Known(KnownContentBlock::Text { text, .. }) => {
                    parts.push(if assistant {
                        ResponsesContentPart::OutputText { text }
                    } else {
                        ResponsesContentPart::InputText { text }
                    });
                }
                ContentBlock::Known(KnownContentBlock::Image { source }) if !assistant => {
                    if let Some(image_url) = source.to_url() {
                        parts.push(ResponsesContentPart::InputImage { image_url });
                    }
                }
                ContentBlock::Known(KnownContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    ..
                }) => input.push(ResponsesInputItem::FunctionCallOutput {
                    call_id: tool_use_id,
                    output: content.to_string(),
                }),
                ContentBlock::Known(KnownContentBlock::ToolUse { id, name, input: args }) => {
                    calls.push(ResponsesInputItem::FunctionCall {
                        call_id: id,
                        name,
                        arguments: args.to_string(),
                    });
                }
                _ => {}
            }
        }

        if !parts.is_empty() {
            input.push(ResponsesInputItem::Message {
                role: msg.role.clone(),
                content: parts,
            });
        }
        input.extend(calls);
    }

    let kind = BackendKind::AzureResponses;
    let tools = request
        .tools
        .as_deref()
        .map(|tools| to_backend_tools(tools, kind))
        .filter(|tools| !tools.is_empty());

    ResponsesRequest {
        model: model.to_string(),
        instructions: request
            .system
            .as_ref()
            .map(|s| s.to_text())
            .filter(|s| !s.is_empty()),
        input,
        max_output_tokens: limits.clamp(request.max_tokens),
        temperature: RESPONSES_TEMPERATURE,
        stream: request.is_streaming(),
        tool_choice: tools
            .as_ref()
            .and(request.tool_choice.as_ref())
            .and_then(|choice| to_backend_tool_choice(choice, kind)),
        tools,
    }
}

/// Tool arguments arrive as a JSON string or, from older deployments, as an object.
fn parse_arguments(raw: Option<&Value>) -> Value {
    match raw {
        Some(Value::String(s)) => serde_json::from_str(s).unwrap_or_else(|_| json!({})),
        Some(v @ Value::Object(_)) => v.clone(),
        _ => json!({}),
    }
}

fn str_field<'a>(item: &'a Value, key: &str) -> Option<&'a str> {
    item.get(key).and_then(|v| v.as_str()).filter(|s| !s.is_empty())
}

fn joined_text(parts: Option<&Value>) -> String {
    parts
        .and_then(|p| p.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

fn output_block(item: &Value) -> Option<ContentBlock> {
    match item.get("type").and_then(|t| t.as_str())? {
        "message" => {
            let text = joined_text(item.get("content"));
            (!text.is_empty()).then(|| ContentBlock::text(text))
        }
        "text" | "output_text" => str_field(item, "text").map(ContentBlock::text),
        "function_call" => {
            let id = str_field(item, "call_id").or_else(|| str_field(item, "id"))?;
            let name = str_field(item, "name")?;
            Some(ContentBlock::tool_use(id, name, parse_arguments(item.get("arguments"))))
        }
        "tool_call" => {
            let function = item.get("function")?;
            let name = str_field(function, "name")?;
            let id = str_field(item, "id")
                .map(str::to_string)
                .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));
            Some(ContentBlock::tool_use(id, name, parse_arguments(function.get("arguments"))))
        }
        "reasoning" => {
            let mut text = joined_text(item.get("summary"));
            if text.is_empty() {
                text = joined_text(item.get("content"));
            }
            (!text.is_empty()).then(|| ContentBlock::thinking(text))
        }
        _ => None,
    }
}

/// Responses API result → Anthropic message.
pub(crate) fn translate_response(response: ResponsesResponse, model: &str) -> ProviderResponse {
    let content: Vec<ContentBlock> = response.output.iter().filter_map(output_block).collect();
    let had_tool_calls = content.iter().any(|b| {
        matches!(b, ContentBlock::Known(KnownContentBlock::ToolUse { .. }))
    });

    let stop_reason = if had_tool_calls {
        "tool_use"
    } else if response.status.as_deref() == Some("incomplete") {
        "max_tokens"
    } else {
        "end_turn"
    };
    let usage = response.usage.unwrap_or_default();

    ProviderResponse {
        id: message_id(response.id),
        r#type: "message".to_string(),
        role: "assistant".to_string(),
        content,
        model: model.to_string(),
        stop_reason: Some(stop_reason.to_string()),
        stop_sequence: None,
        usage: Usage::new(usage.input_tokens, usage.output_tokens),
    }
}
