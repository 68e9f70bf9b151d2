use super::message_id;
use super::tools::{to_backend_tool_choice, to_backend_tools};
use super::types::*;
use crate::models::{AnthropicRequest, ContentBlock, KnownContentBlock, MessageContent};
use crate::providers::classify::BackendKind;
use crate::providers::{ProviderResponse, Usage};

/// Anthropic request → Chat-Completions request.
///
/// * `tool_use` blocks become `tool_calls` on the assistant message
/// * `tool_result` blocks become `tool` role messages, placed before the
///   message that carried them
/// * `image` blocks become `image_url` parts
/// * `thinking` and unrecognised blocks are dropped
pub(crate) fn build_request(request: &AnthropicRequest, model: &str, kind: BackendKind) -> ChatRequest {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);

    if let Some(ref system) = request.system {
        messages.push(ChatMessage::new(
            "system",
            Some(ChatContent::Text(system.to_text())),
        ));
    }

    for msg in &request.messages {
        match &msg.content {
            MessageContent::Text(text) => {
                messages.push(ChatMessage::new(&msg.role, Some(ChatContent::Text(text.clone()))));
            }
            MessageContent::Blocks(blocks) => push_block_message(&msg.role, blocks, &mut messages),
        }
    }

    let tools = request
        .tools
        .as_deref()
        .map(|tools| to_backend_tools(tools, kind))
        .filter(|tools| !tools.is_empty());
    let streaming = request.is_streaming();

    ChatRequest {
        model: model.to_string(),
        messages,
        max_completion_tokens: request.max_tokens,
        temperature: request.temperature,
        top_p: request.top_p,
        stop: request.stop_sequences.clone(),
        stream: streaming.then_some(true),
        stream_options: streaming.then_some(ChatStreamOptions {
            include_usage: true,
        }),
        tool_choice: tools
            .as_ref()
            .and(request.tool_choice.as_ref())
            .and_then(|choice| to_backend_tool_choice(choice, kind)),
        tools,
    }
}

fn push_block_message(role: &str, blocks: &[ContentBlock], out: &mut Vec<ChatMessage>) {
    let mut parts = Vec::new();
    let mut tool_calls = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::Known(KnownContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            }) => {
                let mut message = ChatMessage::new("tool", Some(ChatContent::Text(content.to_string())));
                message.tool_call_id = Some(tool_use_id.clone());
                out.push(message);
            }
            ContentBlock::Known(KnownContentBlock::ToolUse { id, name, input }) => {
                tool_calls.push(ChatToolCall {
                    id: id.clone(),
                    r#type: "function".to_string(),
                    function: ChatFunctionCall {
                        name: name.clone(),
                        arguments: input.to_string(),
                    },
                });
            }
            ContentBlock::Known(KnownContentBlock::Text { text, .. }) => {
                parts.push(ChatContentPart::Text { text: text.clone() });
            }
            ContentBlock::Known(KnownContentBlock::Image { source }) => {
                if let Some(url) = source.to_url() {
                    parts.push(ChatContentPart::ImageUrl {
                        image_url: ChatImageUrl { url },
                    });
                }
            }
            ContentBlock::Known(KnownContentBlock::Thinking { .. }) | ContentBlock::Unknown(_) => {}
        }
    }

    if parts.is_empty() && tool_calls.is_empty() {
        return;
    }

    let content = match parts.as_slice() {
        [] => None,
        [ChatContentPart::Text { text }] => Some(ChatContent::Text(text.clone())),
        _ => Some(ChatContent::Parts(parts)),
    };
    let mut message = ChatMessage::new(role, content);
    if !tool_calls.is_empty() {
        message.tool_calls = Some(tool_calls);
    }
    out.push(message);
}

pub(crate) fn map_finish_reason(reason: &str) -> &'static str {
    match reason {
        "length" => "max_tokens",
        "tool_calls" | "function_call" => "tool_use",
        // stop, content_filter and anything else end the turn
        _ => "end_turn",
    }
}

/// Chat-Completions response → Anthropic message.
pub(crate) fn translate_response(response: ChatResponse, model: &str) -> ProviderResponse {
    let usage = response.usage.unwrap_or_default();
    let id = message_id(response.id);
    let mut content = Vec::new();
    let mut stop_reason = None;

    if let Some(choice) = response.choices.into_iter().next() {
        if let Some(reasoning) = choice.message.reasoning.filter(|r| !r.is_empty()) {
            content.push(ContentBlock::thinking(reasoning));
        }
        let text = choice.message.content.map(|c| c.text()).unwrap_or_default();
        if !text.is_empty() {
            content.push(ContentBlock::text(text));
        }
        let mut had_tool_calls = false;
        for call in choice.message.tool_calls.unwrap_or_default() {
            had_tool_calls = true;
            let input = serde_json::from_str(&call.function.arguments)
                .unwrap_or_else(|_| serde_json::json!({}));
            let call_id = if call.id.is_empty() {
                format!("toolu_{}", uuid::Uuid::new_v4().simple())
            } else {
                call.id
            };
            content.push(ContentBlock::tool_use(call_id, call.function.name, input));
        }
        stop_reason = Some(if had_tool_calls {
            "tool_use"
        } else {
            map_finish_reason(choice.finish_reason.as_deref().unwrap_or("stop"))
        });
    }

    ProviderResponse {
        id,
        r#type: "message".to_string(),
        role: "assistant".to_string(),
        content,
        model: model.to_string(),
        stop_reason: Some(stop_reason.unwrap_or("end_turn").to_string()),
        stop_sequence: None,
        usage: Usage::new(usage.prompt_tokens, usage.completion_tokens),
    }
}
