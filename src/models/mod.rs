//! Anthropic Messages dialect: the only shape clients speak to the gateway.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Inbound Messages API request
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AnthropicRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemPrompt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<serde_json::Value>,
    /// Top-level fields this gateway does not model; forwarded as-is to native backends.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl AnthropicRequest {
    pub fn is_streaming(&self) -> bool {
        self.stream.unwrap_or(false)
    }
}

/// One conversation turn
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Message {
    pub role: String,
    pub content: MessageContent,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: MessageContent::Text(text.into()),
        }
    }
}

/// Either a bare string or a list of content blocks
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// Concatenated text of all text blocks.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| b.as_text())
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

/// System prompt: a string or text blocks
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum SystemPrompt {
    Text(String),
    Blocks(Vec<SystemBlock>),
}

impl SystemPrompt {
    /// Flatten to plain text, blocks joined by blank lines.
    pub fn to_text(&self) -> String {
        match self {
            SystemPrompt::Text(text) => text.clone(),
            SystemPrompt::Blocks(blocks) => blocks
                .iter()
                .map(|b| b.text.as_str())
                .collect::<Vec<_>>()
                .join("\n\n"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SystemBlock {
    pub r#type: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<serde_json::Value>,
}

/// Content block. Types the gateway does not model are kept as raw JSON so
/// they survive the native passthrough.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ContentBlock {
    Known(KnownContentBlock),
    Unknown(serde_json::Value),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum KnownContentBlock {
    #[serde(rename = "text")]
    Text {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<serde_json::Value>,
    },
    #[serde(rename = "image")]
    Image { source: ImageSource },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: ToolResultContent,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
    #[serde(rename = "thinking")]
    Thinking {
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Known(KnownContentBlock::Text {
            text: text.into(),
            cache_control: None,
        })
    }

    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, input: serde_json::Value) -> Self {
        ContentBlock::Known(KnownContentBlock::ToolUse {
            id: id.into(),
            name: name.into(),
            input,
        })
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        ContentBlock::Known(KnownContentBlock::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: ToolResultContent::Text(content.into()),
            is_error: false,
        })
    }

    pub fn thinking(thinking: impl Into<String>) -> Self {
        ContentBlock::Known(KnownContentBlock::Thinking {
            thinking: thinking.into(),
            signature: None,
        })
    }

    pub fn is_tool_result(&self) -> bool {
        matches!(self, ContentBlock::Known(KnownContentBlock::ToolResult { .. }))
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentBlock::Known(KnownContentBlock::Text { text, .. }) => Some(text),
            _ => None,
        }
    }
}

/// Image source: base64 data or a URL
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImageSource {
    pub r#type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl ImageSource {
    /// `data:` URI for base64 sources, the URL otherwise.
    pub fn to_url(&self) -> Option<String> {
        match (self.r#type.as_str(), &self.data, &self.url) {
            ("base64", Some(data), _) => Some(format!(
                "data:{};base64,{}",
                self.media_type.as_deref().unwrap_or("image/png"),
                data
            )),
            (_, _, Some(url)) => Some(url.clone()),
            _ => None,
        }
    }
}

/// Tool result payload: a string or text/image blocks
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ToolResultContent {
    Text(String),
    Blocks(Vec<serde_json::Value>),
}

impl Default for ToolResultContent {
    fn default() -> Self {
        ToolResultContent::Text(String::new())
    }
}

impl std::fmt::Display for ToolResultContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolResultContent::Text(s) => write!(f, "{}", s),
            ToolResultContent::Blocks(blocks) => {
                let parts: Vec<String> = blocks
                    .iter()
                    .map(|block| match block.get("type").and_then(|t| t.as_str()) {
                        Some("text") => block
                            .get("text")
                            .and_then(|t| t.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        Some("image") => "[Image]".to_string(),
                        _ => block.to_string(),
                    })
                    .collect();
                write!(f, "{}", parts.join("\n"))
            }
        }
    }
}

/// Tool definition in Anthropic shape
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Tool {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<serde_json::Value>,
    /// `type`, `cache_control` and anything else the client sent.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Tool {
    /// Declared tool type, e.g. `custom` or a server tool like `web_search_20250305`.
    pub fn tool_type(&self) -> Option<&str> {
        self.extra.get("type").and_then(|t| t.as_str())
    }

    /// Client-defined tool, the only kind other dialects can express.
    pub fn is_custom(&self) -> bool {
        matches!(self.tool_type(), None | Some("custom"))
    }
}

/// `POST /v1/messages/count_tokens` body
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CountTokensRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemPrompt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
}

impl CountTokensRequest {
    /// Rough estimate: four characters per token, at least one token.
    pub fn estimate_tokens(&self) -> u32 {
        let mut chars = self.system.as_ref().map(|s| s.to_text().len()).unwrap_or(0);
        for message in &self.messages {
            chars += match &message.content {
                MessageContent::Text(text) => text.len(),
                MessageContent::Blocks(blocks) => blocks
                    .iter()
                    .map(|b| match b {
                        ContentBlock::Known(KnownContentBlock::Text { text, .. }) => text.len(),
                        ContentBlock::Known(KnownContentBlock::ToolResult { content, .. }) => {
                            content.to_string().len()
                        }
                        other => serde_json::to_string(other).map(|s| s.len()).unwrap_or(0),
                    })
                    .sum(),
            };
        }
        for tool in self.tools.iter().flatten() {
            chars += serde_json::to_string(tool).map(|s| s.len()).unwrap_or(0);
        }
        ((chars / 4) as u32).max(1)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CountTokensResponse {
    pub input_tokens: u32,
}
