//! Tool definitions and tool_choice across the three wire shapes.
//!
//! * flat (Responses): `{type:"function", name, description, parameters}`
//! * nested (Chat-Completions): `{type:"function", function:{name, description, parameters}}`
//! * Anthropic: `{name, description, input_schema}`

use crate::models::Tool;
use crate::providers::classify::BackendKind;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Fields shared by every tool shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

fn empty_schema() -> Value {
    json!({})
}

fn from_parts(name: Option<&Value>, description: Option<&Value>, parameters: Option<&Value>) -> Option<ToolDefinition> {
    let name = name?.as_str().filter(|n| !n.is_empty())?;
    Some(ToolDefinition {
        name: name.to_string(),
        description: description
            .and_then(|d| d.as_str())
            .unwrap_or_default()
            .to_string(),
        parameters: parameters
            .filter(|p| !p.is_null())
            .cloned()
            .unwrap_or_else(empty_schema),
    })
}

impl ToolDefinition {
    /// `None` when the tool has no name.
    pub fn from_tool(tool: &Tool) -> Option<Self> {
        let name = tool.name.as_deref().filter(|n| !n.is_empty())?;
        Some(Self {
            name: name.to_string(),
            description: tool.description.clone().unwrap_or_default(),
            parameters: tool.input_schema.clone().unwrap_or_else(empty_schema),
        })
    }

    pub fn from_flat(value: &Value) -> Option<Self> {
        from_parts(
            value.get("name"),
            value.get("description"),
            value.get("parameters"),
        )
    }

    pub fn from_nested(value: &Value) -> Option<Self> {
        let function = value.get("function")?;
        from_parts(
            function.get("name"),
            function.get("description"),
            function.get("parameters"),
        )
    }

    pub fn from_anthropic(value: &Value) -> Option<Self> {
        from_parts(
            value.get("name"),
            value.get("description"),
            value.get("input_schema"),
        )
    }

    pub fn to_flat(&self) -> Value {
        json!({
            "type": "function",
            "name": self.name,
            "description": self.description,
            "parameters": self.parameters,
        })
    }

    pub fn to_nested(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }

    pub fn to_anthropic(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "input_schema": self.parameters,
        })
    }

    pub fn to_backend(&self, kind: BackendKind) -> Value {
        match kind {
            BackendKind::AzureResponses => self.to_flat(),
            BackendKind::Native => self.to_anthropic(),
            BackendKind::AzureChat | BackendKind::Compatibility | BackendKind::Unknown => {
                self.to_nested()
            }
        }
    }
}

/// Convert tools for `kind`. Nameless tools are dropped. Native backends get
/// the tools untouched; other dialects only see custom tools.
pub fn to_backend_tools(tools: &[Tool], kind: BackendKind) -> Vec<Value> {
    if kind == BackendKind::Native {
        return tools
            .iter()
            .filter_map(|tool| serde_json::to_value(tool).ok())
            .collect();
    }
    tools
        .iter()
        .filter(|tool| {
            if !tool.is_custom() {
                tracing::debug!("Skipping server tool {:?} for {}", tool.tool_type(), kind.as_str());
            }
            tool.is_custom()
        })
        .filter_map(|tool| {
            let def = ToolDefinition::from_tool(tool);
            if def.is_none() {
                tracing::debug!("Skipping tool without a name");
            }
            def
        })
        .map(|def| def.to_backend(kind))
        .collect()
}

/// Convert an Anthropic `tool_choice` for `kind`. Unrecognised choices yield `None`.
pub fn to_backend_tool_choice(choice: &Value, kind: BackendKind) -> Option<Value> {
    if kind == BackendKind::Native {
        return Some(choice.clone());
    }
    if let Some(s) = choice.as_str() {
        return match s {
            "auto" | "none" | "required" => Some(json!(s)),
            "any" => Some(json!("required")),
            _ => None,
        };
    }
    match choice.get("type").and_then(|t| t.as_str())? {
        "auto" => Some(json!("auto")),
        "any" => Some(json!("required")),
        "none" => Some(json!("none")),
        "tool" => {
            let name = choice.get("name").and_then(|n| n.as_str())?;
            if kind == BackendKind::AzureResponses {
                Some(json!({ "type": "function", "name": name }))
            } else {
                Some(json!({ "type": "function", "function": { "name": name } }))
            }
        }
        _ => None,
    }
}
