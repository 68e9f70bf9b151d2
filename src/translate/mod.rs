//! Dialect translation between the Anthropic Messages shape and each backend.

mod chat;
mod responses;
pub mod stream;
pub mod tools;
mod types;

pub use responses::RESPONSES_TEMPERATURE;
pub use stream::{error_event, StreamTranslator};
pub use tools::{to_backend_tool_choice, to_backend_tools, ToolDefinition};

use crate::cli::TokenLimits;
use crate::models::AnthropicRequest;
use crate::providers::classify::BackendKind;
use crate::providers::error::ProviderError;
use crate::providers::streaming::SseEvent;
use crate::providers::ProviderResponse;
use serde_json::Value;

/// `msg_<uuid>` unless the backend supplied a non-empty id.
pub(crate) fn message_id(id: Option<String>) -> String {
    id.filter(|id| !id.is_empty())
        .unwrap_or_else(|| format!("msg_{}", uuid::Uuid::new_v4().simple()))
}

/// Build the backend payload. `target_model` is the deployment or backend
/// model name; native requests keep everything else unchanged.
pub fn translate_request(
    request: &AnthropicRequest,
    kind: BackendKind,
    target_model: &str,
    limits: TokenLimits,
) -> Result<Value, ProviderError> {
    let payload = match kind {
        BackendKind::Native => {
            let mut native = request.clone();
            native.model = target_model.to_string();
            serde_json::to_value(native)?
        }
        BackendKind::AzureChat | BackendKind::Compatibility => {
            serde_json::to_value(chat::build_request(request, target_model, kind))?
        }
        BackendKind::AzureResponses => {
            serde_json::to_value(responses::build_request(request, target_model, limits))?
        }
        BackendKind::Unknown => {
            return Err(ProviderError::Config(
                "Cannot translate for an unclassified backend".to_string(),
            ))
        }
    };
    Ok(payload)
}

/// Normalize a backend response body into an Anthropic message. `model` is
/// the model name reported back to the client.
pub fn translate_response(
    raw: Value,
    kind: BackendKind,
    model: &str,
) -> Result<ProviderResponse, ProviderError> {
    match kind {
        BackendKind::Native => Ok(serde_json::from_value(raw)?),
        BackendKind::AzureChat | BackendKind::Compatibility => {
            Ok(chat::translate_response(serde_json::from_value(raw)?, model))
        }
        BackendKind::AzureResponses => {
            Ok(responses::translate_response(serde_json::from_value(raw)?, model))
        }
        BackendKind::Unknown => Err(ProviderError::Config(
            "Cannot translate a response from an unclassified backend".to_string(),
        )),
    }
}

/// Translate one streamed backend event using `state`.
pub fn translate_stream_chunk(
    event: &SseEvent,
    state: &mut StreamTranslator,
) -> Result<String, ProviderError> {
    state.translate(event)
}
