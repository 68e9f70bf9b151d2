//! Dialect translation through the public translate API

#[path = "../helpers/fixtures.rs"]
mod fixtures;

#[cfg(test)]
mod tests {
    use super::fixtures::{create_test_request, create_tool_request, weather_tool};
    use bridgeway::cli::TokenLimits;
    use bridgeway::providers::classify::BackendKind;
    use bridgeway::providers::streaming::{parse_sse_events, SseEvent};
    use bridgeway::translate::*;
    use serde_json::json;

    const LIMITS: TokenLimits = TokenLimits {
        min: 4096,
        max: 512_000,
    };

    #[test]
    fn test_weather_tool_shapes() {
        let def = ToolDefinition::from_tool(&weather_tool()).unwrap();
        let parameters = json!({
            "type": "object",
            "properties": {"location": {"type": "string"}},
            "required": ["location"]
        });

        let flat = def.to_flat();
        assert_eq!(flat["type"], "function");
        assert_eq!(flat["name"], "get_weather");
        assert_eq!(flat["parameters"], parameters);

        let nested = def.to_nested();
        assert_eq!(nested["type"], "function");
        assert_eq!(nested["function"]["name"], "get_weather");
        assert_eq!(nested["function"]["parameters"], parameters);

        assert_eq!(ToolDefinition::from_flat(&flat), Some(def.clone()));
        assert_eq!(ToolDefinition::from_nested(&nested), Some(def.clone()));
        assert_eq!(ToolDefinition::from_anthropic(&def.to_anthropic()), Some(def));
    }

    #[test]
    fn test_tools_per_backend() {
        let tools = vec![weather_tool()];
        let responses = to_backend_tools(&tools, BackendKind::AzureResponses);
        assert_eq!(responses[0]["name"], "get_weather");
        let chat = to_backend_tools(&tools, BackendKind::AzureChat);
        assert_eq!(chat[0]["function"]["name"], "get_weather");
        let native = to_backend_tools(&tools, BackendKind::Native);
        assert!(native[0].get("input_schema").is_some());
    }

    #[test]
    fn test_tool_choice_mapping() {
        let any = json!({"type": "any"});
        assert_eq!(to_backend_tool_choice(&any, BackendKind::AzureChat), Some(json!("required")));
        assert_eq!(to_backend_tool_choice(&any, BackendKind::Native), Some(any.clone()));

        let named = json!({"type": "tool", "name": "get_weather"});
        assert_eq!(
            to_backend_tool_choice(&named, BackendKind::Compatibility),
            Some(json!({"type": "function", "function": {"name": "get_weather"}}))
        );
        assert_eq!(
            to_backend_tool_choice(&named, BackendKind::AzureResponses),
            Some(json!({"type": "function", "name": "get_weather"}))
        );
        assert_eq!(
            to_backend_tool_choice(&json!({"type": "bogus"}), BackendKind::AzureChat),
            None
        );
    }

    #[test]
    fn test_tool_request_to_chat() {
        let request = create_tool_request("claude-sonnet-4-5", "Weather in Paris?");
        let payload =
            translate_request(&request, BackendKind::AzureChat, "gpt4-deploy", LIMITS).unwrap();
        assert_eq!(payload["tools"][0]["function"]["name"], "get_weather");
        assert_eq!(payload["tool_choice"], "auto");
        assert_eq!(payload["messages"][0]["content"], "Weather in Paris?");
        assert!(payload.get("stream").is_none());
    }

    #[test]
    fn test_responses_request_clamps_tokens() {
        let mut request = create_test_request("claude-sonnet-4-5", "hi");
        request.max_tokens = 1_000_000;
        request.temperature = Some(0.2);
        let payload =
            translate_request(&request, BackendKind::AzureResponses, "gpt-5", LIMITS).unwrap();
        assert_eq!(payload["max_output_tokens"], 512_000);
        assert_eq!(payload["temperature"], RESPONSES_TEMPERATURE as f64);
        assert_eq!(payload["model"], "gpt-5");
    }

    #[test]
    fn test_native_response_passes_through() {
        let raw = json!({
            "id": "msg_abc",
            "type": "message",
            "role": "assistant",
            "content": [{"type": "text", "text": "hello"}],
            "model": "claude-sonnet-4-5",
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 4, "output_tokens": 1, "cache_read_input_tokens": 2}
        });
        let response = translate_response(raw, BackendKind::Native, "claude-sonnet-4-5").unwrap();
        assert_eq!(response.id, "msg_abc");
        assert_eq!(response.usage.cache_read_input_tokens, Some(2));
    }

    #[test]
    fn test_responses_reasoning_becomes_thinking() {
        let raw = json!({
            "id": "resp_1",
            "status": "completed",
            "output": [
                {"type": "reasoning", "content": [{"type": "reasoning_text", "text": "step 1"}]},
                {"type": "message", "content": [{"type": "output_text", "text": "answer"}]}
            ]
        });
        let response = translate_response(raw, BackendKind::AzureResponses, "claude-opus-4").unwrap();
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["content"][0]["type"], "thinking");
        assert_eq!(json["content"][0]["thinking"], "step 1");
        assert_eq!(json["content"][1]["text"], "answer");
        assert_eq!(response.stop_reason.as_deref(), Some("end_turn"));
        assert_eq!(response.model, "claude-opus-4");
    }

    #[test]
    fn test_chat_stream_with_reasoning() {
        let mut state = StreamTranslator::new(BackendKind::Compatibility, "claude-sonnet-4-5");
        let wire = concat!(
            "data: {\"choices\":[{\"delta\":{\"reasoning\":\"think\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"done\"},\"finish_reason\":\"length\"}]}\n\n",
            "data: [DONE]\n\n",
        );
        let mut out = String::new();
        for event in parse_sse_events(wire) {
            out += &translate_stream_chunk(&event, &mut state).unwrap();
        }

        let events = parse_sse_events(&out);
        let names: Vec<&str> = events.iter().filter_map(|e| e.event.as_deref()).collect();
        assert_eq!(
            names,
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop"
            ]
        );
        assert!(out.contains("thinking_delta"));
        assert!(out.contains("\"stop_reason\":\"max_tokens\""));
        assert!(out.contains("\"model\":\"claude-sonnet-4-5\""));
        assert!(state.is_finished());
    }

    #[test]
    fn test_stream_after_finish_is_silent() {
        let mut state = StreamTranslator::new(BackendKind::AzureChat, "m");
        state.finish();
        let late = SseEvent {
            event: None,
            data: r#"{"choices":[{"delta":{"content":"late"}}]}"#.to_string(),
        };
        assert_eq!(translate_stream_chunk(&late, &mut state).unwrap(), "");
    }

    #[test]
    fn test_error_event_shape() {
        let wire = error_event("overloaded_error", "busy");
        let events = parse_sse_events(&wire);
        assert_eq!(events[0].event.as_deref(), Some("error"));
        let data: serde_json::Value = serde_json::from_str(&events[0].data).unwrap();
        assert_eq!(data["error"]["type"], "overloaded_error");
        assert_eq!(data["error"]["message"], "busy");
    }
}
