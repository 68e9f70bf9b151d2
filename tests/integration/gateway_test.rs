//! Gateway dispatch against mock backends: translation, retry, fail-over.

#[path = "../helpers/fixtures.rs"]
mod fixtures;

#[cfg(test)]
mod tests {
    use super::fixtures::{config_from, create_streaming_request, create_test_request, create_tool_request};
    use bridgeway::providers::error::ErrorKind;
    use bridgeway::providers::retry::RecordingSleeper;
    use bridgeway::providers::streaming::parse_sse_events;
    use bridgeway::security::url_guard::SecurityError;
    use bridgeway::providers::error::ProviderError;
    use bridgeway::server::dispatch::{DispatchResult, Gateway};
    use futures::StreamExt;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const MODEL: &str = "claude-sonnet-4-5";

    fn native_body(text: &str) -> Value {
        json!({
            "id": "msg_native",
            "type": "message",
            "role": "assistant",
            "content": [{"type": "text", "text": text}],
            "model": MODEL,
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 5, "output_tokens": 2}
        })
    }

    fn chat_body(text: &str) -> Value {
        json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": text},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 11, "completion_tokens": 3}
        })
    }

    fn gateway(pairs: &[(&str, &str)]) -> (Gateway, Arc<RecordingSleeper>) {
        let sleeper = Arc::new(RecordingSleeper::new());
        let gateway = Gateway::new(Arc::new(config_from(pairs)))
            .unwrap()
            .with_sleeper(sleeper.clone());
        (gateway, sleeper)
    }

    /// Passthrough mode: native primary on `anthropic`, Azure fallback on `azure`.
    fn passthrough(anthropic: &MockServer, azure: &MockServer, extra: &[(&str, &str)]) -> (Gateway, Arc<RecordingSleeper>) {
        let anthropic_uri = anthropic.uri();
        let azure_uri = azure.uri();
        let mut pairs = vec![
            ("PASSTHROUGH_MODE", "true"),
            ("ANTHROPIC_API_KEY", "sk-ant-test"),
            ("ANTHROPIC_BASE_URL", anthropic_uri.as_str()),
            ("AZURE_OPENAI_KEY", "azure-test"),
            ("OPENAI_BASE_URL", azure_uri.as_str()),
            ("AZURE_OPENAI_DEPLOYMENT_NAME", "chat-deploy"),
            ("BRIDGEWAY_ALLOW_PRIVATE", "true"),
        ];
        pairs.extend_from_slice(extra);
        gateway(&pairs)
    }

    fn complete(result: DispatchResult) -> (bridgeway::providers::ProviderResponse, String) {
        match result {
            DispatchResult::Complete { response, backend } => (response, backend),
            DispatchResult::Streaming { .. } => panic!("expected a complete response"),
        }
    }

    async fn collect_stream(result: DispatchResult) -> String {
        let DispatchResult::Streaming { response, .. } = result else {
            panic!("expected a streaming response");
        };
        let mut stream = response.stream;
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        String::from_utf8(out).unwrap()
    }

    async fn mount_azure_chat(azure: &MockServer, deployment: &str, body: Value) {
        Mock::given(method("POST"))
            .and(path(format!("/openai/deployments/{}/chat/completions", deployment)))
            .and(query_param("api-version", "2024-02-01"))
            .and(header("api-key", "azure-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(azure)
            .await;
    }

    // ── Happy paths ──────────────────────────────────────────

    #[tokio::test]
    async fn test_native_passthrough() {
        let anthropic = MockServer::start().await;
        let azure = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "sk-ant-test"))
            .and(header("anthropic-version", "2023-06-01"))
            .respond_with(ResponseTemplate::new(200).set_body_json(native_body("hi there")))
            .expect(1)
            .mount(&anthropic)
            .await;

        let (gateway, sleeper) = passthrough(&anthropic, &azure, &[]);
        let (response, backend) =
            complete(gateway.dispatch(&create_test_request(MODEL, "hello"), "t1").await.unwrap());
        assert_eq!(backend, "anthropic");
        assert_eq!(response.id, "msg_native");
        assert_eq!(response.content[0].as_text(), Some("hi there"));
        assert!(sleeper.delays().is_empty());
    }

    #[tokio::test]
    async fn test_azure_chat_translation() {
        let azure = MockServer::start().await;
        mount_azure_chat(&azure, "gpt4-prod", chat_body("bonjour")).await;

        let uri = azure.uri();
        let (gateway, _) = gateway(&[
            ("AZURE_OPENAI_KEY", "azure-test"),
            ("OPENAI_BASE_URL", uri.as_str()),
            ("AZURE_GPT4_DEPLOYMENT", "gpt4-prod"),
            ("BIG_MODEL", "gpt-4"),
            ("BRIDGEWAY_ALLOW_PRIVATE", "true"),
        ]);
        let (response, backend) =
            complete(gateway.dispatch(&create_test_request(MODEL, "hello"), "t2").await.unwrap());
        assert_eq!(backend, "azure");
        assert_eq!(response.model, MODEL);
        assert_eq!(response.content[0].as_text(), Some("bonjour"));
        assert_eq!(response.stop_reason.as_deref(), Some("end_turn"));
        assert_eq!(response.usage.input_tokens, 11);

        let requests = azure.received_requests().await.unwrap();
        let sent: Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(sent["model"], "gpt4-prod");
        assert_eq!(sent["messages"][0]["role"], "user");
        assert_eq!(sent["max_completion_tokens"], 1024);
    }

    #[tokio::test]
    async fn test_azure_responses_tool_call() {
        let azure = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/openai/responses"))
            .and(query_param("api-version", "2024-02-01"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "resp_1",
                "status": "completed",
                "output": [{
                    "type": "function_call",
                    "call_id": "call_42",
                    "name": "get_weather",
                    "arguments": "{\"location\":\"Paris\"}"
                }],
                "usage": {"input_tokens": 20, "output_tokens": 8}
            })))
            .mount(&azure)
            .await;

        let endpoint = format!("{}/openai/responses", azure.uri());
        let (gateway, _) = gateway(&[
            ("AZURE_OPENAI_KEY", "azure-test"),
            ("OPENAI_BASE_URL", endpoint.as_str()),
            ("BRIDGEWAY_ALLOW_PRIVATE", "true"),
        ]);
        let (response, _) = complete(
            gateway
                .dispatch(&create_tool_request(MODEL, "Weather in Paris?"), "t3")
                .await
                .unwrap(),
        );
        assert_eq!(response.stop_reason.as_deref(), Some("tool_use"));
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["content"][0]["id"], "call_42");
        assert_eq!(json["content"][0]["input"]["location"], "Paris");

        let requests = azure.received_requests().await.unwrap();
        let sent: Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(sent["tools"][0]["name"], "get_weather");
        assert_eq!(sent["max_output_tokens"], 4096);
        assert_eq!(sent["temperature"], 1.0);
    }

    // ── Retry ────────────────────────────────────────────────

    #[tokio::test]
    async fn test_server_errors_are_retried_with_backoff() {
        let anthropic = MockServer::start().await;
        let azure = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .up_to_n_times(2)
            .mount(&anthropic)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(native_body("finally")))
            .mount(&anthropic)
            .await;

        let (gateway, sleeper) = passthrough(&anthropic, &azure, &[]);
        let (response, backend) =
            complete(gateway.dispatch(&create_test_request(MODEL, "hello"), "t4").await.unwrap());
        assert_eq!(backend, "anthropic");
        assert_eq!(response.content[0].as_text(), Some("finally"));
        assert_eq!(sleeper.delays(), vec![Duration::from_secs(1), Duration::from_secs(2)]);
        assert_eq!(gateway.failover().failure_count("anthropic"), 0);
    }

    #[tokio::test]
    async fn test_rate_limit_honors_retry_after() {
        let anthropic = MockServer::start().await;
        let azure = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
            .up_to_n_times(1)
            .mount(&anthropic)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(native_body("ok")))
            .mount(&anthropic)
            .await;

        let (gateway, sleeper) = passthrough(&anthropic, &azure, &[]);
        gateway.dispatch(&create_test_request(MODEL, "hello"), "t5").await.unwrap();
        assert_eq!(sleeper.delays(), vec![Duration::from_secs(7)]);
    }

    #[tokio::test]
    async fn test_retry_after_is_capped() {
        let anthropic = MockServer::start().await;
        let azure = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "3600"))
            .up_to_n_times(1)
            .mount(&anthropic)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(native_body("ok")))
            .mount(&anthropic)
            .await;

        let (gateway, sleeper) =
            passthrough(&anthropic, &azure, &[("PASSTHROUGH_MAX_RETRY_DELAY", "30")]);
        gateway.dispatch(&create_test_request(MODEL, "hello"), "t6").await.unwrap();
        assert_eq!(sleeper.delays(), vec![Duration::from_secs(30)]);
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried_or_counted() {
        let anthropic = MockServer::start().await;
        let azure = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "type": "error",
                "error": {"type": "invalid_request_error", "message": "messages: field required"}
            })))
            .expect(1)
            .mount(&anthropic)
            .await;

        let (gateway, sleeper) = passthrough(&anthropic, &azure, &[]);
        let err = gateway
            .dispatch(&create_test_request(MODEL, "hello"), "t7")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Client);
        assert_eq!(err.status(), Some(400));
        assert!(err.to_string().contains("field required"));
        assert!(sleeper.delays().is_empty());
        assert_eq!(gateway.failover().failure_count("anthropic"), 0);
        assert!(azure.received_requests().await.unwrap().is_empty());
    }

    // ── Fail-over ────────────────────────────────────────────

    #[tokio::test]
    async fn test_exhausted_primary_fails_over() {
        let anthropic = MockServer::start().await;
        let azure = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&anthropic)
            .await;
        mount_azure_chat(&azure, "chat-deploy", chat_body("from azure")).await;

        let (gateway, sleeper) =
            passthrough(&anthropic, &azure, &[("PASSTHROUGH_MAX_RETRIES", "2")]);
        let (response, backend) =
            complete(gateway.dispatch(&create_test_request(MODEL, "hello"), "t8").await.unwrap());
        assert_eq!(backend, "azure");
        assert_eq!(response.content[0].as_text(), Some("from azure"));
        assert_eq!(sleeper.delays().len(), 1);
        assert_eq!(gateway.failover().failure_count("anthropic"), 1);
        assert_eq!(gateway.failover().failure_count("azure"), 0);
    }

    #[tokio::test]
    async fn test_threshold_routes_to_fallback_then_resets() {
        let anthropic = MockServer::start().await;
        let azure = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&anthropic)
            .await;
        mount_azure_chat(&azure, "chat-deploy", chat_body("fallback")).await;

        let (gateway, _) = passthrough(
            &anthropic,
            &azure,
            &[
                ("PASSTHROUGH_MAX_RETRIES", "1"),
                ("PASSTHROUGH_FALLBACK_AFTER_FAILURES", "3"),
            ],
        );
        let request = create_test_request(MODEL, "hello");

        for i in 1..=3 {
            let result = gateway.dispatch(&request, "t9").await.unwrap();
            assert_eq!(result.backend(), "azure");
            assert_eq!(gateway.failover().failure_count("anthropic"), i);
        }
        assert!(gateway.failover().should_use_fallback("anthropic"));
        assert_eq!(gateway.active_backend().id, "azure");

        // Routed straight to the fallback; its success clears the primary streak.
        let result = gateway.dispatch(&request, "t9").await.unwrap();
        assert_eq!(result.backend(), "azure");
        assert_eq!(anthropic.received_requests().await.unwrap().len(), 3);
        assert!(!gateway.failover().should_use_fallback("anthropic"));
        assert_eq!(gateway.active_backend().id, "anthropic");
    }

    #[tokio::test]
    async fn test_failover_disabled_surfaces_error() {
        let anthropic = MockServer::start().await;
        let azure = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&anthropic)
            .await;

        let (gateway, _) = passthrough(
            &anthropic,
            &azure,
            &[
                ("PASSTHROUGH_MAX_RETRIES", "1"),
                ("PASSTHROUGH_FALLBACK_ENABLED", "false"),
            ],
        );
        let err = gateway
            .dispatch(&create_test_request(MODEL, "hello"), "t10")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Server);
        assert_eq!(err.status(), Some(503));
        assert!(azure.received_requests().await.unwrap().is_empty());
        assert_eq!(gateway.failover().failure_count("anthropic"), 1);
    }

    #[tokio::test]
    async fn test_both_backends_failing() {
        let anthropic = MockServer::start().await;
        let azure = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&anthropic)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(504))
            .mount(&azure)
            .await;

        let (gateway, _) =
            passthrough(&anthropic, &azure, &[("PASSTHROUGH_MAX_RETRIES", "1")]);
        let err = gateway
            .dispatch(&create_test_request(MODEL, "hello"), "t11")
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(504));
        assert_eq!(gateway.failover().failure_count("anthropic"), 1);
        assert_eq!(gateway.failover().failure_count("azure"), 1);
    }

    #[tokio::test]
    async fn test_unreachable_primary_is_retried_then_fails_over() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let dead = format!("http://127.0.0.1:{}", port);
        let azure = MockServer::start().await;
        mount_azure_chat(&azure, "chat-deploy", chat_body("from azure")).await;
        let azure_uri = azure.uri();

        let (gateway, sleeper) = gateway(&[
            ("PASSTHROUGH_MODE", "true"),
            ("ANTHROPIC_API_KEY", "sk-ant-test"),
            ("ANTHROPIC_BASE_URL", dead.as_str()),
            ("AZURE_OPENAI_KEY", "azure-test"),
            ("OPENAI_BASE_URL", azure_uri.as_str()),
            ("AZURE_OPENAI_DEPLOYMENT_NAME", "chat-deploy"),
            ("BRIDGEWAY_ALLOW_PRIVATE", "true"),
            ("PASSTHROUGH_MAX_RETRIES", "2"),
        ]);
        let (response, backend) =
            complete(gateway.dispatch(&create_test_request(MODEL, "hello"), "t13").await.unwrap());
        assert_eq!(backend, "azure");
        assert_eq!(response.content[0].as_text(), Some("from azure"));
        assert_eq!(sleeper.delays(), vec![Duration::from_secs(1)]);
        assert_eq!(gateway.failover().failure_count("anthropic"), 1);
        assert_eq!(gateway.failover().failure_count("azure"), 0);
    }

    #[tokio::test]
    async fn test_non_retryable_server_error_fails_over_at_once() {
        let anthropic = MockServer::start().await;
        let azure = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(501))
            .expect(1)
            .mount(&anthropic)
            .await;
        mount_azure_chat(&azure, "chat-deploy", chat_body("from azure")).await;

        let (gateway, sleeper) =
            passthrough(&anthropic, &azure, &[("PASSTHROUGH_MAX_RETRIES", "3")]);
        let result = gateway
            .dispatch(&create_test_request(MODEL, "hello"), "t14")
            .await
            .unwrap();
        assert_eq!(result.backend(), "azure");
        assert!(sleeper.delays().is_empty());
        assert_eq!(gateway.failover().failure_count("anthropic"), 1);
    }

    // ── Security ─────────────────────────────────────────────

    #[tokio::test]
    async fn test_redirect_is_not_followed() {
        let anthropic = MockServer::start().await;
        let azure = MockServer::start().await;
        let internal = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(
                ResponseTemplate::new(307)
                    .insert_header("location", format!("{}/internal/admin", internal.uri()).as_str()),
            )
            .expect(1)
            .mount(&anthropic)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(native_body("leaked")))
            .mount(&internal)
            .await;

        let (gateway, sleeper) = passthrough(&anthropic, &azure, &[]);
        let err = gateway
            .dispatch(&create_test_request(MODEL, "hello"), "t15")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProviderError::Security(SecurityError::RedirectBlocked { status: 307, .. })
        ));
        assert!(internal.received_requests().await.unwrap().is_empty());
        assert!(azure.received_requests().await.unwrap().is_empty());
        assert!(sleeper.delays().is_empty());
        assert_eq!(gateway.failover().failure_count("anthropic"), 0);
    }

    #[tokio::test]
    async fn test_private_backend_rejected_without_opt_in() {
        let anthropic = MockServer::start().await;
        let azure = MockServer::start().await;
        let anthropic_uri = anthropic.uri();
        let azure_uri = azure.uri();
        let (gateway, sleeper) = gateway(&[
            ("PASSTHROUGH_MODE", "true"),
            ("ANTHROPIC_API_KEY", "sk-ant-test"),
            ("ANTHROPIC_BASE_URL", anthropic_uri.as_str()),
            ("AZURE_OPENAI_KEY", "azure-test"),
            ("OPENAI_BASE_URL", azure_uri.as_str()),
        ]);
        let err = gateway
            .dispatch(&create_test_request(MODEL, "hello"), "t12")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProviderError::Security(SecurityError::HttpsRequired { .. })
        ));
        assert!(sleeper.delays().is_empty());
        assert_eq!(gateway.failover().failure_count("anthropic"), 0);
        assert!(anthropic.received_requests().await.unwrap().is_empty());
        assert!(azure.received_requests().await.unwrap().is_empty());
    }

    // ── Streaming ────────────────────────────────────────────

    #[tokio::test]
    async fn test_azure_chat_stream_is_translated() {
        let azure = MockServer::start().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\",\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"},\"finish_reason\":\"stop\"}]}\n\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":4,\"completion_tokens\":2}}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/openai/deployments/chat-deploy/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("x-ratelimit-remaining-requests", "99")
                    .set_body_raw(body, "text/event-stream"),
            )
            .mount(&azure)
            .await;

        let uri = azure.uri();
        let (gateway, _) = gateway(&[
            ("AZURE_OPENAI_KEY", "azure-test"),
            ("OPENAI_BASE_URL", uri.as_str()),
            ("AZURE_OPENAI_DEPLOYMENT_NAME", "chat-deploy"),
            ("BRIDGEWAY_ALLOW_PRIVATE", "true"),
        ]);
        let result = gateway
            .dispatch(&create_streaming_request(MODEL, "hello"), "t13")
            .await
            .unwrap();
        if let DispatchResult::Streaming { ref response, .. } = result {
            assert_eq!(
                response.headers.get("x-ratelimit-remaining-requests").map(String::as_str),
                Some("99")
            );
        }
        let out = collect_stream(result).await;

        let events = parse_sse_events(&out);
        let names: Vec<&str> = events.iter().filter_map(|e| e.event.as_deref()).collect();
        assert_eq!(names.first(), Some(&"message_start"));
        assert_eq!(names.last(), Some(&"message_stop"));
        assert_eq!(names.iter().filter(|n| **n == "message_stop").count(), 1);
        assert!(out.contains("\"text\":\"Hel\""));
        assert!(out.contains("\"text\":\"lo\""));
        assert!(out.contains("\"output_tokens\":2"));

        let sent: Value =
            serde_json::from_slice(&azure.received_requests().await.unwrap()[0].body).unwrap();
        assert_eq!(sent["stream"], true);
        assert_eq!(sent["stream_options"]["include_usage"], true);
    }

    #[tokio::test]
    async fn test_truncated_stream_is_closed() {
        let azure = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n\n",
                "text/event-stream",
            ))
            .mount(&azure)
            .await;

        let uri = azure.uri();
        let (gateway, _) = gateway(&[
            ("AZURE_OPENAI_KEY", "azure-test"),
            ("OPENAI_BASE_URL", uri.as_str()),
            ("BRIDGEWAY_ALLOW_PRIVATE", "true"),
        ]);
        let out = collect_stream(
            gateway
                .dispatch(&create_streaming_request(MODEL, "hello"), "t14")
                .await
                .unwrap(),
        )
        .await;
        assert!(out.contains("\"stop_reason\":\"end_turn\""));
        assert!(out.ends_with("event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n"));
    }

    #[tokio::test]
    async fn test_mid_stream_error_becomes_error_event() {
        let azure = MockServer::start().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n",
            "data: {\"error\":{\"message\":\"content filtered\",\"code\":\"content_filter\"}}\n\n",
        );
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&azure)
            .await;

        let uri = azure.uri();
        let (gateway, _) = gateway(&[
            ("AZURE_OPENAI_KEY", "azure-test"),
            ("OPENAI_BASE_URL", uri.as_str()),
            ("BRIDGEWAY_ALLOW_PRIVATE", "true"),
        ]);
        let out = collect_stream(
            gateway
                .dispatch(&create_streaming_request(MODEL, "hello"), "t15")
                .await
                .unwrap(),
        )
        .await;
        let events = parse_sse_events(&out);
        let last = events.last().unwrap();
        assert_eq!(last.event.as_deref(), Some("error"));
        assert!(last.data.contains("Upstream service error (502)"));
        assert!(out.contains("\"text\":\"Hi\""));
    }

    #[tokio::test]
    async fn test_native_stream_passes_through() {
        let anthropic = MockServer::start().await;
        let azure = MockServer::start().await;
        let body = concat!(
            "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":3}}}\n\n",
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"yo\"}}\n\n",
            "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("anthropic-ratelimit-requests-remaining", "41")
                    .set_body_raw(body, "text/event-stream"),
            )
            .mount(&anthropic)
            .await;

        let (gateway, _) = passthrough(&anthropic, &azure, &[]);
        let result = gateway
            .dispatch(&create_streaming_request(MODEL, "hello"), "t16")
            .await
            .unwrap();
        assert_eq!(result.backend(), "anthropic");
        if let DispatchResult::Streaming { ref response, .. } = result {
            assert_eq!(
                response.headers.get("anthropic-ratelimit-requests-remaining").map(String::as_str),
                Some("41")
            );
        }
        assert_eq!(collect_stream(result).await, body);
    }
}
