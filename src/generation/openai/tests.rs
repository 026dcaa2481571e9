use super::*;

fn client(api_key: Option<&str>) -> OpenAiClient {
    OpenAiClient::with_api_key(
        "openai",
        "gpt-test",
        "https://api.example.com/v1",
        "RAGLINE_TEST_KEY",
        api_key.map(str::to_string),
        Duration::from_secs(5),
    )
    .expect("should build client")
}

#[test]
fn completions_url_keeps_base_path() {
    let client = client(Some("key"));
    let url = client.completions_url().expect("should build url");
    assert_eq!(url.as_str(), "https://api.example.com/v1/chat/completions");
}

#[test]
fn invalid_base_url_is_rejected() {
    let result = OpenAiClient::with_api_key(
        "broken",
        "m",
        "not a url",
        "KEY",
        None,
        Duration::from_secs(1),
    );
    assert!(matches!(result, Err(RagError::Validation(_))));
}

#[tokio::test]
async fn missing_key_reports_unavailable() {
    let client = client(None);
    let request = GenerationRequest {
        prompt: "hi".to_string(),
        model: "gpt-test".to_string(),
        max_tokens: 10,
        temperature: 0.0,
    };

    let result = client.generate(&request).await;

    assert!(matches!(
        result,
        Err(RagError::ProviderUnavailable { ref provider, .. }) if provider == "openai"
    ));
    assert!(!client.health_check().await);
}

#[test]
fn request_body_carries_parameters() {
    let request = GenerationRequest {
        prompt: "Question?".to_string(),
        model: "gpt-test".to_string(),
        max_tokens: 42,
        temperature: 0.5,
    };
    let body = OpenAiClient::request_body(&request, true).expect("should serialize");
    let value: serde_json::Value = serde_json::from_str(&body).expect("should parse");

    assert_eq!(value["model"], "gpt-test");
    assert_eq!(value["max_tokens"], 42);
    assert_eq!(value["stream"], true);
    assert_eq!(value["messages"][0]["role"], "user");
    assert_eq!(value["messages"][0]["content"], "Question?");
}

#[test]
fn sse_lines_parse_into_events() {
    assert_eq!(
        parse_sse_line("p", r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#),
        Some(StreamEvent::Fragment("Hel".to_string()))
    );
    assert_eq!(parse_sse_line("p", "data: [DONE]"), Some(StreamEvent::Done));
    assert_eq!(parse_sse_line("p", ": keep-alive"), None);
    assert_eq!(parse_sse_line("p", ""), None);
    assert_eq!(
        parse_sse_line(
            "p",
            r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}]}"#
        ),
        None
    );
    assert!(matches!(
        parse_sse_line("p", "data: {oops"),
        Some(StreamEvent::Error(_))
    ));
}
