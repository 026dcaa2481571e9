use super::*;
use crate::config::EmbeddingConfig;

#[test]
fn client_configuration() {
    let config = EmbeddingConfig {
        protocol: "http".to_string(),
        host: "test-host".to_string(),
        port: 1234,
        model: "test-model".to_string(),
        ..EmbeddingConfig::default()
    };
    let client = OllamaClient::from_embedding_config(&config).expect("Failed to create client");

    assert_eq!(client.model(), "test-model");
    assert_eq!(client.base_url().host_str(), Some("test-host"));
    assert_eq!(client.base_url().port(), Some(1234));
    assert_eq!(EmbeddingProvider::name(&client), "ollama");
}

#[test]
fn invalid_host_is_rejected() {
    let config = EmbeddingConfig {
        host: String::new(),
        ..EmbeddingConfig::default()
    };
    assert!(OllamaClient::from_embedding_config(&config).is_err());
}

#[test]
fn generate_body_maps_options() {
    let request = GenerationRequest {
        prompt: "Why?".to_string(),
        model: "llama".to_string(),
        max_tokens: 128,
        temperature: 0.2,
    };
    let body = OllamaClient::generate_body(&request, false).expect("should serialize");
    let value: serde_json::Value = serde_json::from_str(&body).expect("should parse");

    assert_eq!(value["model"], "llama");
    assert_eq!(value["prompt"], "Why?");
    assert_eq!(value["stream"], false);
    assert_eq!(value["options"]["num_predict"], 128);
}

#[test]
fn ndjson_lines_parse_into_events() {
    assert_eq!(
        parse_ndjson_line(r#"{"response":"The","done":false}"#),
        vec![StreamEvent::Fragment("The".to_string())]
    );
    assert_eq!(parse_ndjson_line(""), Vec::new());
    assert_eq!(
        parse_ndjson_line(r#"{"response":"","done":true}"#),
        vec![StreamEvent::Done]
    );
    assert_eq!(
        parse_ndjson_line(r#"{"response":" end.","done":true}"#),
        vec![
            StreamEvent::Fragment(" end.".to_string()),
            StreamEvent::Done
        ]
    );
    assert_eq!(
        parse_ndjson_line(r#"{"error":"model crashed"}"#),
        vec![StreamEvent::Error("model crashed".to_string())]
    );
    assert!(matches!(
        parse_ndjson_line("{oops").as_slice(),
        [StreamEvent::Error(_)]
    ));
}
