use super::*;

struct EchoProvider;

#[async_trait]
impl GenerationProvider for EchoProvider {
    fn name(&self) -> &str {
        "echo"
    }

    fn default_model(&self) -> &str {
        "echo-1"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        Ok(request.prompt.to_uppercase())
    }

    async fn health_check(&self) -> bool {
        true
    }
}

fn request(prompt: &str) -> GenerationRequest {
    GenerationRequest {
        prompt: prompt.to_string(),
        model: "echo-1".to_string(),
        max_tokens: 16,
        temperature: 0.0,
    }
}

#[tokio::test]
async fn default_stream_wraps_generate() {
    let mut stream = EchoProvider
        .generate_stream(&request("hello"))
        .await
        .expect("should open stream");

    assert_eq!(
        stream.next().await,
        Some(StreamEvent::Fragment("HELLO".to_string()))
    );
    assert_eq!(stream.next().await, Some(StreamEvent::Done));
    assert_eq!(stream.next().await, None);
}

#[tokio::test]
async fn empty_text_stream_only_completes() {
    let mut stream = GenerationStream::from_text(String::new());
    assert_eq!(stream.next().await, Some(StreamEvent::Done));
    assert_eq!(stream.next().await, None);
}

#[tokio::test]
async fn producer_vanishing_is_an_error() {
    let (sender, mut stream) = GenerationStream::channel(4);
    sender
        .send(StreamEvent::Fragment("part".to_string()))
        .await
        .expect("should send");
    drop(sender);

    assert_eq!(
        stream.next().await,
        Some(StreamEvent::Fragment("part".to_string()))
    );
    assert!(matches!(stream.next().await, Some(StreamEvent::Error(_))));
    assert_eq!(stream.next().await, None);
}

#[tokio::test]
async fn dropping_stream_closes_channel() {
    let (sender, stream) = GenerationStream::channel(4);
    drop(stream);

    assert!(sender.is_closed());
    assert!(
        sender
            .send(StreamEvent::Fragment("late".to_string()))
            .await
            .is_err()
    );
}

#[tokio::test]
async fn collect_text_concatenates_fragments() {
    let (sender, stream) = GenerationStream::channel(8);
    for part in ["a", "b", "c"] {
        sender
            .send(StreamEvent::Fragment(part.to_string()))
            .await
            .expect("should send");
    }
    sender.send(StreamEvent::Done).await.expect("should send");

    assert_eq!(
        stream.collect_text("p").await.expect("should collect"),
        "abc"
    );
}

#[test]
fn http_statuses_map_to_taxonomy() {
    let cases = [
        (500, true),
        (503, true),
        (429, true),
        (401, false),
        (403, false),
        (404, false),
    ];

    for (status, transient) in cases {
        let mapped = classify_status("p", status);
        assert!(mapped.is_provider_error());
        assert_eq!(
            matches!(mapped, RagError::ProviderTransientFailure { .. }),
            transient,
            "unexpected mapping for HTTP {}",
            status
        );
    }
}

fn body(parts: &[&str]) -> impl Stream<Item = std::result::Result<Vec<u8>, std::io::Error>> {
    let parts: Vec<_> = parts.iter().map(|part| Ok(part.as_bytes().to_vec())).collect();
    futures::stream::iter(parts)
}

fn parse_word(line: &str) -> Vec<StreamEvent> {
    match line {
        "" => Vec::new(),
        "END" => vec![StreamEvent::Done],
        word => vec![StreamEvent::Fragment(word.to_string())],
    }
}

#[tokio::test]
async fn pump_reassembles_lines_split_across_chunks() {
    let (sender, stream) = GenerationStream::channel(8);

    pump_lines("p", body(&["al", "pha\nbe", "ta\r\n\nEND\nignored\n"]), &sender, parse_word).await;

    assert_eq!(stream.collect_text("p").await.expect("should complete"), "alphabeta");
}

#[tokio::test]
async fn pump_parses_unterminated_last_line() {
    let (sender, stream) = GenerationStream::channel(8);

    pump_lines("p", body(&["one\n", "END"]), &sender, parse_word).await;

    assert_eq!(stream.collect_text("p").await.expect("should complete"), "one");
}

#[tokio::test]
async fn pump_reports_truncated_body() {
    let (sender, stream) = GenerationStream::channel(8);

    pump_lines("p", body(&["partial\n"]), &sender, parse_word).await;

    let result = stream.collect_text("p").await;
    assert!(matches!(
        result,
        Err(RagError::ProviderTransientFailure { .. })
    ));
}

#[tokio::test]
async fn pump_reports_body_errors() {
    let (sender, mut stream) = GenerationStream::channel(8);
    let parts = vec![
        Ok(b"first\n".to_vec()),
        Err(std::io::Error::from(std::io::ErrorKind::ConnectionReset)),
    ];

    pump_lines("p", futures::stream::iter(parts), &sender, parse_word).await;

    assert_eq!(
        stream.next().await,
        Some(StreamEvent::Fragment("first".to_string()))
    );
    assert!(matches!(stream.next().await, Some(StreamEvent::Error(_))));
}

#[tokio::test]
async fn dropped_consumer_stops_pending_body() {
    let (sender, stream) = GenerationStream::channel(1);
    drop(stream);

    // A body that never yields: only the closed channel can end the pump
    let pending = futures::stream::pending::<std::result::Result<Vec<u8>, std::io::Error>>();
    tokio::time::timeout(
        Duration::from_secs(5),
        pump_lines("p", pending, &sender, parse_word),
    )
    .await
    .expect("pump should stop once the consumer is gone");
}
