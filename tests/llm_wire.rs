//! Wire-level tests for the chat-completions client against a local stub
//! server.

use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use forge::llm::{LlmClient, OpenAiCompatClient};
use forge::types::Message;
use forge::ForgeError;

/// Serve canned HTTP responses; each connection gets the next response from
/// the list (the last one repeats).
async fn stub_server(responses: Vec<(&'static str, String)>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut served = 0usize;
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                break;
            };
            let idx = served.min(responses.len() - 1);
            served += 1;
            let (status, body) = &responses[idx];
            let (status, body) = (*status, body.clone());

            tokio::spawn(async move {
                read_request(&mut sock).await;
                let content_type = if body.starts_with("data:") {
                    "text/event-stream"
                } else {
                    "application/json"
                };
                let resp = format!(
                    "HTTP/1.1 {status}\r\ncontent-type: {content_type}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len(),
                );
                let _ = sock.write_all(resp.as_bytes()).await;
                let _ = sock.shutdown().await;
            });
        }
    });

    format!("http://{addr}/v1")
}

/// Read headers plus a content-length body so the client never sees a reset
/// while still writing.
async fn read_request(sock: &mut tokio::net::TcpStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let header_end = loop {
        let Ok(n) = sock.read(&mut chunk).await else {
            return;
        };
        if n == 0 {
            return;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let headers = String::from_utf8_lossy(&buf[..header_end]).to_lowercase();
    let content_length: usize = headers
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0);

    while buf.len() < header_end + content_length {
        let Ok(n) = sock.read(&mut chunk).await else {
            return;
        };
        if n == 0 {
            return;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn chat_body(content: &str) -> String {
    format!(
        r#"{{"choices":[{{"message":{{"role":"assistant","content":"{content}"}}}}]}}"#
    )
}

#[tokio::test]
async fn complete_returns_assistant_content() {
    let base = stub_server(vec![("200 OK", chat_body("hello there"))]).await;
    let client = OpenAiCompatClient::new(base, "key", "test-model");

    let resp = client
        .complete(&CancellationToken::new(), &[Message::user("hi")], &[])
        .await
        .unwrap();
    assert_eq!(resp.message.content, "hello there");
}

#[tokio::test]
async fn complete_parses_tool_calls_and_raw_fallback() {
    let body = r#"{"choices":[{"message":{"role":"assistant","content":null,"tool_calls":[
        {"id":"c1","type":"function","function":{"name":"shell_exec","arguments":"{\"command\":\"ls\"}"}},
        {"id":"c2","type":"function","function":{"name":"broken","arguments":"not json"}}
    ]}}]}"#;
    let base = stub_server(vec![("200 OK", body.to_string())]).await;
    let client = OpenAiCompatClient::new(base, "key", "test-model");

    let resp = client
        .complete(&CancellationToken::new(), &[Message::user("go")], &[])
        .await
        .unwrap();
    let calls = &resp.message.tool_calls;
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].args["command"], "ls");
    assert_eq!(calls[1].args["_raw"], "not json");
}

#[tokio::test]
async fn empty_choices_is_a_distinct_error() {
    let base = stub_server(vec![("200 OK", r#"{"choices":[]}"#.to_string())]).await;
    let client = OpenAiCompatClient::new(base, "key", "test-model");

    let err = client
        .complete(&CancellationToken::new(), &[Message::user("hi")], &[])
        .await
        .unwrap_err();
    assert!(matches!(err, ForgeError::EmptyChoices));
}

#[tokio::test]
async fn server_errors_propagate_without_retry() {
    let base = stub_server(vec![("500 Internal Server Error", "boom".to_string())]).await;
    let client = OpenAiCompatClient::new(base, "key", "test-model");

    let started = Instant::now();
    let err = client
        .complete(&CancellationToken::new(), &[Message::user("hi")], &[])
        .await
        .unwrap_err();
    assert!(matches!(err, ForgeError::Provider { status: 500, .. }));
    assert!(started.elapsed() < Duration::from_secs(1), "no backoff for 500s");
}

#[tokio::test]
async fn rate_limit_retry_honors_cancellation() {
    let base = stub_server(vec![("429 Too Many Requests", String::new())]).await;
    let client = OpenAiCompatClient::new(base, "key", "test-model");

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        });
    }

    let started = Instant::now();
    let err = client
        .complete(&cancel, &[Message::user("hi")], &[])
        .await
        .unwrap_err();
    // Cancelled during the first 2s backoff sleep, well before it elapses.
    assert!(matches!(err, ForgeError::Cancelled), "got {err:?}");
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn rate_limit_recovers_on_a_later_attempt() {
    let base = stub_server(vec![
        ("429 Too Many Requests", String::new()),
        ("200 OK", chat_body("finally")),
    ])
    .await;
    let client = OpenAiCompatClient::new(base, "key", "test-model");

    let resp = client
        .complete(&CancellationToken::new(), &[Message::user("hi")], &[])
        .await
        .unwrap();
    assert_eq!(resp.message.content, "finally");
}

#[tokio::test]
async fn streaming_forwards_deltas_and_assembles_tool_calls() {
    let body = concat!(
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"c1\",\"function\":{\"name\":\"shell_exec\",\"arguments\":\"{\\\"com\"}}]}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"mand\\\":\\\"ls\\\"}\"}}]}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"tool_calls\"}]}\n\n",
        "data: [DONE]\n\n",
    );
    let base = stub_server(vec![("200 OK", body.to_string())]).await;
    let client = OpenAiCompatClient::new(base, "key", "test-model");

    let deltas = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let deltas_for_sink = deltas.clone();
    let sink = move |delta: &str| deltas_for_sink.lock().unwrap().push(delta.to_string());

    let resp = client
        .complete_streaming(
            &CancellationToken::new(),
            &[Message::user("hi")],
            &[],
            Some(&sink),
        )
        .await
        .unwrap();

    assert_eq!(
        *deltas.lock().unwrap(),
        vec!["Hel".to_string(), "lo".to_string()]
    );
    assert_eq!(resp.message.content, "Hello");
    assert_eq!(resp.message.tool_calls.len(), 1);
    assert_eq!(resp.message.tool_calls[0].args["command"], "ls");
}

#[tokio::test]
async fn truncated_stream_fails() {
    // No [DONE], no finish_reason: the connection just closes.
    let body = "data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n\n";
    let base = stub_server(vec![("200 OK", body.to_string())]).await;
    let client = OpenAiCompatClient::new(base, "key", "test-model");

    let err = client
        .complete_streaming(&CancellationToken::new(), &[Message::user("hi")], &[], None)
        .await
        .unwrap_err();
    assert!(matches!(err, ForgeError::Stream(_)), "got {err:?}");
}

#[tokio::test]
async fn list_models_hits_the_native_tags_endpoint() {
    // The stub ignores the path, which is fine: we only check URL mapping
    // does not break the request and the payload parses.
    let body = r#"{"models":[{"name":"qwen3:14b","size":9000000000,"modified_at":"2025-06-01T00:00:00Z"}]}"#;
    let base = stub_server(vec![("200 OK", body.to_string())]).await;
    let client = OpenAiCompatClient::new(base, "key", "");

    let models = client.list_models(&CancellationToken::new()).await.unwrap();
    assert_eq!(models.len(), 1);
    assert_eq!(models[0].name, "qwen3:14b");
    assert_eq!(models[0].size, 9_000_000_000);
}
