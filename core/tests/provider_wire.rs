use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use novelgen_core::agents::build_adapter;
use novelgen_core::{
    ChapterOutline, ConfigResolver, FragmentObserver, FragmentStream, InstanceConfig, ModelManager,
    NovelData, NovelGenError, Volume,
};
use serde_json::{json, Map};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::timeout;

enum Reply {
    Whole { status: &'static str, content_type: &'static str, body: String },
    Chunked { content_type: &'static str, parts: Vec<String> },
}

/// Accept one connection, answer it with `reply`, and hand back the raw request.
async fn serve_once(reply: Reply) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let request = read_request(&mut socket).await;
        match reply {
            Reply::Whole { status, content_type, body } => {
                let head = format!(
                    "HTTP/1.1 {status}\r\ncontent-type: {content_type}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                    body.len()
                );
                socket.write_all(head.as_bytes()).await.unwrap();
                socket.write_all(body.as_bytes()).await.unwrap();
            }
            Reply::Chunked { content_type, parts } => {
                let head = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: {content_type}\r\ntransfer-encoding: chunked\r\nconnection: close\r\n\r\n"
                );
                socket.write_all(head.as_bytes()).await.unwrap();
                for part in parts {
                    let chunk = format!("{:x}\r\n{part}\r\n", part.len());
                    socket.write_all(chunk.as_bytes()).await.unwrap();
                    socket.flush().await.unwrap();
                }
                socket.write_all(b"0\r\n\r\n").await.unwrap();
            }
        }
        socket.shutdown().await.ok();
        request
    });
    (format!("http://{addr}"), handle)
}

async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
    let mut raw = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = socket.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        raw.extend_from_slice(&buf[..n]);
        let text = String::from_utf8_lossy(&raw).to_string();
        if let Some(end) = text.find("\r\n\r\n") {
            let length = text[..end]
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            if raw.len() >= end + 4 + length {
                break;
            }
        }
    }
    String::from_utf8_lossy(&raw).to_string()
}

/// Answer with `first` as the only chunk of an open-ended body, then report
/// whether the client closed the connection within five seconds.
async fn serve_then_stall(first: String) -> (String, JoinHandle<bool>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_request(&mut socket).await;
        let head = "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\n\r\n";
        socket.write_all(head.as_bytes()).await.unwrap();
        let chunk = format!("{:x}\r\n{first}\r\n", first.len());
        socket.write_all(chunk.as_bytes()).await.unwrap();
        socket.flush().await.unwrap();
        let mut buf = [0u8; 64];
        matches!(
            timeout(Duration::from_secs(5), socket.read(&mut buf)).await,
            Ok(Ok(0)) | Ok(Err(_))
        )
    });
    (format!("http://{addr}"), handle)
}

fn sse(records: &[serde_json::Value]) -> Vec<String> {
    records.iter().map(|r| format!("data: {r}\n\n")).collect()
}

fn openai_delta(text: &str) -> serde_json::Value {
    json!({"choices": [{"delta": {"content": text}}]})
}

async fn texts(stream: FragmentStream) -> Vec<String> {
    stream.map(|item| item.unwrap()).collect().await
}

fn instance(endpoint: String) -> InstanceConfig {
    InstanceConfig::new().api_key("test-key").endpoint(endpoint)
}

#[tokio::test]
async fn openai_stream_yields_fragments_in_wire_order() {
    let mut parts = sse(&[openai_delta("a"), openai_delta("b")]);
    // split one record across two chunks
    let last = format!("data: {}\n\ndata: [DONE]\n\n", openai_delta("c"));
    let (head, tail) = last.split_at(10);
    parts.push(head.to_string());
    parts.push(tail.to_string());
    let (base, server) = serve_once(Reply::Chunked { content_type: "text/event-stream", parts }).await;

    let adapter = build_adapter(
        "gpt",
        &instance(format!("{base}/v1/chat/completions")),
        &ConfigResolver::new(),
    )
    .unwrap();
    let fragments = texts(adapter.generate_stream("写第一章").await.unwrap()).await;
    assert_eq!(fragments, ["a", "b", "c"]);

    let request = server.await.unwrap().to_lowercase();
    assert!(request.starts_with("post /v1/chat/completions"));
    assert!(request.contains("bearer test-key"));
    assert!(request.contains("\"stream\":true"));
}

#[tokio::test]
async fn openai_generate_returns_message_content() {
    let body = json!({"choices": [{"message": {"role": "assistant", "content": "完整章节"}}]}).to_string();
    let (base, _server) = serve_once(Reply::Whole { status: "200 OK", content_type: "application/json", body }).await;
    let adapter = build_adapter(
        "siliconflow",
        &instance(format!("{base}/v1/chat/completions")),
        &ConfigResolver::new(),
    )
    .unwrap();
    assert_eq!(adapter.generate("hi").await.unwrap(), "完整章节");
}

#[tokio::test]
async fn error_status_becomes_provider_error_with_body() {
    let (base, _server) = serve_once(Reply::Whole {
        status: "401 Unauthorized",
        content_type: "application/json",
        body: r#"{"error": {"message": "invalid key"}}"#.into(),
    })
    .await;
    let adapter = build_adapter("gpt", &instance(base), &ConfigResolver::new()).unwrap();
    match adapter.generate("hi").await {
        Err(NovelGenError::Provider { provider, status, body }) => {
            assert_eq!(provider, "gpt");
            assert_eq!(status, Some(401));
            assert!(body.contains("invalid key"));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[tokio::test]
async fn unexpected_success_body_is_a_provider_error() {
    let (base, _server) = serve_once(Reply::Whole {
        status: "200 OK",
        content_type: "application/json",
        body: r#"{"id": "x"}"#.into(),
    })
    .await;
    let adapter = build_adapter("claude", &instance(base), &ConfigResolver::new()).unwrap();
    assert!(matches!(
        adapter.generate("hi").await,
        Err(NovelGenError::Provider { status: Some(200), .. })
    ));
}

#[tokio::test]
async fn anthropic_stream_and_headers() {
    let mut parts = vec!["event: message_start\ndata: {\"type\":\"message_start\"}\n\n".to_string()];
    for text in ["a", "b", "c"] {
        parts.push(format!(
            "event: content_block_delta\ndata: {}\n\n",
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": text}})
        ));
    }
    parts.push("event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n".into());
    let (base, server) = serve_once(Reply::Chunked { content_type: "text/event-stream", parts }).await;

    let adapter = build_adapter(
        "claude",
        &instance(format!("{base}/v1/messages")),
        &ConfigResolver::new(),
    )
    .unwrap();
    assert_eq!(texts(adapter.generate_stream("hi").await.unwrap()).await, ["a", "b", "c"]);

    let request = server.await.unwrap().to_lowercase();
    assert!(request.contains("x-api-key: test-key"));
    assert!(request.contains("anthropic-version: 2023-06-01"));
    assert!(request.contains("\"max_tokens\":4096"));
}

#[tokio::test]
async fn ollama_ndjson_stream_without_key() {
    let parts = vec![
        "{\"message\":{\"role\":\"assistant\",\"content\":\"a\"},\"done\":false}\n".to_string(),
        "{\"message\":{\"role\":\"assistant\",\"content\":\"b\"},\"done\":false}\n{\"message\":{\"role\":\"assistant\",\"content\":\"c\"},\"done\":false}\n".to_string(),
        "{\"message\":{\"role\":\"assistant\",\"content\":\"\"},\"done\":true}\n".to_string(),
    ];
    let (base, server) = serve_once(Reply::Chunked { content_type: "application/x-ndjson", parts }).await;
    let adapter = build_adapter(
        "ollama",
        &InstanceConfig::new().endpoint(format!("{base}/api/chat")),
        &ConfigResolver::new(),
    )
    .unwrap();
    assert_eq!(texts(adapter.generate_stream("hi").await.unwrap()).await, ["a", "b", "c"]);
    let request = server.await.unwrap().to_lowercase();
    assert!(!request.contains("authorization"));
    assert!(request.contains("\"model\":\"llama3\""));
}

async fn modelscope_fragments(instance: InstanceConfig) -> Vec<String> {
    let records = [
        json!({"choices": [{"delta": {"reasoning_content": "思考"}}]}),
        json!({"choices": [{"delta": {"content": "答案"}}]}),
    ];
    let mut parts = sse(&records);
    parts.push("data: [DONE]\n\n".into());
    let (base, _server) = serve_once(Reply::Chunked { content_type: "text/event-stream", parts }).await;
    let adapter = build_adapter("modelscope", &instance.endpoint(base), &ConfigResolver::new()).unwrap();
    assert!(adapter.supports_reasoning_trace());
    texts(adapter.generate_stream("hi").await.unwrap()).await
}

#[tokio::test]
async fn modelscope_reasoning_trace_precedes_content_unless_disabled() {
    let key = || InstanceConfig::new().api_key("test-key");
    assert_eq!(modelscope_fragments(key()).await, ["思考", "答案"]);
    assert_eq!(
        modelscope_fragments(key().option("include_reasoning", false)).await,
        ["答案"]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn gemini_generate_runs_on_the_blocking_bridge() {
    let body = json!({"candidates": [{"content": {"parts": [{"text": "甲"}, {"text": "乙"}]}}]}).to_string();
    let (base, server) = serve_once(Reply::Whole { status: "200 OK", content_type: "application/json", body }).await;
    let adapter = build_adapter("gemini", &instance(format!("{base}/v1beta")), &ConfigResolver::new()).unwrap();
    assert_eq!(adapter.generate("hi").await.unwrap(), "甲乙");

    let request = server.await.unwrap().to_lowercase();
    assert!(request.starts_with("post /v1beta/models/gemini-1.5-flash:generatecontent"));
    assert!(request.contains("x-goog-api-key: test-key"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn gemini_stream_yields_fragments_in_order() {
    let records: Vec<_> = ["a", "b", "c"]
        .iter()
        .map(|t| json!({"candidates": [{"content": {"parts": [{"text": t}]}}]}))
        .collect();
    let (base, server) = serve_once(Reply::Chunked { content_type: "text/event-stream", parts: sse(&records) }).await;
    let adapter = build_adapter("gemini", &instance(base), &ConfigResolver::new()).unwrap();
    assert_eq!(texts(adapter.generate_stream("hi").await.unwrap()).await, ["a", "b", "c"]);
    assert!(server.await.unwrap().contains(":streamGenerateContent?alt=sse"));
}

async fn assert_drop_closes_connection(provider: &str, record: serde_json::Value) {
    let (base, server) = serve_then_stall(format!("data: {record}\n\n")).await;
    let adapter = build_adapter(provider, &instance(base), &ConfigResolver::new()).unwrap();
    let mut stream = adapter.generate_stream("hi").await.unwrap();
    assert_eq!(stream.next().await.unwrap().unwrap(), "a");
    drop(stream);
    assert!(server.await.unwrap(), "{provider} kept the connection open after the stream was dropped");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropping_a_gemini_stream_closes_the_connection() {
    assert_drop_closes_connection(
        "gemini",
        json!({"candidates": [{"content": {"parts": [{"text": "a"}]}}]}),
    )
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropping_an_openai_stream_closes_the_connection() {
    assert_drop_closes_connection("gpt", openai_delta("a")).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn gemini_stream_error_status_fails_before_streaming() {
    let (base, _server) = serve_once(Reply::Whole {
        status: "403 Forbidden",
        content_type: "application/json",
        body: r#"{"error": {"message": "API key not valid"}}"#.into(),
    })
    .await;
    let adapter = build_adapter("gemini", &instance(base), &ConfigResolver::new()).unwrap();
    assert!(matches!(
        adapter.generate_stream("hi").await,
        Err(NovelGenError::Provider { status: Some(403), .. })
    ));
}

#[tokio::test]
async fn manager_streams_a_chapter_end_to_end() {
    let mut parts = sse(&[openai_delta("第一段"), openai_delta("第二段")]);
    parts.push("data: [DONE]\n\n".into());
    let (base, server) = serve_once(Reply::Chunked { content_type: "text/event-stream", parts }).await;

    let endpoint = format!("{base}/v1/chat/completions");
    let mut manager = ModelManager::new(ConfigResolver::new().shared());
    manager
        .select_model("siliconflow", Some("test-key"), Some(endpoint.as_str()), Map::new())
        .unwrap();

    let novel = NovelData {
        title: "长夜行".into(),
        volumes: vec![Volume {
            title: "第一卷".into(),
            chapters: vec![ChapterOutline {
                title: "第一章".into(),
                summary: "主角出发".into(),
                ..Default::default()
            }],
            ..Default::default()
        }],
        ..Default::default()
    };
    let seen = Arc::new(Mutex::new(String::new()));
    let sink = seen.clone();
    let observer: FragmentObserver = Box::new(move |text: &str| sink.lock().unwrap().push_str(text));
    let stream = manager
        .generate_chapter_stream(&novel, 0, 0, Some(observer))
        .await
        .unwrap();
    let body: String = texts(stream).await.concat();
    assert_eq!(body, "第一段第二段");
    assert_eq!(*seen.lock().unwrap(), body);

    let request = server.await.unwrap();
    assert!(request.contains("主角出发"));
}
