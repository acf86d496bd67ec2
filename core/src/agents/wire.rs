//! Request building, reply extraction and stream framing per wire protocol.

use std::collections::VecDeque;
use std::fmt::Display;

use futures::stream::{self, BoxStream, Stream, StreamExt};
use log::Level;
use serde_json::{json, Map, Value};

use super::config::ProviderConfig;
use super::FragmentStream;
use crate::errors::NovelGenError;
use crate::logging::{log_event, preview};

pub const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const ANTHROPIC_DEFAULT_MAX_TOKENS: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// Chat completions with SSE `data:` framing. Lenient framing also takes
    /// bare JSON lines, which some self-hosted gateways emit.
    OpenAi { strict_prefix: bool },
    Anthropic,
    /// Newline-delimited JSON chat stream.
    Ollama,
    Gemini,
}

/// Outcome of decoding one line of a streamed body.
#[derive(Debug, Clone, PartialEq)]
pub enum LineEvent {
    Fragments(Vec<String>),
    /// Terminal record; any fragments it carries come first.
    Finished(Vec<String>),
    Skip,
    Malformed(String),
    /// The backend reported an error inside the stream.
    Failed(String),
}

fn str_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    path.iter()
        .try_fold(value, |node, key| node.get(*key))
        .and_then(Value::as_str)
}

fn first_choice(body: &Value) -> Option<&Value> {
    body.get("choices").and_then(|c| c.get(0))
}

fn user_message(prompt: &str) -> Value {
    json!([{ "role": "user", "content": prompt }])
}

fn gemini_text(body: &Value) -> Option<String> {
    let parts = body
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .as_array()?;
    Some(
        parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect(),
    )
}

fn error_message(body: &Value) -> Option<String> {
    let error = body.get("error").filter(|e| !e.is_null())?;
    let message = error
        .as_str()
        .or_else(|| error.get("message").and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string());
    Some(message)
}

impl WireFormat {
    pub fn url(&self, config: &ProviderConfig, stream: bool) -> String {
        match self {
            Self::Gemini => {
                let base = config.endpoint_url.trim_end_matches('/');
                if stream {
                    format!("{base}/models/{}:streamGenerateContent?alt=sse", config.model_name)
                } else {
                    format!("{base}/models/{}:generateContent", config.model_name)
                }
            }
            _ => config.endpoint_url.clone(),
        }
    }

    pub fn headers(&self, config: &ProviderConfig) -> Vec<(&'static str, String)> {
        let Some(key) = config.api_key.as_deref() else {
            return Vec::new();
        };
        match self {
            Self::OpenAi { .. } | Self::Ollama => vec![("authorization", format!("Bearer {key}"))],
            Self::Anthropic => vec![
                ("x-api-key", key.to_string()),
                ("anthropic-version", ANTHROPIC_VERSION.to_string()),
            ],
            Self::Gemini => vec![("x-goog-api-key", key.to_string())],
        }
    }

    pub fn body(&self, config: &ProviderConfig, prompt: &str, stream: bool) -> Value {
        let temperature = config.option_f64("temperature");
        let max_tokens = config.option_u64("max_tokens");
        let mut body = Map::new();
        match self {
            Self::OpenAi { .. } => {
                body.insert("model".into(), json!(config.model_name));
                body.insert("messages".into(), user_message(prompt));
                body.insert("stream".into(), json!(stream));
                if let Some(t) = temperature {
                    body.insert("temperature".into(), json!(t));
                }
                if let Some(m) = max_tokens {
                    body.insert("max_tokens".into(), json!(m));
                }
            }
            Self::Anthropic => {
                body.insert("model".into(), json!(config.model_name));
                body.insert("messages".into(), user_message(prompt));
                body.insert("stream".into(), json!(stream));
                body.insert(
                    "max_tokens".into(),
                    json!(max_tokens.unwrap_or(ANTHROPIC_DEFAULT_MAX_TOKENS)),
                );
                if let Some(t) = temperature {
                    body.insert("temperature".into(), json!(t));
                }
            }
            Self::Ollama => {
                body.insert("model".into(), json!(config.model_name));
                body.insert("messages".into(), user_message(prompt));
                body.insert("stream".into(), json!(stream));
                if let Some(t) = temperature {
                    body.insert("options".into(), json!({ "temperature": t }));
                }
            }
            Self::Gemini => {
                body.insert(
                    "contents".into(),
                    json!([{ "role": "user", "parts": [{ "text": prompt }] }]),
                );
                let mut generation = Map::new();
                if let Some(t) = temperature {
                    generation.insert("temperature".into(), json!(t));
                }
                if let Some(m) = max_tokens {
                    generation.insert("maxOutputTokens".into(), json!(m));
                }
                if !generation.is_empty() {
                    body.insert("generationConfig".into(), Value::Object(generation));
                }
            }
        }
        Value::Object(body)
    }

    /// Generated text of a non-streaming reply.
    pub fn extract_text(&self, body: &Value) -> Option<String> {
        match self {
            Self::OpenAi { .. } => {
                let choice = first_choice(body)?;
                str_at(choice, &["message", "content"])
                    .or_else(|| str_at(choice, &["text"]))
                    .map(str::to_string)
            }
            Self::Anthropic => body
                .get("content")?
                .as_array()?
                .iter()
                .find_map(|block| block.get("text").and_then(Value::as_str))
                .map(str::to_string),
            Self::Ollama => str_at(body, &["message", "content"]).map(str::to_string),
            Self::Gemini => gemini_text(body),
        }
    }

    pub fn decode_line(&self, line: &str, include_reasoning: bool) -> LineEvent {
        let line = line.trim();
        if line.is_empty() || line.starts_with(':') {
            return LineEvent::Skip;
        }
        let payload = match (self, line.strip_prefix("data:")) {
            (_, Some(rest)) => rest.trim_start(),
            (Self::Ollama, None) => line,
            (Self::OpenAi { strict_prefix: false }, None) if !line.starts_with("event:") => line,
            _ => return LineEvent::Skip,
        };
        if matches!(self, Self::OpenAi { .. }) && payload == "[DONE]" {
            return LineEvent::Finished(Vec::new());
        }
        let record: Value = match serde_json::from_str(payload) {
            Ok(record) => record,
            Err(err) => return LineEvent::Malformed(err.to_string()),
        };
        if let Some(message) = error_message(&record) {
            return LineEvent::Failed(message);
        }

        match self {
            Self::OpenAi { .. } => {
                let Some(choice) = first_choice(&record) else {
                    return LineEvent::Skip;
                };
                let mut out = Vec::new();
                if include_reasoning {
                    if let Some(trace) = str_at(choice, &["delta", "reasoning_content"]) {
                        out.push(trace.to_string());
                    }
                }
                if let Some(text) = str_at(choice, &["delta", "content"]).or_else(|| str_at(choice, &["text"])) {
                    out.push(text.to_string());
                }
                LineEvent::Fragments(out)
            }
            Self::Anthropic => match str_at(&record, &["type"]) {
                Some("message_stop") => LineEvent::Finished(Vec::new()),
                Some("content_block_delta")
                    if str_at(&record, &["delta", "type"]) == Some("text_delta") =>
                {
                    let text = str_at(&record, &["delta", "text"]).unwrap_or_default();
                    LineEvent::Fragments(vec![text.to_string()])
                }
                _ => LineEvent::Skip,
            },
            Self::Ollama => {
                let text = str_at(&record, &["message", "content"])
                    .map(|t| vec![t.to_string()])
                    .unwrap_or_default();
                if record.get("done").and_then(Value::as_bool).unwrap_or(false) {
                    LineEvent::Finished(text)
                } else {
                    LineEvent::Fragments(text)
                }
            }
            Self::Gemini => LineEvent::Fragments(gemini_text(&record).into_iter().collect()),
        }
    }
}

/// Splits a byte stream into lines without assuming chunk boundaries align
/// with line or UTF-8 boundaries.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line).trim_end().to_string());
        }
        lines
    }

    /// Whatever trailed the last newline.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        Some(String::from_utf8_lossy(&rest).trim_end().to_string())
    }
}

/// Incremental line decoder behind [`decode_stream`].
#[derive(Debug)]
struct StreamDecoder {
    provider: String,
    wire: WireFormat,
    include_reasoning: bool,
    lines: LineBuffer,
    pending: VecDeque<Result<String, NovelGenError>>,
    finished: bool,
}

impl StreamDecoder {
    fn new(provider: &str, wire: WireFormat, include_reasoning: bool) -> Self {
        Self {
            provider: provider.to_string(),
            wire,
            include_reasoning,
            lines: LineBuffer::default(),
            pending: VecDeque::new(),
            finished: false,
        }
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn feed(&mut self, chunk: &[u8]) {
        for line in self.lines.push(chunk) {
            self.absorb(&line);
        }
    }

    /// The body ended; decode any unterminated last line.
    fn close(&mut self) {
        if let Some(line) = self.lines.finish() {
            self.absorb(&line);
        }
        self.finished = true;
    }

    fn fail(&mut self, err: NovelGenError) {
        if !self.finished {
            self.pending.push_back(Err(err));
        }
        self.finished = true;
    }

    fn next_item(&mut self) -> Option<Result<String, NovelGenError>> {
        self.pending.pop_front()
    }

    fn absorb(&mut self, line: &str) {
        if self.finished {
            return;
        }
        match self.wire.decode_line(line, self.include_reasoning) {
            LineEvent::Fragments(parts) => self.queue(parts),
            LineEvent::Finished(parts) => {
                self.queue(parts);
                self.finished = true;
            }
            LineEvent::Skip => {}
            LineEvent::Malformed(reason) => log_event(
                Level::Warn,
                Some("AI-2002"),
                "novelgen::ai",
                "skipping malformed stream record",
                None,
                Some(json!({
                    "provider": self.provider,
                    "reason": reason,
                    "line": preview(line, 200),
                })),
            ),
            LineEvent::Failed(message) => {
                let err = NovelGenError::provider(&self.provider, None, message);
                self.fail(err);
            }
        }
    }

    fn queue(&mut self, parts: Vec<String>) {
        self.pending
            .extend(parts.into_iter().filter(|p| !p.is_empty()).map(Ok));
    }
}

struct Pump {
    decoder: StreamDecoder,
    bytes: BoxStream<'static, Result<Vec<u8>, String>>,
    emitted: bool,
}

/// Turn a streamed response body into ordered text fragments.
///
/// Reading stops at the terminal record; a transport error becomes the last
/// item. Dropping the returned stream drops the body.
pub fn decode_stream<S, B, E>(
    provider: &str,
    wire: WireFormat,
    include_reasoning: bool,
    bytes: S,
) -> FragmentStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let bytes = bytes
        .map(|chunk| chunk.map(|b| b.as_ref().to_vec()).map_err(|e| e.to_string()))
        .boxed();
    let pump = Pump {
        decoder: StreamDecoder::new(provider, wire, include_reasoning),
        bytes,
        emitted: false,
    };
    stream::unfold(pump, |mut pump| async move {
        loop {
            if let Some(item) = pump.decoder.next_item() {
                if pump.emitted {
                    tokio::task::yield_now().await;
                }
                pump.emitted = true;
                return Some((item, pump));
            }
            if pump.decoder.is_finished() {
                return None;
            }
            match pump.bytes.next().await {
                Some(Ok(chunk)) => pump.decoder.feed(&chunk),
                Some(Err(message)) => {
                    let err = NovelGenError::provider(&pump.decoder.provider, None, message);
                    pump.decoder.fail(err);
                }
                None => pump.decoder.close(),
            }
        }
    })
    .boxed()
}
