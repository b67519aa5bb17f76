//! OpenAI-compatible chat-completions backend.
//!
//! Works against any server exposing `POST {url}/chat/completions`
//! (OpenAI, vLLM, Ollama's `/v1`, LocalAI). Streamed responses are parsed
//! from server-sent events: each `data:` line carries a JSON chunk whose
//! `choices[0].delta.content` is the next piece of text, and `data: [DONE]`
//! ends the stream.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

use campus_chat_core::generation::{GenerationRequest, Generator, TokenStream};
use campus_chat_core::retry::RetryPolicy;

use crate::config::GenerationConfig;
use crate::upstream::{status_error, with_retry, with_timeout};

/// Build the generator selected by `config.provider`.
pub fn create_generator(config: &GenerationConfig) -> Result<Arc<dyn Generator>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledGenerator)),
        "openai" => Ok(Arc::new(OpenAiGenerator::new(config)?)),
        other => bail!("Unknown generation provider: {}", other),
    }
}

pub struct DisabledGenerator;

#[async_trait]
impl Generator for DisabledGenerator {
    fn model_name(&self) -> &str {
        "disabled"
    }
    async fn complete(&self, _request: &GenerationRequest) -> Result<String> {
        bail!("Generation provider is disabled")
    }
    async fn complete_stream(&self, _request: &GenerationRequest) -> Result<TokenStream> {
        bail!("Generation provider is disabled")
    }
}

pub struct OpenAiGenerator {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<String>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    timeout: Duration,
    retry: RetryPolicy,
}

impl OpenAiGenerator {
    /// A missing API key variable is allowed; local servers rarely need one.
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("generation.model required for OpenAI provider"))?;
        let api_key = std::env::var(&config.api_key_env).ok();
        if api_key.is_none() {
            tracing::warn!(
                env = %config.api_key_env,
                "generation API key not set; sending unauthenticated requests"
            );
        }

        Ok(Self {
            client: reqwest::Client::builder().build()?,
            url: config.url.trim_end_matches('/').to_string(),
            model,
            api_key,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            timeout: Duration::from_secs(config.timeout_secs),
            retry: config.retry_policy(),
        })
    }

    fn body(&self, request: &GenerationRequest, stream: bool) -> CompletionBody {
        CompletionBody {
            model: self.model.clone(),
            messages: request
                .to_messages()
                .into_iter()
                .map(|m| WireMessage {
                    role: m.role.as_str().to_string(),
                    content: m.content,
                })
                .collect(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream,
        }
    }

    async fn send(&self, body: &CompletionBody) -> Result<reqwest::Response> {
        let mut http = self
            .client
            .post(format!("{}/chat/completions", self.url))
            .json(body);
        if let Some(key) = &self.api_key {
            http = http.bearer_auth(key);
        }
        let response = http.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error("Chat completions", status, &text));
        }
        Ok(response)
    }
}

#[derive(Debug, Serialize)]
struct CompletionBody {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[async_trait]
impl Generator for OpenAiGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &GenerationRequest) -> Result<String> {
        let body = self.body(request, false);
        with_retry("chat completion", self.retry, || async {
            with_timeout("chat completion", self.timeout, async {
                let response = self.send(&body).await?;
                let parsed: CompletionResponse = response
                    .json()
                    .await
                    .map_err(|e| anyhow!("malformed completion response: {}", e))?;
                parsed
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.message.content)
                    .ok_or_else(|| anyhow!("completion response had no content"))
            })
            .await
        })
        .await
    }

    async fn complete_stream(&self, request: &GenerationRequest) -> Result<TokenStream> {
        let body = self.body(request, true);
        // Retries only cover opening the stream; a stream that fails midway
        // is reported, never replayed.
        let response = with_retry("chat completion stream", self.retry, || {
            with_timeout("chat completion stream", self.timeout, self.send(&body))
        })
        .await?;

        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()))
            .boxed();
        Ok(sse_token_stream(bytes, self.timeout))
    }
}

/// One decoded server-sent event from a completions stream.
#[derive(Debug, PartialEq)]
enum SseEvent {
    Delta(String),
    Done,
}

/// Incremental decoder for `data:` lines. Bytes may split lines (and
/// UTF-8 sequences) anywhere, so complete lines are decoded only once
/// their trailing newline arrives.
#[derive(Default)]
struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, bytes: &[u8]) -> Result<Vec<SseEvent>> {
        self.buf.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(event) = decode_line(line.trim_end_matches(['\r', '\n']))? {
                let done = event == SseEvent::Done;
                events.push(event);
                if done {
                    break;
                }
            }
        }
        Ok(events)
    }

    /// Decode a final line left without its trailing newline.
    fn finish(&mut self) -> Result<Option<SseEvent>> {
        let rest = std::mem::take(&mut self.buf);
        decode_line(String::from_utf8_lossy(&rest).trim_end_matches('\r'))
    }
}

fn decode_line(line: &str) -> Result<Option<SseEvent>> {
    let Some(payload) = line.strip_prefix("data:") else {
        // Comments, `event:` and `id:` lines carry no text.
        return Ok(None);
    };
    let payload = payload.trim();
    if payload.is_empty() {
        return Ok(None);
    }
    if payload == "[DONE]" {
        return Ok(Some(SseEvent::Done));
    }

    let json: serde_json::Value = serde_json::from_str(payload)
        .map_err(|e| anyhow!("malformed stream chunk: {}", e))?;
    if let Some(err) = json.get("error") {
        bail!("provider error in stream: {}", err);
    }
    let delta = json
        .pointer("/choices/0/delta/content")
        .and_then(|c| c.as_str())
        .unwrap_or_default();
    if delta.is_empty() {
        Ok(None)
    } else {
        Ok(Some(SseEvent::Delta(delta.to_string())))
    }
}

struct StreamState {
    body: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    decoder: SseDecoder,
    pending: VecDeque<Result<String>>,
    saw_done: bool,
    finished: bool,
    chunk_timeout: Duration,
}

impl StreamState {
    fn record(&mut self, event: SseEvent) {
        match event {
            SseEvent::Delta(text) => self.pending.push_back(Ok(text)),
            SseEvent::Done => {
                self.saw_done = true;
                self.finished = true;
            }
        }
    }
}

/// Turn a raw SSE byte stream into text deltas. `chunk_timeout` bounds the
/// wait for each network read. A body that closes before `[DONE]` ends the
/// stream with an error, since the answer may be cut short.
fn sse_token_stream(
    body: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    chunk_timeout: Duration,
) -> TokenStream {
    let state = StreamState {
        body,
        decoder: SseDecoder::default(),
        pending: VecDeque::new(),
        saw_done: false,
        finished: false,
        chunk_timeout,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }

            match tokio::time::timeout(state.chunk_timeout, state.body.next()).await {
                Err(_) => {
                    state.finished = true;
                    let secs = state.chunk_timeout.as_secs();
                    return Some((Err(anyhow!("stream stalled for {}s", secs)), state));
                }
                Ok(None) => {
                    match state.decoder.finish() {
                        Ok(Some(event)) => state.record(event),
                        Ok(None) => {}
                        Err(e) => state.pending.push_back(Err(e)),
                    }
                    if !state.saw_done {
                        state.pending.push_back(Err(anyhow!("stream ended before [DONE]")));
                    }
                    state.finished = true;
                }
                Ok(Some(Err(e))) => {
                    state.finished = true;
                    return Some((Err(anyhow!("stream read failed: {}", e)), state));
                }
                Ok(Some(Ok(bytes))) => match state.decoder.push(&bytes) {
                    Ok(events) => {
                        for event in events {
                            state.record(event);
                        }
                    }
                    Err(e) => {
                        state.finished = true;
                        state.pending.clear();
                        return Some((Err(e), state));
                    }
                },
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(text: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({"choices": [{"delta": {"content": text}}]})
        )
    }

    #[test]
    fn test_decoder_handles_split_lines() {
        let mut decoder = SseDecoder::default();
        let frame = chunk("Hel");
        let (a, b) = frame.split_at(10);
        assert!(decoder.push(a.as_bytes()).unwrap().is_empty());
        assert_eq!(
            decoder.push(b.as_bytes()).unwrap(),
            vec![SseEvent::Delta("Hel".into())]
        );
    }

    #[test]
    fn test_decoder_done_and_noise() {
        let mut decoder = SseDecoder::default();
        let input = format!(": keep-alive\n\n{}data: [DONE]\n\n", chunk("lo"));
        assert_eq!(
            decoder.push(input.as_bytes()).unwrap(),
            vec![SseEvent::Delta("lo".into()), SseEvent::Done]
        );
    }

    #[test]
    fn test_role_only_chunk_is_skipped() {
        let line = r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert_eq!(decode_line(line).unwrap(), None);
    }

    #[test]
    fn test_malformed_chunk_is_error() {
        assert!(decode_line("data: {not json").is_err());
    }

    #[tokio::test]
    async fn test_token_stream_in_order() {
        let frames: Vec<reqwest::Result<Vec<u8>>> = vec![
            Ok(chunk("The ").into_bytes()),
            Ok(format!("{}{}", chunk("water "), chunk("cycle")).into_bytes()),
            Ok(b"data: [DONE]\n\n".to_vec()),
        ];
        let tokens: Vec<String> =
            sse_token_stream(stream::iter(frames).boxed(), Duration::from_secs(5))
                .map(|t| t.unwrap())
                .collect()
                .await;
        assert_eq!(tokens, vec!["The ", "water ", "cycle"]);
    }

    #[tokio::test]
    async fn test_body_closed_before_done_is_error() {
        let frames: Vec<reqwest::Result<Vec<u8>>> = vec![Ok(chunk("Hal").into_bytes())];
        let items: Vec<Result<String>> =
            sse_token_stream(stream::iter(frames).boxed(), Duration::from_secs(5))
                .collect()
                .await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "Hal");
        let err = items[1].as_ref().unwrap_err().to_string();
        assert!(err.contains("[DONE]"), "{}", err);
    }

    #[tokio::test]
    async fn test_done_without_trailing_newline() {
        let frames: Vec<reqwest::Result<Vec<u8>>> = vec![
            Ok(chunk("Hi").into_bytes()),
            Ok(b"data: [DONE]".to_vec()),
        ];
        let tokens: Vec<String> =
            sse_token_stream(stream::iter(frames).boxed(), Duration::from_secs(5))
                .map(|t| t.unwrap())
                .collect()
                .await;
        assert_eq!(tokens, vec!["Hi"]);
    }

    #[tokio::test]
    async fn test_stalled_stream_times_out() {
        let body = stream::pending::<reqwest::Result<Vec<u8>>>().boxed();
        let mut tokens = sse_token_stream(body, Duration::from_millis(20));
        let first = tokens.next().await.unwrap();
        assert!(first.unwrap_err().to_string().contains("stalled"));
        assert!(tokens.next().await.is_none());
    }

    #[test]
    fn test_body_serializes_prompt() {
        let config = GenerationConfig {
            provider: "openai".into(),
            model: Some("gpt-4o-mini".into()),
            api_key_env: "CAMPUS_TEST_UNSET_KEY".into(),
            ..Default::default()
        };
        let generator = OpenAiGenerator::new(&config).unwrap();
        let request = GenerationRequest {
            system_prompt: "Be kind.".into(),
            message: "Why is the sky blue?".into(),
            ..Default::default()
        };
        let body = serde_json::to_value(generator.body(&request, true)).unwrap();
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "Why is the sky blue?");
        assert!(body.get("temperature").is_none());
    }
}
