//! Chat orchestration.
//!
//! [`ChatService`] drives one request through the pipeline:
//!
//! ```text
//! Received → Authenticated → RateChecked → Sanitized → [Retrieved] → Generated → Logged → Responded
//! ```
//!
//! Any stage may end the request with a [`PipelineError`]. Presence and
//! length checks run before authentication so malformed requests never
//! reach a backend. After a successful generation the user turn and the
//! assistant turn are appended as two independent writes; a failed write
//! is logged and does not fail the response.
//!
//! Streamed responses are pumped by a spawned task into a bounded channel.
//! The [`ChatStream`] handed to the HTTP layer owns a cancellation drop
//! guard: when the client goes away the stream is dropped, the token
//! fires, and the pump stops reading from the generator without
//! persisting anything.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::Instrument;

use campus_chat_core::error::{PipelineError, PipelineResult};
use campus_chat_core::generation::{history_from_log, ContextPassage, GenerationRequest, Generator};
use campus_chat_core::identity::AccessGate;
use campus_chat_core::models::{ChatMessage, ChatRequest, MessageRole};
use campus_chat_core::rate_limit::RateLimiter;
use campus_chat_core::sanitize::{sanitize, sanitize_value};
use campus_chat_core::search::RetrievalParams;
use campus_chat_core::store::{ChatLog, StudentStore};

use crate::config::{Config, EmbeddingFailurePolicy};
use crate::retrieve::HybridRetriever;

/// Raw chat request body. Fields stay untyped JSON until validation so a
/// wrong type is reported as a validation error rather than a parse error.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatInput {
    #[serde(default)]
    pub message: Option<serde_json::Value>,
    #[serde(default)]
    pub student_id: Option<serde_json::Value>,
    #[serde(default)]
    pub activity_id: Option<serde_json::Value>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub use_rag: bool,
}

/// One event of a streamed reply.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Delta(String),
    Done,
    Error { code: &'static str, message: String },
}

#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub system_prompt: String,
    pub max_message_chars: usize,
    pub history_turns: usize,
    pub stream_buffer: usize,
    pub retrieval: RetrievalParams,
    pub on_embedding_failure: EmbeddingFailurePolicy,
}

impl ChatSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            system_prompt: config.chat.system_prompt.clone(),
            max_message_chars: config.chat.max_message_chars,
            history_turns: config.chat.history_turns,
            stream_buffer: config.chat.stream_buffer,
            retrieval: config.retrieval.params(),
            on_embedding_failure: config.retrieval.on_embedding_failure,
        }
    }
}

pub struct ChatService {
    gate: Arc<AccessGate>,
    limiter: Arc<dyn RateLimiter>,
    students: Arc<dyn StudentStore>,
    log: Arc<dyn ChatLog>,
    retriever: Arc<HybridRetriever>,
    generator: Arc<dyn Generator>,
    settings: ChatSettings,
}

/// A request that passed every pre-generation stage.
struct Prepared {
    request: ChatRequest,
    generation: GenerationRequest,
}

impl ChatService {
    pub fn new(
        gate: Arc<AccessGate>,
        limiter: Arc<dyn RateLimiter>,
        students: Arc<dyn StudentStore>,
        log: Arc<dyn ChatLog>,
        retriever: Arc<HybridRetriever>,
        generator: Arc<dyn Generator>,
        settings: ChatSettings,
    ) -> Self {
        Self {
            gate,
            limiter,
            students,
            log,
            retriever,
            generator,
            settings,
        }
    }

    /// Run a chat exchange and return the full assistant reply.
    pub async fn chat(&self, credential: Option<&str>, input: ChatInput) -> PipelineResult<String> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!("chat", request_id = %request_id, mode = "batch");
        async move {
            let prepared = self.prepare(credential, input, false).await?;

            let reply = self
                .generator
                .complete(&prepared.generation)
                .await
                .map_err(|e| {
                    tracing::error!(error = %e, stage = "generate", "generation failed");
                    PipelineError::upstream(e)
                })?;
            tracing::debug!(stage = "generated", chars = reply.len());

            persist_exchange(self.log.as_ref(), &prepared.request, &reply).await;
            tracing::info!(student_id = %prepared.request.student_id, "chat answered");
            Ok(reply)
        }
        .instrument(span)
        .await
    }

    /// Run a chat exchange as a stream of [`StreamEvent`]s.
    ///
    /// Failures before the first token (validation, auth, rate limit,
    /// unknown student, the generator refusing the request) are returned
    /// as `Err` so the caller can answer with a status code.
    pub async fn chat_stream(
        &self,
        credential: Option<&str>,
        input: ChatInput,
    ) -> PipelineResult<ChatStream> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!("chat", request_id = %request_id, mode = "stream");

        let (prepared, tokens) = async {
            let prepared = self.prepare(credential, input, true).await?;
            let tokens = self
                .generator
                .complete_stream(&prepared.generation)
                .await
                .map_err(|e| {
                    tracing::error!(error = %e, stage = "generate", "failed to open generation stream");
                    PipelineError::upstream(e)
                })?;
            Ok::<_, PipelineError>((prepared, tokens))
        }
        .instrument(span.clone())
        .await?;

        let (tx, rx) = mpsc::channel(self.settings.stream_buffer);
        let token = CancellationToken::new();
        let guard = token.clone().drop_guard();
        let log = self.log.clone();

        tokio::spawn(
            pump(tokens, tx, token, log, prepared.request).instrument(span),
        );

        Ok(ChatStream {
            events: ReceiverStream::new(rx),
            _guard: guard,
        })
    }

    async fn prepare(
        &self,
        credential: Option<&str>,
        input: ChatInput,
        streaming: bool,
    ) -> PipelineResult<Prepared> {
        tracing::debug!(stage = "received");

        let raw_message = non_blank(input.message.as_ref())
            .ok_or_else(|| PipelineError::Validation("message is required".into()))?;
        let raw_student = non_blank(input.student_id.as_ref())
            .ok_or_else(|| PipelineError::Validation("studentId is required".into()))?;
        if raw_message.chars().count() > self.settings.max_message_chars {
            return Err(PipelineError::Validation(format!(
                "message exceeds {} characters",
                self.settings.max_message_chars
            )));
        }

        let identity = self.gate.authenticate(credential).await.inspect_err(|e| {
            tracing::info!(stage = "authenticate", error = %e, "request rejected");
        })?;
        tracing::debug!(stage = "authenticated", caller = %identity.id);

        self.limiter.admit(&identity.id).inspect_err(|_| {
            tracing::info!(stage = "rate_check", caller = %identity.id, "rate limit exceeded");
        })?;
        tracing::debug!(stage = "rate_checked");

        let message = sanitize(raw_message);
        let student_id = sanitize(raw_student);
        let activity_id = Some(sanitize_value(input.activity_id.as_ref())).filter(|s| !s.is_empty());
        if message.is_empty() {
            return Err(PipelineError::Validation(
                "message is empty after removing markup".into(),
            ));
        }
        if student_id.is_empty() {
            return Err(PipelineError::Validation("studentId is invalid".into()));
        }
        tracing::debug!(stage = "sanitized", student_id = %student_id);

        let request = ChatRequest {
            message,
            caller_id: identity.id,
            student_id,
            activity_id,
            use_retrieval: input.use_rag,
            streaming,
        };

        self.students
            .get_student(&request.student_id)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "student lookup failed");
                PipelineError::upstream(e)
            })?
            .ok_or_else(|| {
                PipelineError::NotFound(format!("student '{}' not found", request.student_id))
            })?;

        let context = if request.use_retrieval {
            self.retrieve_context(&request.message).await?
        } else {
            Vec::new()
        };

        let history = if self.settings.history_turns > 0 {
            match self
                .log
                .recent(
                    &request.student_id,
                    request.activity_id.as_deref(),
                    self.settings.history_turns,
                )
                .await
            {
                Ok(turns) => history_from_log(&turns),
                Err(e) => {
                    tracing::warn!(error = %e, "could not load conversation history");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let generation = GenerationRequest {
            system_prompt: self.settings.system_prompt.clone(),
            history,
            context,
            message: request.message.clone(),
        };

        Ok(Prepared {
            request,
            generation,
        })
    }

    async fn retrieve_context(&self, query: &str) -> PipelineResult<Vec<ContextPassage>> {
        match self.retriever.retrieve(query, &self.settings.retrieval).await {
            Ok(outcome) => {
                tracing::debug!(
                    stage = "retrieved",
                    passages = outcome.results.len(),
                    vector = outcome.counts.vector,
                    keyword = outcome.counts.keyword
                );
                Ok(outcome.results.iter().map(ContextPassage::from).collect())
            }
            Err(e) => match self.settings.on_embedding_failure {
                EmbeddingFailurePolicy::Abort => Err(e),
                EmbeddingFailurePolicy::Continue => {
                    tracing::warn!(error = %e, "retrieval failed; answering without context");
                    Ok(Vec::new())
                }
            },
        }
    }
}

fn non_blank(value: Option<&serde_json::Value>) -> Option<&str> {
    value
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
}

/// Append the user turn, then the assistant turn. Never fails the caller.
async fn persist_exchange(log: &dyn ChatLog, request: &ChatRequest, reply: &str) {
    let activity = request.activity_id.as_deref();
    let user = ChatMessage::new(&request.student_id, activity, MessageRole::User, &request.message);
    if let Err(e) = log.append(&user).await {
        let err = PipelineError::persistence(e);
        tracing::error!(error = %err, role = "user", "failed to log chat turn");
    }
    let assistant = ChatMessage::new(&request.student_id, activity, MessageRole::Assistant, reply);
    if let Err(e) = log.append(&assistant).await {
        let err = PipelineError::persistence(e);
        tracing::error!(error = %err, role = "assistant", "failed to log chat turn");
    }
    tracing::debug!(stage = "logged");
}

async fn pump(
    mut tokens: campus_chat_core::generation::TokenStream,
    tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
    log: Arc<dyn ChatLog>,
    request: ChatRequest,
) {
    let mut reply = String::new();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!(stage = "stream", "client disconnected; stream abandoned");
                return;
            }
            next = tokens.next() => match next {
                Some(Ok(text)) => {
                    reply.push_str(&text);
                    if tx.send(StreamEvent::Delta(text)).await.is_err() {
                        tracing::info!(stage = "stream", "receiver dropped; stream abandoned");
                        return;
                    }
                }
                Some(Err(e)) => {
                    tracing::error!(error = %e, stage = "generate", "generation stream failed");
                    let _ = tx
                        .send(StreamEvent::Error {
                            code: "upstream_error",
                            message: "generation failed".to_string(),
                        })
                        .await;
                    return;
                }
                None => break,
            }
        }
    }
    tracing::debug!(stage = "generated", chars = reply.len());

    persist_exchange(log.as_ref(), &request, &reply).await;
    tracing::info!(student_id = %request.student_id, "chat stream answered");
    let _ = tx.send(StreamEvent::Done).await;
}

/// Events of a streamed reply. Dropping it cancels generation.
pub struct ChatStream {
    events: ReceiverStream<StreamEvent>,
    _guard: DropGuard,
}

impl Stream for ChatStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.events).poll_next(cx)
    }
}
