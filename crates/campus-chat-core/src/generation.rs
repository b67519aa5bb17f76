//! Generator trait and prompt assembly.
//!
//! A [`Generator`] turns a [`GenerationRequest`] into text, either as one
//! complete response or as a stream of text deltas. Prompt assembly is
//! pure and lives here so it can be tested without a backend.

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::models::{ChatMessage, MessageRole, SearchResult};

/// Stream of text deltas from a streamed completion, in arrival order.
pub type TokenStream = BoxStream<'static, Result<String>>;

/// Role of one message in the prompt sent to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptRole {
    System,
    User,
    Assistant,
}

impl PromptRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromptRole::System => "system",
            PromptRole::User => "user",
            PromptRole::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PromptMessage {
    pub role: PromptRole,
    pub content: String,
}

impl PromptMessage {
    pub fn new(role: PromptRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// A retrieved passage folded into the prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextPassage {
    pub document_name: String,
    pub content: String,
}

impl From<&SearchResult> for ContextPassage {
    fn from(r: &SearchResult) -> Self {
        Self {
            document_name: r.document_name.clone(),
            content: r.content.clone(),
        }
    }
}

/// Everything a generator needs for one exchange.
#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub system_prompt: String,
    /// Prior turns, oldest first.
    pub history: Vec<PromptMessage>,
    pub context: Vec<ContextPassage>,
    pub message: String,
}

impl GenerationRequest {
    /// Flatten into the ordered message list sent to a chat-completions API.
    ///
    /// The system prompt comes first, followed by a second system message
    /// carrying the retrieved context (when any), the history, and finally
    /// the user's message.
    pub fn to_messages(&self) -> Vec<PromptMessage> {
        let mut messages = Vec::with_capacity(self.history.len() + 3);
        if !self.system_prompt.is_empty() {
            messages.push(PromptMessage::new(PromptRole::System, &self.system_prompt));
        }
        if let Some(ctx) = render_context(&self.context) {
            messages.push(PromptMessage::new(PromptRole::System, ctx));
        }
        messages.extend(self.history.iter().cloned());
        messages.push(PromptMessage::new(PromptRole::User, &self.message));
        messages
    }
}

/// Render retrieved passages as a single context block.
///
/// Returns `None` when there is nothing to add.
pub fn render_context(passages: &[ContextPassage]) -> Option<String> {
    if passages.is_empty() {
        return None;
    }
    let mut out = String::from(
        "Use the following course material to answer. \
         If it does not contain the answer, say so.\n",
    );
    for (i, p) in passages.iter().enumerate() {
        out.push_str(&format!("\n[{}] {}\n{}\n", i + 1, p.document_name, p.content.trim()));
    }
    Some(out)
}

/// Convert persisted chat turns into prompt history.
pub fn history_from_log(turns: &[ChatMessage]) -> Vec<PromptMessage> {
    turns
        .iter()
        .map(|m| {
            let role = match m.role {
                MessageRole::User => PromptRole::User,
                MessageRole::Assistant => PromptRole::Assistant,
            };
            PromptMessage::new(role, &m.content)
        })
        .collect()
}

/// A language-model backend.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Returns the model identifier.
    fn model_name(&self) -> &str;

    /// Generate one complete response.
    async fn complete(&self, request: &GenerationRequest) -> Result<String>;

    /// Generate a streamed response.
    ///
    /// The returned stream yields text deltas in the order the backend
    /// produced them and ends when generation is complete.
    async fn complete_stream(&self, request: &GenerationRequest) -> Result<TokenStream>;
}
