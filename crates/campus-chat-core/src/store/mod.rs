//! Storage abstraction for the chat pipeline.
//!
//! Four narrow traits cover everything the pipeline reads or writes:
//!
//! | Trait | Purpose |
//! |-------|---------|
//! | [`ChunkStore`] | Vector and keyword search over document chunks; ingest writes |
//! | [`StudentStore`] | Student existence checks |
//! | [`ChatLog`] | Append-only chat history |
//! | [`RoleStore`] | Role lookup for authenticated identities |
//!
//! Implementations must be `Send + Sync`. [`memory::InMemoryStore`]
//! implements all four for tests; the app crate provides a SQLite store.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{ChatMessage, DocumentChunk, Student, UserRole};

/// A chunk returned from vector or keyword search.
#[derive(Debug, Clone)]
pub struct ChunkCandidate {
    pub chunk_id: String,
    pub document_name: String,
    pub content: String,
    /// Cosine similarity for vector hits; unused (0.0) for keyword hits.
    pub raw_score: f64,
}

#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Chunks whose similarity to `query_vec` exceeds `threshold`, best
    /// first, at most `limit`.
    async fn vector_search(
        &self,
        query_vec: &[f32],
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<ChunkCandidate>>;

    /// Chunks whose content contains `query` (case-insensitive), at most `limit`.
    async fn keyword_search(&self, query: &str, limit: usize) -> Result<Vec<ChunkCandidate>>;

    /// Replace every chunk stored under `document_name` with `chunks`.
    async fn replace_document(&self, document_name: &str, chunks: &[DocumentChunk]) -> Result<()>;
}

#[async_trait]
pub trait StudentStore: Send + Sync {
    async fn get_student(&self, id: &str) -> Result<Option<Student>>;
}

/// Append-only chat history. There is no update or delete path.
#[async_trait]
pub trait ChatLog: Send + Sync {
    async fn append(&self, message: &ChatMessage) -> Result<()>;

    /// The latest `limit` turns for a student/activity pair, oldest first.
    async fn recent(
        &self,
        student_id: &str,
        activity_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ChatMessage>>;
}

#[async_trait]
pub trait RoleStore: Send + Sync {
    async fn lookup_role(&self, identity_id: &str) -> Result<Option<UserRole>>;
}
