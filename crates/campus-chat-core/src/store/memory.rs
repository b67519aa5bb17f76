//! In-memory store implementing every storage trait, for tests and demos.
//!
//! Vector search is brute-force cosine similarity; keyword search is a
//! case-insensitive substring scan in insertion order.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;

use crate::embedding::cosine_similarity;
use crate::models::{ChatMessage, DocumentChunk, Student, UserRole};

use super::{ChatLog, ChunkCandidate, ChunkStore, RoleStore, StudentStore};

#[derive(Default)]
pub struct InMemoryStore {
    chunks: RwLock<Vec<DocumentChunk>>,
    students: RwLock<HashMap<String, Student>>,
    roles: RwLock<HashMap<String, UserRole>>,
    messages: RwLock<Vec<ChatMessage>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_chunk(&self, chunk: DocumentChunk) {
        self.chunks.write().push(chunk);
    }

    pub fn add_student(&self, id: &str, display_name: Option<&str>) {
        self.students.write().insert(
            id.to_string(),
            Student {
                id: id.to_string(),
                display_name: display_name.map(str::to_string),
                created_at: chrono::Utc::now().timestamp(),
            },
        );
    }

    pub fn set_role(&self, identity_id: &str, role: UserRole) {
        self.roles.write().insert(identity_id.to_string(), role);
    }

    /// Snapshot of every appended chat message, in append order.
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.messages.read().clone()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.read().len()
    }
}

#[async_trait]
impl ChunkStore for InMemoryStore {
    async fn vector_search(
        &self,
        query_vec: &[f32],
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<ChunkCandidate>> {
        let chunks = self.chunks.read();
        let mut candidates: Vec<ChunkCandidate> = chunks
            .iter()
            .filter_map(|c| {
                let sim = cosine_similarity(query_vec, &c.embedding) as f64;
                (sim > threshold).then(|| ChunkCandidate {
                    chunk_id: c.id.clone(),
                    document_name: c.document_name.clone(),
                    content: c.content.clone(),
                    raw_score: sim,
                })
            })
            .collect();
        candidates.sort_by(|a, b| {
            b.raw_score
                .partial_cmp(&a.raw_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn keyword_search(&self, query: &str, limit: usize) -> Result<Vec<ChunkCandidate>> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }
        let chunks = self.chunks.read();
        Ok(chunks
            .iter()
            .filter(|c| c.content.to_lowercase().contains(&needle))
            .take(limit)
            .map(|c| ChunkCandidate {
                chunk_id: c.id.clone(),
                document_name: c.document_name.clone(),
                content: c.content.clone(),
                raw_score: 0.0,
            })
            .collect())
    }

    async fn replace_document(&self, document_name: &str, chunks: &[DocumentChunk]) -> Result<()> {
        let mut stored = self.chunks.write();
        stored.retain(|c| c.document_name != document_name);
        stored.extend(chunks.iter().cloned());
        Ok(())
    }
}

#[async_trait]
impl StudentStore for InMemoryStore {
    async fn get_student(&self, id: &str) -> Result<Option<Student>> {
        Ok(self.students.read().get(id).cloned())
    }
}

#[async_trait]
impl ChatLog for InMemoryStore {
    async fn append(&self, message: &ChatMessage) -> Result<()> {
        self.messages.write().push(message.clone());
        Ok(())
    }

    async fn recent(
        &self,
        student_id: &str,
        activity_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ChatMessage>> {
        let messages = self.messages.read();
        let matching: Vec<&ChatMessage> = messages
            .iter()
            .filter(|m| m.student_id == student_id && m.activity_id.as_deref() == activity_id)
            .collect();
        let skip = matching.len().saturating_sub(limit);
        Ok(matching.into_iter().skip(skip).cloned().collect())
    }
}

#[async_trait]
impl RoleStore for InMemoryStore {
    async fn lookup_role(&self, identity_id: &str) -> Result<Option<UserRole>> {
        Ok(self.roles.read().get(identity_id).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageRole;

    fn chunk(id: &str, doc: &str, content: &str, embedding: Vec<f32>) -> DocumentChunk {
        DocumentChunk {
            id: id.to_string(),
            document_name: doc.to_string(),
            chunk_index: 0,
            content: content.to_string(),
            hash: String::new(),
            embedding,
        }
    }

    #[tokio::test]
    async fn test_vector_search_threshold_and_order() {
        let store = InMemoryStore::new();
        store.add_chunk(chunk("a", "d", "x", vec![1.0, 0.0]));
        store.add_chunk(chunk("b", "d", "y", vec![0.9, 0.1]));
        store.add_chunk(chunk("c", "d", "z", vec![0.0, 1.0]));

        let hits = store.vector_search(&[1.0, 0.0], 0.78, 5).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_keyword_search_case_insensitive() {
        let store = InMemoryStore::new();
        store.add_chunk(chunk("a", "d", "The Water Cycle", vec![]));
        store.add_chunk(chunk("b", "d", "Photosynthesis", vec![]));
        let hits = store.keyword_search("water cycle", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "a");
    }

    #[tokio::test]
    async fn test_replace_document() {
        let store = InMemoryStore::new();
        store.add_chunk(chunk("a", "d1", "old", vec![]));
        store.add_chunk(chunk("b", "d2", "other", vec![]));
        store
            .replace_document("d1", &[chunk("c", "d1", "new", vec![])])
            .await
            .unwrap();
        assert_eq!(store.chunk_count(), 2);
        assert!(store.keyword_search("old", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recent_filters_and_orders() {
        let store = InMemoryStore::new();
        for i in 0..4 {
            store
                .append(&ChatMessage::new("s1", Some("act"), MessageRole::User, format!("m{}", i)))
                .await
                .unwrap();
        }
        store
            .append(&ChatMessage::new("s1", None, MessageRole::User, "other"))
            .await
            .unwrap();
        let recent = store.recent("s1", Some("act"), 2).await.unwrap();
        let contents: Vec<&str> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3"]);
    }
}
