//! Core data models shared by the retrieval and chat pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A stored slice of a course document together with its embedding.
#[derive(Debug, Clone)]
pub struct DocumentChunk {
    pub id: String,
    pub document_name: String,
    pub chunk_index: i64,
    pub content: String,
    /// SHA-256 of `content`, hex encoded.
    pub hash: String,
    pub embedding: Vec<f32>,
}

/// Which search channel produced a [`SearchResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchOrigin {
    Vector,
    Keyword,
}

impl SearchOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchOrigin::Vector => "vector",
            SearchOrigin::Keyword => "keyword",
        }
    }
}

/// A ranked retrieval hit. Produced per request, never persisted.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub id: String,
    pub document_name: String,
    pub content: String,
    pub score: f64,
    #[serde(rename = "searchType")]
    pub origin: SearchOrigin,
}

/// Author of a persisted chat turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            _ => None,
        }
    }
}

/// One append-only chat log record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub student_id: String,
    pub activity_id: Option<String>,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    /// Build a new record with a fresh id and the current timestamp.
    pub fn new(
        student_id: &str,
        activity_id: Option<&str>,
        role: MessageRole,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            student_id: student_id.to_string(),
            activity_id: activity_id.map(str::to_string),
            role,
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

/// A validated chat request. Immutable once accepted by the orchestrator.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub message: String,
    pub caller_id: String,
    pub student_id: String,
    pub activity_id: Option<String>,
    pub use_retrieval: bool,
    pub streaming: bool,
}

/// Platform role attached to an authenticated identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Student,
    Teacher,
    Admin,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Student => "student",
            UserRole::Teacher => "teacher",
            UserRole::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "student" => Some(UserRole::Student),
            "teacher" => Some(UserRole::Teacher),
            "admin" => Some(UserRole::Admin),
            _ => None,
        }
    }

    /// Whether this role grants everything `required` grants.
    pub fn satisfies(&self, required: UserRole) -> bool {
        self.rank() >= required.rank()
    }

    fn rank(&self) -> u8 {
        match self {
            UserRole::Student => 0,
            UserRole::Teacher => 1,
            UserRole::Admin => 2,
        }
    }
}

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    pub role: UserRole,
}

/// A student record from the student store.
#[derive(Debug, Clone)]
pub struct Student {
    pub id: String,
    pub display_name: Option<String>,
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_ordering() {
        assert!(UserRole::Admin.satisfies(UserRole::Teacher));
        assert!(UserRole::Admin.satisfies(UserRole::Admin));
        assert!(UserRole::Teacher.satisfies(UserRole::Student));
        assert!(!UserRole::Student.satisfies(UserRole::Teacher));
        assert!(!UserRole::Teacher.satisfies(UserRole::Admin));
    }

    #[test]
    fn test_role_parse_case_insensitive() {
        assert_eq!(UserRole::parse("ADMIN"), Some(UserRole::Admin));
        assert_eq!(UserRole::parse("nobody"), None);
    }

    #[test]
    fn test_search_result_serializes_search_type() {
        let r = SearchResult {
            id: "a".to_string(),
            document_name: "syllabus.md".to_string(),
            content: "text".to_string(),
            score: 0.9,
            origin: SearchOrigin::Vector,
        };
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["searchType"], "vector");
        assert_eq!(v["documentName"], "syllabus.md");
    }
}
