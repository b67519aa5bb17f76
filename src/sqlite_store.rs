//! SQLite implementation of the core storage traits.
//!
//! Vector search loads every stored embedding and ranks by cosine
//! similarity in Rust, which is fine at course-material scale. Keyword
//! search is a case-insensitive substring match via `instr(lower(..))`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use campus_chat_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use campus_chat_core::models::{ChatMessage, DocumentChunk, MessageRole, Student, UserRole};
use campus_chat_core::store::{ChatLog, ChunkCandidate, ChunkStore, RoleStore, StudentStore};

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn upsert_student(&self, id: &str, display_name: Option<&str>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO students (id, display_name, created_at) VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET display_name = excluded.display_name
            "#,
        )
        .bind(id)
        .bind(display_name)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_role(&self, identity_id: &str, role: UserRole) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO profiles (id, role, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET role = excluded.role, updated_at = excluded.updated_at
            "#,
        )
        .bind(identity_id)
        .bind(role.as_str())
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn chunk_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM document_chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl ChunkStore for SqliteStore {
    async fn vector_search(
        &self,
        query_vec: &[f32],
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<ChunkCandidate>> {
        let rows = sqlx::query(
            r#"
            SELECT id, document_name, content, embedding
            FROM document_chunks
            WHERE embedding IS NOT NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut candidates: Vec<ChunkCandidate> = rows
            .iter()
            .filter_map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let similarity = cosine_similarity(query_vec, &blob_to_vec(&blob)) as f64;
                (similarity > threshold).then(|| ChunkCandidate {
                    chunk_id: row.get("id"),
                    document_name: row.get("document_name"),
                    content: row.get("content"),
                    raw_score: similarity,
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
        let needle = query.trim();
        if needle.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT id, document_name, content
            FROM document_chunks
            WHERE instr(lower(content), lower(?)) > 0
            ORDER BY rowid
            LIMIT ?
            "#,
        )
        .bind(needle)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| ChunkCandidate {
                chunk_id: row.get("id"),
                document_name: row.get("document_name"),
                content: row.get("content"),
                raw_score: 0.0,
            })
            .collect())
    }

    async fn replace_document(&self, document_name: &str, chunks: &[DocumentChunk]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM document_chunks WHERE document_name = ?")
            .bind(document_name)
            .execute(&mut *tx)
            .await?;

        let now = Utc::now().timestamp();
        for chunk in chunks {
            let blob = (!chunk.embedding.is_empty()).then(|| vec_to_blob(&chunk.embedding));
            sqlx::query(
                r#"
                INSERT INTO document_chunks
                    (id, document_name, chunk_index, content, hash, embedding, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(document_name)
            .bind(chunk.chunk_index)
            .bind(&chunk.content)
            .bind(&chunk.hash)
            .bind(blob)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl StudentStore for SqliteStore {
    async fn get_student(&self, id: &str) -> Result<Option<Student>> {
        let row = sqlx::query("SELECT id, display_name, created_at FROM students WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| Student {
            id: row.get("id"),
            display_name: row.get("display_name"),
            created_at: row.get("created_at"),
        }))
    }
}

#[async_trait]
impl ChatLog for SqliteStore {
    async fn append(&self, message: &ChatMessage) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO chat_messages (id, student_id, activity_id, role, content, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&message.id)
        .bind(&message.student_id)
        .bind(message.activity_id.as_deref())
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(message.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent(
        &self,
        student_id: &str,
        activity_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ChatMessage>> {
        // `IS` matches NULL against NULL for messages without an activity.
        let rows = sqlx::query(
            r#"
            SELECT id, student_id, activity_id, role, content, created_at
            FROM chat_messages
            WHERE student_id = ? AND activity_id IS ?
            ORDER BY rowid DESC
            LIMIT ?
            "#,
        )
        .bind(student_id)
        .bind(activity_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut messages = rows
            .iter()
            .map(|row| {
                let role: String = row.get("role");
                let created_at: String = row.get("created_at");
                Ok(ChatMessage {
                    id: row.get("id"),
                    student_id: row.get("student_id"),
                    activity_id: row.get("activity_id"),
                    role: MessageRole::parse(&role)
                        .with_context(|| format!("unknown message role '{}'", role))?,
                    content: row.get("content"),
                    created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        messages.reverse();
        Ok(messages)
    }
}

#[async_trait]
impl RoleStore for SqliteStore {
    async fn lookup_role(&self, identity_id: &str) -> Result<Option<UserRole>> {
        let role: Option<String> = sqlx::query_scalar("SELECT role FROM profiles WHERE id = ?")
            .bind(identity_id)
            .fetch_optional(&self.pool)
            .await?;

        // An unrecognised role string grants no more than a student.
        Ok(role.map(|r| UserRole::parse(&r).unwrap_or(UserRole::Student)))
    }
}
