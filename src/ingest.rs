//! Course document ingestion: chunk → embed → store.
//!
//! Re-ingesting a document replaces every chunk previously stored under
//! the same (sanitized) name. When no embedding provider is configured,
//! chunks are stored without vectors and only keyword search finds them.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use walkdir::WalkDir;

use campus_chat_core::chunk::split_text;
use campus_chat_core::embedding::Embedder;
use campus_chat_core::error::{PipelineError, PipelineResult};
use campus_chat_core::models::DocumentChunk;
use campus_chat_core::sanitize::sanitize_filename;
use campus_chat_core::store::ChunkStore;

use crate::config::Config;
use crate::upstream::with_timeout;

pub const DEFAULT_INCLUDE_GLOBS: &[&str] = &["**/*.md", "**/*.txt"];

const DEFAULT_EXCLUDE_GLOBS: &[&str] = &["**/.git/**", "**/target/**", "**/node_modules/**"];

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
    pub document_name: String,
    pub chunks: usize,
}

pub struct Ingestor {
    store: Arc<dyn ChunkStore>,
    embedder: Option<Arc<dyn Embedder>>,
    max_tokens: usize,
    batch_size: usize,
    embed_timeout: Duration,
}

impl Ingestor {
    /// `embedder` is `None` when embeddings are disabled.
    pub fn new(
        store: Arc<dyn ChunkStore>,
        embedder: Option<Arc<dyn Embedder>>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            embedder,
            max_tokens: config.chunking.max_tokens,
            batch_size: config.embedding.batch_size.max(1),
            embed_timeout: Duration::from_secs(config.embedding.timeout_secs),
        }
    }

    pub async fn ingest_document(&self, name: &str, text: &str) -> PipelineResult<IngestReport> {
        let document_name = sanitize_filename(name);
        let pieces = split_text(text, self.max_tokens);
        if pieces.is_empty() {
            return Err(PipelineError::Validation(format!(
                "document '{}' has no content",
                document_name
            )));
        }

        let embeddings = match &self.embedder {
            Some(embedder) => {
                let texts: Vec<String> = pieces.iter().map(|p| p.text.clone()).collect();
                let mut vectors = Vec::with_capacity(texts.len());
                for batch in texts.chunks(self.batch_size) {
                    let batch_vecs = with_timeout(
                        "document embedding",
                        self.embed_timeout,
                        embedder.embed_batch(batch),
                    )
                    .await
                    .map_err(|e| {
                        tracing::error!(document = %document_name, error = %e, "embedding failed");
                        PipelineError::upstream(e)
                    })?;
                    if let Some(bad) = batch_vecs.iter().find(|v| v.len() != embedder.dims()) {
                        tracing::error!(
                            document = %document_name,
                            got = bad.len(),
                            expected = embedder.dims(),
                            "embedding dimension mismatch"
                        );
                        return Err(PipelineError::Upstream(format!(
                            "embedding has {} dimensions, expected {}",
                            bad.len(),
                            embedder.dims()
                        )));
                    }
                    vectors.extend(batch_vecs);
                }
                vectors
            }
            None => vec![Vec::new(); pieces.len()],
        };

        let chunks: Vec<DocumentChunk> = pieces
            .into_iter()
            .zip(embeddings)
            .map(|(piece, embedding)| DocumentChunk {
                id: uuid::Uuid::new_v4().to_string(),
                document_name: document_name.clone(),
                chunk_index: piece.index,
                content: piece.text,
                hash: piece.hash,
                embedding,
            })
            .collect();

        self.store
            .replace_document(&document_name, &chunks)
            .await
            .map_err(|e| {
                tracing::error!(document = %document_name, error = %e, "failed to store chunks");
                PipelineError::persistence(e)
            })?;

        tracing::info!(document = %document_name, chunks = chunks.len(), "document ingested");
        Ok(IngestReport {
            document_name,
            chunks: chunks.len(),
        })
    }

    /// Ingest a single file or every matching file under a directory.
    ///
    /// Files are processed in path order. Documents that fail are logged
    /// and skipped; the returned reports cover the successes.
    pub async fn ingest_path(&self, root: &Path, include_globs: &[String]) -> Result<Vec<IngestReport>> {
        if !root.exists() {
            bail!("Path does not exist: {}", root.display());
        }

        let files = if root.is_file() {
            vec![(root.to_path_buf(), file_name(root))]
        } else {
            collect_files(root, include_globs)?
        };

        let mut reports = Vec::new();
        for (path, name) in files {
            let text = match std::fs::read_to_string(&path) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable file");
                    continue;
                }
            };
            match self.ingest_document(&name, &text).await {
                Ok(report) => reports.push(report),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping document"),
            }
        }
        Ok(reports)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn collect_files(root: &Path, include_globs: &[String]) -> Result<Vec<(std::path::PathBuf, String)>> {
    let include_set = if include_globs.is_empty() {
        let defaults: Vec<String> = DEFAULT_INCLUDE_GLOBS.iter().map(|g| g.to_string()).collect();
        build_globset(&defaults)?
    } else {
        build_globset(include_globs)?
    };
    let excludes: Vec<String> = DEFAULT_EXCLUDE_GLOBS.iter().map(|g| g.to_string()).collect();
    let exclude_set = build_globset(&excludes)?;

    let mut files = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().to_string();
        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }
        files.push((path.to_path_buf(), rel_str));
    }

    files.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(files)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
