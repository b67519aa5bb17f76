//! Hybrid retrieval over the chunk store.
//!
//! The query is embedded once, then vector and keyword search run
//! concurrently. Either channel may fail without failing the request;
//! only a failed query embedding is fatal. Without an embedder the
//! retriever runs keyword search alone.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;

use campus_chat_core::embedding::Embedder;
use campus_chat_core::error::{PipelineError, PipelineResult};
use campus_chat_core::models::{SearchOrigin, SearchResult};
use campus_chat_core::search::{merge_results, HybridOutcome, RetrievalParams};
use campus_chat_core::store::{ChunkCandidate, ChunkStore};

use crate::config::Config;
use crate::upstream::with_timeout;

pub struct HybridRetriever {
    embedder: Option<Arc<dyn Embedder>>,
    store: Arc<dyn ChunkStore>,
    embed_timeout: Duration,
    search_timeout: Duration,
}

impl HybridRetriever {
    /// `embedder` is `None` when embeddings are disabled.
    pub fn new(
        embedder: Option<Arc<dyn Embedder>>,
        store: Arc<dyn ChunkStore>,
        embed_timeout: Duration,
        search_timeout: Duration,
    ) -> Self {
        Self {
            embedder,
            store,
            embed_timeout,
            search_timeout,
        }
    }

    pub fn from_config(
        embedder: Option<Arc<dyn Embedder>>,
        store: Arc<dyn ChunkStore>,
        config: &Config,
    ) -> Self {
        Self::new(
            embedder,
            store,
            Duration::from_secs(config.embedding.timeout_secs),
            Duration::from_secs(config.retrieval.search_timeout_secs),
        )
    }

    /// Retrieve up to `params.match_count` passages for `query`.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Upstream`] if the query cannot be embedded or the
    /// embedding has the wrong dimension. Search failures degrade to
    /// whichever channel succeeded.
    pub async fn retrieve(&self, query: &str, params: &RetrievalParams) -> PipelineResult<HybridOutcome> {
        let query_vec = match &self.embedder {
            Some(embedder) => Some(self.embed_query(embedder.as_ref(), query).await?),
            None => None,
        };

        let vector_search = async {
            match &query_vec {
                Some(v) => {
                    with_timeout(
                        "vector search",
                        self.search_timeout,
                        self.store
                            .vector_search(v, params.match_threshold, params.match_count),
                    )
                    .await
                }
                None => Ok(Vec::new()),
            }
        };
        let (vector, keyword) = tokio::join!(
            vector_search,
            with_timeout(
                "keyword search",
                self.search_timeout,
                self.store.keyword_search(query, params.match_count),
            ),
        );

        let vector = match vector {
            Ok(hits) => hits,
            Err(e) => {
                tracing::warn!(error = %e, "vector search failed; continuing with keyword results");
                Vec::new()
            }
        };
        let keyword = match keyword {
            Ok(hits) => hits,
            Err(e) => {
                tracing::warn!(error = %e, "keyword search failed; continuing with vector results");
                Vec::new()
            }
        };

        let vector: Vec<SearchResult> = vector
            .into_iter()
            .map(|c| {
                let score = c.raw_score;
                to_result(c, SearchOrigin::Vector, score)
            })
            .collect();
        let keyword: Vec<SearchResult> = keyword
            .into_iter()
            .map(|c| to_result(c, SearchOrigin::Keyword, params.keyword_score))
            .collect();

        let outcome = merge_results(vector, keyword, params.match_count);
        tracing::debug!(
            vector = outcome.counts.vector,
            keyword = outcome.counts.keyword,
            "hybrid retrieval complete"
        );
        Ok(outcome)
    }

    async fn embed_query(&self, embedder: &dyn Embedder, query: &str) -> PipelineResult<Vec<f32>> {
        let fail = |e: anyhow::Error| {
            tracing::warn!(error = %e, "query embedding failed");
            PipelineError::upstream(e)
        };
        let vector = with_timeout("query embedding", self.embed_timeout, embedder.embed(query))
            .await
            .map_err(fail)?;
        if vector.len() != embedder.dims() {
            return Err(fail(anyhow!(
                "query embedding has {} dimensions, expected {}",
                vector.len(),
                embedder.dims()
            )));
        }
        Ok(vector)
    }
}

fn to_result(candidate: ChunkCandidate, origin: SearchOrigin, score: f64) -> SearchResult {
    SearchResult {
        id: candidate.chunk_id,
        document_name: candidate.document_name,
        content: candidate.content,
        score,
        origin,
    }
}
