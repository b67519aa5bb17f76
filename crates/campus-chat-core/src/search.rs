//! Hybrid result merging.
//!
//! Combines vector-similarity hits and keyword hits into one ranked,
//! deduplicated list. The store calls themselves are made by the caller;
//! this module is the pure merge step.
//!
//! # Algorithm
//!
//! 1. Insert vector hits first, keyed by chunk id.
//! 2. Insert keyword hits whose id is not present yet, only while the
//!    merged set is smaller than `match_count`.
//! 3. Stable sort by score, descending. Ties keep insertion order, so a
//!    vector hit stays ahead of a keyword hit with the same score.
//! 4. Truncate to `match_count`.

use std::collections::HashSet;

use serde::Serialize;

use crate::models::{SearchOrigin, SearchResult};

/// Default cosine-similarity threshold for vector hits.
pub const DEFAULT_MATCH_THRESHOLD: f64 = 0.78;
/// Default number of results returned.
pub const DEFAULT_MATCH_COUNT: usize = 5;
/// Largest `matchCount` a caller may request.
pub const DEFAULT_MAX_MATCH_COUNT: usize = 50;
/// Fixed score assigned to keyword hits.
pub const DEFAULT_KEYWORD_SCORE: f64 = 0.5;

/// Retrieval tuning for a single query.
#[derive(Debug, Clone, Copy)]
pub struct RetrievalParams {
    pub match_threshold: f64,
    pub match_count: usize,
    pub keyword_score: f64,
}

impl Default for RetrievalParams {
    fn default() -> Self {
        Self {
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            match_count: DEFAULT_MATCH_COUNT,
            keyword_score: DEFAULT_KEYWORD_SCORE,
        }
    }
}

/// How many merged results came from each channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OriginCounts {
    pub vector: usize,
    pub keyword: usize,
}

/// Output of a hybrid retrieval.
#[derive(Debug, Clone, Default)]
pub struct HybridOutcome {
    pub results: Vec<SearchResult>,
    pub counts: OriginCounts,
}

/// Merge, deduplicate, rank, and truncate vector and keyword hits.
pub fn merge_results(
    vector: Vec<SearchResult>,
    keyword: Vec<SearchResult>,
    match_count: usize,
) -> HybridOutcome {
    let mut seen: HashSet<String> = HashSet::new();
    let mut merged: Vec<SearchResult> = Vec::with_capacity(vector.len().min(match_count));

    for hit in vector {
        if seen.insert(hit.id.clone()) {
            merged.push(hit);
        }
    }

    for hit in keyword {
        if merged.len() >= match_count {
            break;
        }
        if seen.insert(hit.id.clone()) {
            merged.push(hit);
        }
    }

    // `sort_by` is stable.
    merged.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    merged.truncate(match_count);

    let counts = count_origins(&merged);
    HybridOutcome {
        results: merged,
        counts,
    }
}

pub fn count_origins(results: &[SearchResult]) -> OriginCounts {
    let mut counts = OriginCounts::default();
    for r in results {
        match r.origin {
            SearchOrigin::Vector => counts.vector += 1,
            SearchOrigin::Keyword => counts.keyword += 1,
        }
    }
    counts
}
