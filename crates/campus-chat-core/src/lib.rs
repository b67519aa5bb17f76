//! # campus-chat core
//!
//! Runtime-agnostic logic for the campus-chat retrieval-augmented chat
//! pipeline: data models, the error taxonomy, backend traits, the hybrid
//! merge/rank algorithm, input sanitization, and per-identity rate limiting.
//!
//! This crate contains no tokio, sqlx, or HTTP dependencies. The
//! `campus-chat` application crate supplies concrete backends (SQLite,
//! OpenAI-compatible providers) and drives the pipeline on an async runtime.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Chunks, search results, chat messages, identities |
//! | [`error`] | [`PipelineError`](error::PipelineError) taxonomy |
//! | [`store`] | Storage traits and the in-memory store |
//! | [`search`] | Vector/keyword merge, dedup, and ranking |
//! | [`embedding`] | Embedder trait and vector utilities |
//! | [`generation`] | Generator trait and prompt types |
//! | [`identity`] | Identity backend trait and role checks |
//! | [`rate_limit`] | Fixed-window rate limiter |
//! | [`sanitize`] | Text and filename sanitizers |
//! | [`retry`] | Explicit retry policies |
//! | [`chunk`] | Paragraph-boundary chunker |

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod generation;
pub mod identity;
pub mod models;
pub mod rate_limit;
pub mod retry;
pub mod sanitize;
pub mod search;
pub mod store;
