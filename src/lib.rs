//! # campus-chat
//!
//! Retrieval-augmented tutoring chat for an education platform.
//!
//! Course documents are chunked, embedded, and stored in SQLite. Students
//! chat with a tutor model through an HTTP API; each request passes an
//! identity gate, a per-caller rate limiter, and an input sanitizer, can
//! pull context from a hybrid (vector + keyword) retriever, and is logged
//! as two append-only chat turns.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────────┐   ┌──────────┐
//! │  Ingest  │──▶│ Chunk + Embed │──▶│  SQLite  │
//! └──────────┘   └───────────────┘   └────┬─────┘
//!                                         │
//!          ┌──────────────────────────────┤
//!          ▼                              ▼
//!   ┌─────────────┐  auth → limit → sanitize → retrieve → generate → log
//!   │ POST /search│  ┌──────────────────────────────────────────────────┐
//!   └─────────────┘  │                   POST /chat                     │
//!                    └──────────────────────────────────────────────────┘
//! ```
//!
//! Domain types, traits, and pure algorithms live in the
//! `campus-chat-core` crate; this crate supplies SQLite storage, HTTP
//! providers, the orchestrator, and the server.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite implementation of the storage traits |
//! | [`embedding`] | OpenAI and Ollama embedding providers |
//! | [`generation`] | OpenAI-compatible chat completions, batch and streamed |
//! | [`identity`] | JWT and remote identity backends |
//! | [`upstream`] | Timeouts and retries for external calls |
//! | [`retrieve`] | Hybrid retriever |
//! | [`chat`] | Chat orchestrator |
//! | [`ingest`] | Document ingestion |
//! | [`server`] | HTTP server |

pub mod chat;
pub mod config;
pub mod db;
pub mod embedding;
pub mod generation;
pub mod identity;
pub mod ingest;
pub mod migrate;
pub mod retrieve;
pub mod server;
pub mod sqlite_store;
pub mod upstream;
