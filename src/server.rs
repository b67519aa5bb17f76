//! HTTP server for retrieval and tutoring chat.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/search` | Hybrid search over course material |
//! | `POST` | `/chat` | Tutoring chat, batch JSON or server-sent events |
//! | `POST` | `/documents` | Ingest a document (admin only) |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! All error responses share one shape:
//!
//! ```json
//! { "error": { "code": "validation_error", "message": "validation failed: message is required" } }
//! ```
//!
//! Codes: `validation_error` (400), `authentication_error` (401),
//! `authorization_error` (403), `not_found` (404), `rate_limited` (429,
//! with `Retry-After`), `upstream_error` and `persistence_error` (500).
//! Details of 500s are logged, never returned.
//!
//! # Streaming
//!
//! `POST /chat` with `"stream": true` answers `text/event-stream`:
//! `event: delta` frames carry `{"text": ...}`, followed by one
//! `event: done` frame, or one `event: error` frame carrying
//! `{"code","message"}` if generation fails midway.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so browser clients
//! can call the API directly.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use campus_chat_core::error::PipelineError;
use campus_chat_core::identity::{extract_bearer, AccessGate};
use campus_chat_core::models::{SearchResult, UserRole};
use campus_chat_core::rate_limit::InMemoryRateLimiter;
use campus_chat_core::sanitize::sanitize_value;
use campus_chat_core::search::{OriginCounts, RetrievalParams};

use crate::chat::{ChatInput, ChatService, ChatSettings, StreamEvent};
use crate::config::Config;
use crate::ingest::{IngestReport, Ingestor};
use crate::retrieve::HybridRetriever;
use crate::sqlite_store::SqliteStore;
use crate::{db, embedding, generation, identity, migrate};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub retriever: Arc<HybridRetriever>,
    pub retrieval: RetrievalParams,
    /// Largest `matchCount` accepted by `/search`.
    pub max_match_count: usize,
    pub chat: Arc<ChatService>,
    pub gate: Arc<AccessGate>,
    pub ingestor: Arc<Ingestor>,
}

impl AppState {
    /// Wire SQLite and the configured providers into a ready state.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;
        let store = Arc::new(SqliteStore::new(pool));

        let embedder = embedding::create_embedder(&config.embedding)?;
        let generator = generation::create_generator(&config.generation)?;
        let identity = identity::create_identity_backend(&config.identity)?;

        let gate = Arc::new(AccessGate::new(identity, store.clone()));
        let retriever = Arc::new(HybridRetriever::from_config(
            embedder.clone(),
            store.clone(),
            config,
        ));
        let limiter = Arc::new(InMemoryRateLimiter::new(
            config.rate_limit.window_secs,
            config.rate_limit.max_requests,
        ));
        spawn_limiter_sweep(
            limiter.clone(),
            Duration::from_secs(config.rate_limit.window_secs.max(1)),
        );
        let chat = Arc::new(ChatService::new(
            gate.clone(),
            limiter,
            store.clone(),
            store.clone(),
            retriever.clone(),
            generator,
            ChatSettings::from_config(config),
        ));
        let ingestor = Arc::new(Ingestor::new(store, embedder, config));

        Ok(Self {
            retriever,
            retrieval: config.retrieval.params(),
            max_match_count: config.retrieval.max_match_count,
            chat,
            gate,
            ingestor,
        })
    }
}

/// Drop expired rate-limit windows once per window so idle callers do not
/// accumulate in memory.
fn spawn_limiter_sweep(limiter: Arc<InMemoryRateLimiter>, every: Duration) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        loop {
            tick.tick().await;
            let purged = limiter.purge_expired();
            if purged > 0 {
                tracing::debug!(purged, "expired rate-limit windows purged");
            }
        }
    });
}

/// Build the router with CORS and request tracing applied.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/search", post(handle_search))
        .route("/chat", post(handle_chat))
        .route("/documents", post(handle_ingest))
        .route("/health", get(handle_health))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Starts the HTTP server on `[server].bind` and runs until terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let state = AppState::from_config(config).await?;
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(addr = %listener.local_addr()?, "campus-chat listening");
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Error type that converts into an Axum HTTP response.
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: String,
    message: String,
    retry_after: Option<u64>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        let mut response = (self.status, Json(body)).into_response();
        if let Some(secs) = self.retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        let status = match &err {
            PipelineError::Validation(_) => StatusCode::BAD_REQUEST,
            PipelineError::Authentication(_) => StatusCode::UNAUTHORIZED,
            PipelineError::Authorization(_) => StatusCode::FORBIDDEN,
            PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            PipelineError::Upstream(_) | PipelineError::Persistence(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let retry_after = match &err {
            PipelineError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        };
        let message = if err.is_client_facing() {
            err.to_string()
        } else {
            tracing::error!(error = %err, "request failed");
            "internal error; the request could not be completed".to_string()
        };

        AppError {
            status,
            code: err.category().to_string(),
            message,
            retry_after,
        }
    }
}

fn bad_json(rejection: JsonRejection) -> AppError {
    PipelineError::Validation(format!("invalid JSON body: {}", rejection.body_text())).into()
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    extract_bearer(
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok()),
    )
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /search ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchInput {
    #[serde(default)]
    query: Option<serde_json::Value>,
    #[serde(default)]
    match_threshold: Option<f64>,
    #[serde(default)]
    match_count: Option<usize>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    results: Vec<SearchResult>,
    query: String,
    total_found: usize,
    search_types: OriginCounts,
}

/// Handler for `POST /search`.
///
/// Returns `400` for a missing or blank query and `500` when the query
/// cannot be embedded.
async fn handle_search(
    State(state): State<AppState>,
    payload: Result<Json<SearchInput>, JsonRejection>,
) -> Result<Json<SearchResponse>, AppError> {
    let Json(input) = payload.map_err(bad_json)?;

    let query = sanitize_value(input.query.as_ref());
    if query.is_empty() {
        return Err(PipelineError::Validation("query must not be empty".into()).into());
    }

    let mut params = state.retrieval;
    if let Some(threshold) = input.match_threshold {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(
                PipelineError::Validation("matchThreshold must be in [0, 1]".into()).into(),
            );
        }
        params.match_threshold = threshold;
    }
    if let Some(count) = input.match_count {
        if count == 0 || count > state.max_match_count {
            return Err(PipelineError::Validation(format!(
                "matchCount must be between 1 and {}",
                state.max_match_count
            ))
            .into());
        }
        params.match_count = count;
    }

    let outcome = state.retriever.retrieve(&query, &params).await?;
    tracing::info!(results = outcome.results.len(), "search answered");

    Ok(Json(SearchResponse {
        total_found: outcome.results.len(),
        search_types: outcome.counts,
        results: outcome.results,
        query,
    }))
}

// ============ POST /chat ============

#[derive(Serialize)]
struct ChatResponse {
    response: String,
}

/// Handler for `POST /chat`.
async fn handle_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<ChatInput>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(input) = payload.map_err(bad_json)?;
    let credential = bearer(&headers);

    if input.stream {
        let events = state.chat.chat_stream(credential, input).await?;
        let sse = events.map(|event| Ok::<_, Infallible>(to_sse(event)));
        Ok(Sse::new(sse).keep_alive(KeepAlive::default()).into_response())
    } else {
        let response = state.chat.chat(credential, input).await?;
        Ok(Json(ChatResponse { response }).into_response())
    }
}

fn to_sse(event: StreamEvent) -> Event {
    match event {
        StreamEvent::Delta(text) => Event::default()
            .event("delta")
            .data(serde_json::json!({ "text": text }).to_string()),
        StreamEvent::Done => Event::default().event("done").data("{}"),
        StreamEvent::Error { code, message } => Event::default()
            .event("error")
            .data(serde_json::json!({ "code": code, "message": message }).to_string()),
    }
}

// ============ POST /documents ============

#[derive(Deserialize)]
struct IngestInput {
    #[serde(default)]
    name: Option<serde_json::Value>,
    #[serde(default)]
    content: Option<serde_json::Value>,
}

/// Handler for `POST /documents`. Admin only.
async fn handle_ingest(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<IngestInput>, JsonRejection>,
) -> Result<Json<IngestReport>, AppError> {
    let identity = state.gate.authenticate(bearer(&headers)).await?;
    state.gate.authorize(&identity, UserRole::Admin)?;

    let Json(input) = payload.map_err(bad_json)?;
    let name = input
        .name
        .as_ref()
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| PipelineError::Validation("name is required".into()))?;
    let content = input
        .content
        .as_ref()
        .and_then(|v| v.as_str())
        .ok_or_else(|| PipelineError::Validation("content is required".into()))?;

    let report = state.ingestor.ingest_document(name, content).await?;
    tracing::info!(admin = %identity.id, document = %report.document_name, "document ingested via API");
    Ok(Json(report))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_maps_to_429_with_retry_after() {
        let response = AppError::from(PipelineError::RateLimited {
            retry_after_secs: 17,
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "17");
    }

    #[test]
    fn test_upstream_detail_is_hidden() {
        let err = AppError::from(PipelineError::Upstream("sk-secret leaked in body".into()));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.code, "upstream_error");
        assert!(!err.message.contains("sk-secret"));
    }

    #[test]
    fn test_validation_detail_is_shown() {
        let err = AppError::from(PipelineError::Validation("studentId is required".into()));
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(err.message.contains("studentId"));
    }
}
