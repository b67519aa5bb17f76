//! Full-stack test: SQLite storage, HS256 identity, and the OpenAI-compatible
//! providers talking to a local fake of the provider API.

use std::sync::{Arc, Mutex};

use axum::{extract::State, http::header, response::IntoResponse, routing::post, Json, Router};
use serde_json::{json, Value};
use tempfile::TempDir;

use campus_chat::config::Config;
use campus_chat::identity::encode_hs256;
use campus_chat::server::{router, AppState};
use campus_chat::sqlite_store::SqliteStore;
use campus_chat::db;
use campus_chat_core::models::{MessageRole, UserRole};
use campus_chat_core::store::ChatLog;

const PROVIDER_KEY_ENV: &str = "CAMPUS_FULL_STACK_PROVIDER_KEY";
const JWT_SECRET_ENV: &str = "CAMPUS_FULL_STACK_JWT_SECRET";
const JWT_SECRET: &str = "full-stack-secret";

/// Completion requests seen by the fake provider.
#[derive(Clone, Default)]
struct Seen(Arc<Mutex<Vec<Value>>>);

async fn fake_embeddings(Json(body): Json<Value>) -> Json<Value> {
    let data: Vec<Value> = body["input"]
        .as_array()
        .map(|inputs| {
            inputs
                .iter()
                .enumerate()
                .map(|(i, text)| {
                    let text = text.as_str().unwrap_or_default().to_lowercase();
                    let embedding = if text.contains("cell") {
                        json!([1.0, 0.0])
                    } else {
                        json!([0.0, 1.0])
                    };
                    json!({ "index": i, "embedding": embedding })
                })
                .collect()
        })
        .unwrap_or_default();
    Json(json!({ "data": data }))
}

async fn fake_completions(State(seen): State<Seen>, Json(body): Json<Value>) -> axum::response::Response {
    let streaming = body["stream"].as_bool().unwrap_or(false);
    seen.0.lock().unwrap().push(body);

    if streaming {
        let mut sse = String::new();
        for part in ["Cells ", "are ", "small."] {
            let chunk = json!({ "choices": [{ "delta": { "content": part } }] });
            sse.push_str(&format!("data: {}\n\n", chunk));
        }
        sse.push_str("data: [DONE]\n\n");
        ([(header::CONTENT_TYPE, "text/event-stream")], sse).into_response()
    } else {
        Json(json!({
            "choices": [{ "message": { "role": "assistant", "content": "The membrane is selective." } }]
        }))
        .into_response()
    }
}

async fn start_fake_provider(seen: Seen) -> String {
    let app = Router::new()
        .route("/v1/embeddings", post(fake_embeddings))
        .route("/v1/chat/completions", post(fake_completions))
        .with_state(seen);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}/v1", addr)
}

fn token(sub: &str, exp_offset_secs: i64) -> String {
    let exp = chrono::Utc::now().timestamp() + exp_offset_secs;
    encode_hs256(&json!({ "sub": sub, "exp": exp }), JWT_SECRET.as_bytes()).unwrap()
}

struct Stack {
    _tmp: TempDir,
    base: String,
    client: reqwest::Client,
    store: SqliteStore,
    seen: Seen,
}

async fn start_stack() -> Stack {
    start_stack_with(true).await
}

async fn start_stack_with(embeddings: bool) -> Stack {
    std::env::set_var(PROVIDER_KEY_ENV, "test-key");
    std::env::set_var(JWT_SECRET_ENV, JWT_SECRET);

    let seen = Seen::default();
    let provider_url = start_fake_provider(seen.clone()).await;

    let tmp = TempDir::new().unwrap();
    let mut config = Config::minimal(tmp.path().join("campus.sqlite"));
    config.embedding.provider = "openai".into();
    config.embedding.model = Some("text-embedding-3-small".into());
    config.embedding.dims = Some(2);
    config.embedding.url = Some(provider_url.clone());
    config.embedding.api_key_env = PROVIDER_KEY_ENV.into();
    config.embedding.max_retries = 0;
    if !embeddings {
        config.embedding.provider = "disabled".into();
    }
    config.generation.provider = "openai".into();
    config.generation.model = Some("gpt-4o-mini".into());
    config.generation.url = provider_url;
    config.generation.api_key_env = PROVIDER_KEY_ENV.into();
    config.identity.jwt_secret_env = JWT_SECRET_ENV.into();

    let state = AppState::from_config(&config).await.unwrap();

    let store = SqliteStore::new(db::connect(&config).await.unwrap());
    store.upsert_student("stu-1", Some("Ada")).await.unwrap();
    store.set_role("admin-1", UserRole::Admin).await.unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });

    Stack {
        _tmp: tmp,
        base: format!("http://{}", addr),
        client: reqwest::Client::new(),
        store,
        seen,
    }
}

impl Stack {
    async fn post(&self, path: &str, token: &str, body: Value) -> reqwest::Response {
        self.client
            .post(format!("{}{}", self.base, path))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn test_ingest_search_and_chat_over_sqlite() {
    let stack = start_stack().await;
    let admin = token("admin-1", 3600);
    let student = token("stu-1", 3600);

    let resp = stack
        .post(
            "/documents",
            &admin,
            json!({
                "name": "biology/cells.md",
                "content": "The cell membrane is selectively permeable.\n\nRibosomes build proteins."
            }),
        )
        .await;
    assert_eq!(resp.status(), 200);
    let report: Value = resp.json().await.unwrap();
    assert_eq!(report["documentName"], "biology_cells.md");
    assert_eq!(stack.store.chunk_count().await.unwrap(), 1);

    let resp = stack.post("/search", &student, json!({ "query": "cell" })).await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["results"][0]["documentName"], "biology_cells.md");
    assert_eq!(body["searchTypes"]["vector"], 1);

    let resp = stack
        .post(
            "/chat",
            &student,
            json!({ "message": "What does the cell membrane do?", "studentId": "stu-1", "useRag": true }),
        )
        .await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["response"], "The membrane is selective.");

    let first = stack.seen.0.lock().unwrap()[0].to_string();
    assert!(first.contains("selectively permeable"));
    assert!(first.contains("gpt-4o-mini"));

    let resp = stack
        .post(
            "/chat",
            &student,
            json!({ "message": "How big are cells?", "studentId": "stu-1", "stream": true }),
        )
        .await;
    assert_eq!(resp.status(), 200);
    let text = resp.text().await.unwrap();
    assert!(text.contains("event: done"));

    let log = stack.store.recent("stu-1", None, 10).await.unwrap();
    let turns: Vec<(MessageRole, &str)> = log.iter().map(|m| (m.role, m.content.as_str())).collect();
    assert_eq!(
        turns,
        vec![
            (MessageRole::User, "What does the cell membrane do?"),
            (MessageRole::Assistant, "The membrane is selective."),
            (MessageRole::User, "How big are cells?"),
            (MessageRole::Assistant, "Cells are small."),
        ]
    );
}

#[tokio::test]
async fn test_expired_and_forged_tokens_are_rejected() {
    let stack = start_stack().await;
    let body = json!({ "message": "hi", "studentId": "stu-1" });

    let resp = stack.post("/chat", &token("stu-1", -10), body.clone()).await;
    assert_eq!(resp.status(), 401);

    let exp = chrono::Utc::now().timestamp() + 3600;
    let forged = encode_hs256(&json!({ "sub": "admin-1", "exp": exp }), b"wrong-secret").unwrap();
    let resp = stack
        .post("/documents", &forged, json!({ "name": "x.md", "content": "x" }))
        .await;
    assert_eq!(resp.status(), 401);
    assert!(stack.seen.0.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_search_without_embeddings_uses_keywords() {
    let stack = start_stack_with(false).await;
    let admin = token("admin-1", 3600);

    let resp = stack
        .post(
            "/documents",
            &admin,
            json!({ "name": "cells.md", "content": "The cell membrane is selectively permeable." }),
        )
        .await;
    assert_eq!(resp.status(), 200);

    let resp = stack.post("/search", &admin, json!({ "query": "membrane" })).await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["totalFound"], 1);
    assert_eq!(body["searchTypes"]["vector"], 0);
    assert_eq!(body["searchTypes"]["keyword"], 1);
    assert!(stack.seen.0.lock().unwrap().is_empty());
}
