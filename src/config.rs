//! TOML configuration.
//!
//! Every section except `[db]` and `[server]` has defaults, so a minimal
//! config file is:
//!
//! ```toml
//! [db]
//! path = "./data/campus-chat.sqlite"
//!
//! [server]
//! bind = "127.0.0.1:8787"
//! ```
//!
//! Secrets are never stored in the file; sections name the environment
//! variable to read them from.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use campus_chat_core::retry::RetryPolicy;
use campus_chat_core::search::{
    RetrievalParams, DEFAULT_KEYWORD_SCORE, DEFAULT_MATCH_COUNT, DEFAULT_MATCH_THRESHOLD,
    DEFAULT_MAX_MATCH_COUNT,
};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
}

impl Config {
    /// Defaults for every section, with the database at `db_path`.
    pub fn minimal(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            server: ServerConfig {
                bind: "127.0.0.1:8787".to_string(),
            },
            retrieval: RetrievalConfig::default(),
            rate_limit: RateLimitConfig::default(),
            chat: ChatConfig::default(),
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            generation: GenerationConfig::default(),
            identity: IdentityConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

/// What the chat pipeline does when the query embedding cannot be produced.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingFailurePolicy {
    /// Fail the request with an upstream error.
    #[default]
    Abort,
    /// Generate without retrieved context.
    Continue,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_match_threshold")]
    pub match_threshold: f64,
    #[serde(default = "default_match_count")]
    pub match_count: usize,
    #[serde(default = "default_max_match_count")]
    pub max_match_count: usize,
    #[serde(default = "default_keyword_score")]
    pub keyword_score: f64,
    #[serde(default = "default_search_timeout_secs")]
    pub search_timeout_secs: u64,
    #[serde(default)]
    pub on_embedding_failure: EmbeddingFailurePolicy,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            match_count: DEFAULT_MATCH_COUNT,
            max_match_count: DEFAULT_MAX_MATCH_COUNT,
            keyword_score: DEFAULT_KEYWORD_SCORE,
            search_timeout_secs: default_search_timeout_secs(),
            on_embedding_failure: EmbeddingFailurePolicy::Abort,
        }
    }
}

impl RetrievalConfig {
    pub fn params(&self) -> RetrievalParams {
        RetrievalParams {
            match_threshold: self.match_threshold,
            match_count: self.match_count,
            keyword_score: self.keyword_score,
        }
    }
}

fn default_match_threshold() -> f64 {
    DEFAULT_MATCH_THRESHOLD
}
fn default_match_count() -> usize {
    DEFAULT_MATCH_COUNT
}
fn default_max_match_count() -> usize {
    DEFAULT_MAX_MATCH_COUNT
}
fn default_keyword_score() -> f64 {
    DEFAULT_KEYWORD_SCORE
}
fn default_search_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            max_requests: default_max_requests(),
        }
    }
}

fn default_window_secs() -> u64 {
    60
}
fn default_max_requests() -> u32 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,
    /// Prior turns replayed to the model; 0 disables conversation memory.
    #[serde(default)]
    pub history_turns: usize,
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            max_message_chars: default_max_message_chars(),
            history_turns: 0,
            stream_buffer: default_stream_buffer(),
        }
    }
}

fn default_system_prompt() -> String {
    "You are a patient tutor helping a student with their coursework. \
     Explain step by step and encourage the student to reason for themselves."
        .to_string()
}
fn default_max_message_chars() -> usize {
    4000
}
fn default_stream_buffer() -> usize {
    32
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_max_tokens() -> usize {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL override (Ollama, or an OpenAI-compatible proxy).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_openai_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_embedding_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            dims: None,
            url: None,
            api_key_env: default_openai_key_env(),
            batch_size: default_batch_size(),
            max_retries: default_embedding_retries(),
            timeout_secs: default_embedding_timeout(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::backoff(self.max_retries)
    }
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_openai_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_embedding_retries() -> u32 {
    2
}
fn default_embedding_timeout() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_generation_url")]
    pub url: String,
    #[serde(default = "default_openai_key_env")]
    pub api_key_env: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Retries are opt-in; the default is a single attempt.
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_generation_timeout")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            url: default_generation_url(),
            api_key_env: default_openai_key_env(),
            temperature: None,
            max_tokens: None,
            max_retries: 0,
            timeout_secs: default_generation_timeout(),
        }
    }
}

impl GenerationConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::backoff(self.max_retries)
    }
}

fn default_generation_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_generation_timeout() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct IdentityConfig {
    /// `"jwt"` (verify HS256 tokens locally) or `"remote"` (ask the auth service).
    #[serde(default = "default_identity_provider")]
    pub provider: String,
    #[serde(default = "default_jwt_secret_env")]
    pub jwt_secret_env: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_auth_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_identity_timeout")]
    pub timeout_secs: u64,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            provider: default_identity_provider(),
            jwt_secret_env: default_jwt_secret_env(),
            url: None,
            api_key_env: default_auth_key_env(),
            timeout_secs: default_identity_timeout(),
        }
    }
}

fn default_identity_provider() -> String {
    "jwt".to_string()
}
fn default_jwt_secret_env() -> String {
    "CAMPUS_JWT_SECRET".to_string()
}
fn default_auth_key_env() -> String {
    "CAMPUS_AUTH_API_KEY".to_string()
}
fn default_identity_timeout() -> u64 {
    10
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if !(0.0..=1.0).contains(&config.retrieval.match_threshold) {
        anyhow::bail!("retrieval.match_threshold must be in [0.0, 1.0]");
    }
    if config.retrieval.match_count == 0 {
        anyhow::bail!("retrieval.match_count must be >= 1");
    }
    if config.retrieval.match_count > config.retrieval.max_match_count {
        anyhow::bail!("retrieval.match_count must not exceed retrieval.max_match_count");
    }
    if config.rate_limit.max_requests == 0 {
        anyhow::bail!("rate_limit.max_requests must be >= 1");
    }
    if config.chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }
    if config.chat.stream_buffer == 0 {
        anyhow::bail!("chat.stream_buffer must be > 0");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }
    if config.embedding.is_enabled() {
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.generation.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown generation provider: '{}'. Must be disabled or openai.",
            other
        ),
    }
    if config.generation.is_enabled() && config.generation.model.is_none() {
        anyhow::bail!("generation.model must be specified when generation is enabled");
    }

    match config.identity.provider.as_str() {
        "jwt" => {}
        "remote" => {
            if config.identity.url.is_none() {
                anyhow::bail!("identity.url is required when identity.provider = 'remote'");
            }
        }
        other => anyhow::bail!(
            "Unknown identity provider: '{}'. Must be jwt or remote.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &str) -> Result<Config> {
        let text = format!(
            "[db]\npath = \"./x.sqlite\"\n\n[server]\nbind = \"127.0.0.1:0\"\n{}",
            extra
        );
        let config: Config = toml::from_str(&text)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_minimal_config_defaults() {
        let c = parse("").unwrap();
        assert!((c.retrieval.match_threshold - 0.78).abs() < 1e-9);
        assert_eq!(c.retrieval.match_count, 5);
        assert_eq!(c.retrieval.on_embedding_failure, EmbeddingFailurePolicy::Abort);
        assert_eq!(c.rate_limit.window_secs, 60);
        assert_eq!(c.generation.retry_policy(), RetryPolicy::None);
        assert!(!c.embedding.is_enabled());
        assert_eq!(c.identity.provider, "jwt");
    }

    #[test]
    fn test_embedding_requires_model_and_dims() {
        let err = parse("[embedding]\nprovider = \"openai\"\n").unwrap_err();
        assert!(err.to_string().contains("embedding.model"));
        assert!(parse(
            "[embedding]\nprovider = \"openai\"\nmodel = \"text-embedding-3-small\"\ndims = 1536\n"
        )
        .is_ok());
    }

    #[test]
    fn test_remote_identity_requires_url() {
        assert!(parse("[identity]\nprovider = \"remote\"\n").is_err());
    }

    #[test]
    fn test_on_embedding_failure_continue() {
        let c = parse("[retrieval]\non_embedding_failure = \"continue\"\n").unwrap();
        assert_eq!(
            c.retrieval.on_embedding_failure,
            EmbeddingFailurePolicy::Continue
        );
    }

    #[test]
    fn test_example_config_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/campus-chat.example.toml");
        let c = load_config(&path).unwrap();
        assert_eq!(c.embedding.dims, Some(1536));
        assert_eq!(c.generation.model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(c.rate_limit.max_requests, 10);
    }

    #[test]
    fn test_invalid_threshold() {
        assert!(parse("[retrieval]\nmatch_threshold = 1.5\n").is_err());
    }

    #[test]
    fn test_match_count_above_ceiling() {
        assert!(parse("[retrieval]\nmatch_count = 20\nmax_match_count = 10\n").is_err());
        let c = parse("[retrieval]\nmatch_count = 20\n").unwrap();
        assert_eq!(c.retrieval.max_match_count, 50);
    }
}
