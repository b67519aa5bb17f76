//! Error taxonomy for the chat and retrieval pipeline.
//!
//! Every pipeline stage fails with a [`PipelineError`]. The HTTP layer maps
//! each variant to a status code and a stable machine-readable category
//! (see [`PipelineError::category`]).

/// Terminal failure of a pipeline stage.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PipelineError {
    /// Malformed or missing request fields.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Credential absent, expired, or rejected.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Authenticated identity lacks the required role.
    #[error("not authorized: {0}")]
    Authorization(String),

    /// A referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller exceeded its request ceiling for the current window.
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Embedding, search, identity, or generation backend failure.
    #[error("upstream failure: {0}")]
    Upstream(String),

    /// Chat log write failure. Never surfaced as a chat request failure.
    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl PipelineError {
    /// Stable category string used in error response bodies.
    pub fn category(&self) -> &'static str {
        match self {
            PipelineError::Validation(_) => "validation_error",
            PipelineError::Authentication(_) => "authentication_error",
            PipelineError::Authorization(_) => "authorization_error",
            PipelineError::NotFound(_) => "not_found",
            PipelineError::RateLimited { .. } => "rate_limited",
            PipelineError::Upstream(_) => "upstream_error",
            PipelineError::Persistence(_) => "persistence_error",
        }
    }

    /// Whether the detail text is safe to return to the caller.
    ///
    /// Upstream and persistence details can carry provider payloads or
    /// storage paths and are only logged.
    pub fn is_client_facing(&self) -> bool {
        !matches!(
            self,
            PipelineError::Upstream(_) | PipelineError::Persistence(_)
        )
    }

    pub fn upstream(err: impl std::fmt::Display) -> Self {
        PipelineError::Upstream(err.to_string())
    }

    pub fn persistence(err: impl std::fmt::Display) -> Self {
        PipelineError::Persistence(err.to_string())
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
