//! Identity & access gate.
//!
//! [`AccessGate`] resolves a bearer credential to an [`Identity`] through an
//! [`IdentityBackend`] and a [`RoleStore`], and checks roles for
//! privileged operations. Resolution is a read-only lookup.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{PipelineError, PipelineResult};
use crate::models::{Identity, UserRole};
use crate::store::RoleStore;

/// Resolves a bearer credential to a caller id.
///
/// Implementations return [`PipelineError::Authentication`] for rejected,
/// expired, or malformed credentials and [`PipelineError::Upstream`] when
/// the identity service itself cannot be reached.
#[async_trait]
pub trait IdentityBackend: Send + Sync {
    async fn resolve_identity(&self, credential: &str) -> PipelineResult<String>;
}

/// Extract the token from an `Authorization` header value.
///
/// Accepts `Bearer` and `bearer` prefixes; blank tokens yield `None`.
pub fn extract_bearer(header: Option<&str>) -> Option<&str> {
    let value = header?;
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

pub struct AccessGate {
    backend: Arc<dyn IdentityBackend>,
    roles: Arc<dyn RoleStore>,
}

impl AccessGate {
    pub fn new(backend: Arc<dyn IdentityBackend>, roles: Arc<dyn RoleStore>) -> Self {
        Self { backend, roles }
    }

    /// Resolve the caller behind `credential`.
    ///
    /// A missing profile row means the caller is a plain student.
    pub async fn authenticate(&self, credential: Option<&str>) -> PipelineResult<Identity> {
        let credential = credential
            .ok_or_else(|| PipelineError::Authentication("missing bearer credential".into()))?;
        let id = self.backend.resolve_identity(credential).await?;
        let role = self
            .roles
            .lookup_role(&id)
            .await
            .map_err(PipelineError::upstream)?
            .unwrap_or(UserRole::Student);
        Ok(Identity { id, role })
    }

    /// Fail with [`PipelineError::Authorization`] unless `identity` holds `required`.
    pub fn authorize(&self, identity: &Identity, required: UserRole) -> PipelineResult<()> {
        if identity.role.satisfies(required) {
            Ok(())
        } else {
            Err(PipelineError::Authorization(format!(
                "role '{}' required",
                required.as_str()
            )))
        }
    }
}
