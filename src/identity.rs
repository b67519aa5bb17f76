//! Identity backends.
//!
//! - [`JwtIdentity`] verifies HS256 bearer tokens locally using the secret
//!   from `identity.jwt_secret_env`. The caller id is the `sub` claim.
//! - [`RemoteIdentity`] asks an auth service (`GET {url}/auth/v1/user`)
//!   to resolve the token, sending the service key as an `apikey` header.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::Deserialize;

use campus_chat_core::error::{PipelineError, PipelineResult};
use campus_chat_core::identity::IdentityBackend;

use crate::config::IdentityConfig;

/// Build the identity backend selected by `config.provider`.
pub fn create_identity_backend(config: &IdentityConfig) -> Result<Arc<dyn IdentityBackend>> {
    match config.provider.as_str() {
        "jwt" => {
            let secret = std::env::var(&config.jwt_secret_env)
                .map_err(|_| anyhow!("{} environment variable not set", config.jwt_secret_env))?;
            Ok(Arc::new(JwtIdentity::new(secret.into_bytes())))
        }
        "remote" => Ok(Arc::new(RemoteIdentity::new(config)?)),
        other => anyhow::bail!("Unknown identity provider: {}", other),
    }
}

/// Tokens must carry `sub` and `exp`, and are checked against `nbf` when
/// present. No clock leeway is granted and `aud` is not checked.
pub struct JwtIdentity {
    key: DecodingKey,
    validation: Validation,
}

#[derive(Debug, Deserialize)]
struct JwtClaims {
    sub: String,
}

impl JwtIdentity {
    pub fn new(secret: Vec<u8>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_nbf = true;
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            key: DecodingKey::from_secret(&secret),
            validation,
        }
    }

    fn verify(&self, token: &str) -> PipelineResult<String> {
        let data = decode::<JwtClaims>(token, &self.key, &self.validation).map_err(|e| {
            let why = match e.kind() {
                ErrorKind::ExpiredSignature => "token expired".to_string(),
                ErrorKind::ImmatureSignature => "token not yet valid".to_string(),
                ErrorKind::InvalidSignature => "invalid token signature".to_string(),
                ErrorKind::InvalidAlgorithm => "unsupported token algorithm".to_string(),
                ErrorKind::MissingRequiredClaim(claim) => format!("token has no {} claim", claim),
                _ => "malformed token".to_string(),
            };
            tracing::debug!(error = %e, "bearer token rejected");
            PipelineError::Authentication(why)
        })?;

        let sub = data.claims.sub;
        if sub.trim().is_empty() {
            return Err(PipelineError::Authentication("token has no subject".into()));
        }
        Ok(sub)
    }
}

#[async_trait]
impl IdentityBackend for JwtIdentity {
    async fn resolve_identity(&self, credential: &str) -> PipelineResult<String> {
        self.verify(credential)
    }
}

/// Sign `claims` as an HS256 token with `secret`.
pub fn encode_hs256(claims: &serde_json::Value, secret: &[u8]) -> Result<String> {
    Ok(encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(secret),
    )?)
}

pub struct RemoteIdentity {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RemoteUser {
    id: String,
}

impl RemoteIdentity {
    pub fn new(config: &IdentityConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| anyhow!("identity.url required for remote provider"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            api_key: std::env::var(&config.api_key_env).ok(),
        })
    }
}

#[async_trait]
impl IdentityBackend for RemoteIdentity {
    async fn resolve_identity(&self, credential: &str) -> PipelineResult<String> {
        let mut request = self
            .client
            .get(format!("{}/auth/v1/user", self.url))
            .bearer_auth(credential);
        if let Some(key) = &self.api_key {
            request = request.header("apikey", key);
        }

        let response = request.send().await.map_err(PipelineError::upstream)?;
        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(PipelineError::Authentication(
                "credential rejected by identity service".into(),
            ));
        }
        if !status.is_success() {
            return Err(PipelineError::upstream(format!(
                "identity service returned {}",
                status
            )));
        }

        let user: RemoteUser = response.json().await.map_err(PipelineError::upstream)?;
        if user.id.trim().is_empty() {
            return Err(PipelineError::Authentication("identity has no id".into()));
        }
        Ok(user.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SECRET: &[u8] = b"test-secret";

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    fn identity() -> JwtIdentity {
        JwtIdentity::new(SECRET.to_vec())
    }

    #[test]
    fn test_valid_token_resolves_subject() {
        let token = encode_hs256(&json!({"sub": "teacher-7", "exp": now() + 3600}), SECRET).unwrap();
        assert_eq!(identity().verify(&token).unwrap(), "teacher-7");
    }

    #[test]
    fn test_expired_token_rejected() {
        let token = encode_hs256(&json!({"sub": "s", "exp": now() - 5}), SECRET).unwrap();
        let err = identity().verify(&token).unwrap_err();
        assert!(matches!(err, PipelineError::Authentication(ref m) if m.contains("expired")));
    }

    #[test]
    fn test_future_nbf_rejected() {
        let claims = json!({"sub": "s", "nbf": now() + 3600, "exp": now() + 7200});
        let token = encode_hs256(&claims, SECRET).unwrap();
        let err = identity().verify(&token).unwrap_err();
        assert!(err.to_string().contains("not yet valid"));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = encode_hs256(&json!({"sub": "s", "exp": now() + 3600}), b"other").unwrap();
        let err = identity().verify(&token).unwrap_err();
        assert!(err.to_string().contains("signature"));
    }

    #[test]
    fn test_alg_none_rejected() {
        // {"alg":"none","typ":"JWT"} . {"sub":"s","exp":9999999999} . (empty signature)
        let token = "eyJhbGciOiJub25lIiwidHlwIjoiSldUIn0.eyJzdWIiOiJzIiwiZXhwIjo5OTk5OTk5OTk5fQ.";
        let err = identity().verify(token).unwrap_err();
        assert!(matches!(err, PipelineError::Authentication(_)));
    }

    #[test]
    fn test_other_hmac_algorithm_rejected() {
        let token = encode(
            &Header::new(Algorithm::HS512),
            &json!({"sub": "s", "exp": now() + 3600}),
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap();
        let err = identity().verify(&token).unwrap_err();
        assert!(err.to_string().contains("algorithm"));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(identity().verify("not-a-token").is_err());
        assert!(identity().verify("a.b.c.d").is_err());
    }

    #[test]
    fn test_missing_subject_or_expiry_rejected() {
        let no_sub = encode_hs256(&json!({"exp": now() + 3600}), SECRET).unwrap();
        assert!(identity().verify(&no_sub).is_err());
        let blank_sub = encode_hs256(&json!({"sub": " ", "exp": now() + 3600}), SECRET).unwrap();
        assert!(identity().verify(&blank_sub).is_err());
        let no_exp = encode_hs256(&json!({"sub": "s"}), SECRET).unwrap();
        let err = identity().verify(&no_exp).unwrap_err();
        assert!(err.to_string().contains("exp"));
    }
}
