//! Bearer token verification.
//!
//! Tokens are HS256 JWTs carrying a `user_id` claim. Issuing lives here too
//! so operators and tests can mint tokens against the configured secret.

use std::sync::Arc;

use axum::extract::{FromRef, FromRequestParts, Query};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use parley_core::UserId;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

/// Token verification and signing failures.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// No bearer header and no `token` query parameter.
    #[error("missing bearer token")]
    Missing,
    #[error("token expired")]
    Expired,
    /// Bad signature, malformed token or missing claims.
    #[error("invalid token: {0}")]
    Invalid(String),
    #[error("failed to sign token: {0}")]
    Signing(String),
}

/// JWT claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Authenticated user.
    pub user_id: String,
    pub exp: i64,
    pub iat: i64,
    pub nbf: i64,
}

struct Keys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

/// Verifies and issues tokens for one shared secret.
#[derive(Clone)]
pub struct TokenService {
    keys: Arc<Keys>,
    validation: Validation,
    ttl_secs: i64,
}

impl TokenService {
    /// HS256 keys for `secret`; issued tokens live `ttl_secs`.
    pub fn new(secret: &str, ttl_secs: u64) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_nbf = true;
        validation.set_required_spec_claims(&["exp", "nbf"]);
        Self {
            keys: Arc::new(Keys {
                encoding: EncodingKey::from_secret(secret.as_bytes()),
                decoding: DecodingKey::from_secret(secret.as_bytes()),
            }),
            validation,
            ttl_secs: i64::try_from(ttl_secs).unwrap_or(i64::MAX),
        }
    }

    /// Mint a token for `user` valid for the configured TTL.
    pub fn issue(&self, user: &UserId) -> Result<String, AuthError> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            user_id: user.to_string(),
            exp: now.saturating_add(self.ttl_secs),
            iat: now,
            nbf: now,
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.keys.encoding)
            .map_err(|e| AuthError::Signing(e.to_string()))
    }

    /// Verify `token` and return the user it was issued to.
    pub fn verify(&self, token: &str) -> Result<UserId, AuthError> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.keys.decoding, &self.validation)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid(e.to_string()),
            })?;
        if data.claims.user_id.is_empty() {
            return Err(AuthError::Invalid("empty user_id".into()));
        }
        Ok(UserId::from_raw(data.claims.user_id))
    }
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// The authenticated caller of a request.
///
/// Reads `Authorization: Bearer <token>`, falling back to a `token` query
/// parameter for WebSocket upgrades from browsers.
#[derive(Debug, Clone)]
pub struct AuthUser(pub UserId);

fn bearer(parts: &Parts) -> Option<String> {
    if let Some(header) = parts.headers.get(AUTHORIZATION) {
        return header
            .to_str()
            .ok()
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|t| t.trim().to_string());
    }
    Query::<TokenQuery>::try_from_uri(&parts.uri)
        .ok()
        .and_then(|Query(q)| q.token)
}

impl<S> FromRequestParts<S> for AuthUser
where
    TokenService: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let token = bearer(parts).filter(|t| !t.is_empty()).ok_or(AuthError::Missing)?;
        let tokens = TokenService::from_ref(state);
        let user = tokens.verify(&token)?;
        Ok(Self(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> TokenService {
        TokenService::new("test-secret", 3600)
    }

    #[test]
    fn issue_then_verify() {
        let svc = service();
        let token = svc.issue(&UserId::from_raw("alice")).unwrap();
        assert_eq!(svc.verify(&token).unwrap(), UserId::from_raw("alice"));
    }

    #[test]
    fn wrong_secret_rejected() {
        let token = service().issue(&UserId::from_raw("alice")).unwrap();
        let other = TokenService::new("other-secret", 3600);
        assert!(matches!(other.verify(&token), Err(AuthError::Invalid(_))));
    }

    #[test]
    fn garbage_rejected() {
        assert!(matches!(service().verify("not.a.jwt"), Err(AuthError::Invalid(_))));
    }

    #[test]
    fn expired_rejected() {
        let now = Utc::now().timestamp();
        let claims = Claims {
            user_id: "alice".into(),
            exp: now - 3600,
            iat: now - 7200,
            nbf: now - 7200,
        };
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap();
        assert!(matches!(service().verify(&token), Err(AuthError::Expired)));
    }

    #[test]
    fn empty_user_rejected() {
        let svc = service();
        let token = svc.issue(&UserId::from_raw("")).unwrap();
        assert!(matches!(svc.verify(&token), Err(AuthError::Invalid(_))));
    }

    #[test]
    fn bearer_from_header_or_query() {
        let (parts, ()) = axum::http::Request::builder()
            .uri("/api/chat/ws?token=q")
            .header(AUTHORIZATION, "Bearer h")
            .body(())
            .unwrap()
            .into_parts();
        assert_eq!(bearer(&parts).as_deref(), Some("h"));

        let (parts, ()) = axum::http::Request::builder()
            .uri("/api/chat/ws?device=phone&token=q")
            .body(())
            .unwrap()
            .into_parts();
        assert_eq!(bearer(&parts).as_deref(), Some("q"));

        let (parts, ()) = axum::http::Request::builder()
            .uri("/api/chat/ws")
            .header(AUTHORIZATION, "Basic abc")
            .body(())
            .unwrap()
            .into_parts();
        assert_eq!(bearer(&parts), None);
    }
}
