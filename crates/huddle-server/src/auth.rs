//! Bearer token authentication.
//!
//! Tokens are HS256 JWTs whose `sub` claim is the numeric user id. REST
//! callers send `Authorization: Bearer <token>`; browsers cannot set headers
//! on a WebSocket handshake, so `?token=<token>` is accepted as well.

use crate::api::ApiError;
use crate::handlers::AppState;
use axum::async_trait;
use axum::extract::{FromRequestParts, Query};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tenvis_huddle_core::UserId;
use tracing::debug;

/// Header carrying the shared secret for internal calls.
pub const INTERNAL_TOKEN_HEADER: &str = "x-internal-token";

const JWT_ALGORITHM: Algorithm = Algorithm::HS256;

/// JWT claims.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Subject (user id)
    pub sub: String,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
}

/// Signs and verifies bearer tokens with a shared secret.
#[derive(Clone)]
pub struct TokenKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl std::fmt::Debug for TokenKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenKeys").finish_non_exhaustive()
    }
}

impl TokenKeys {
    #[must_use]
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(JWT_ALGORITHM),
        }
    }

    /// Issue a token for a user.
    ///
    /// # Errors
    ///
    /// Returns an error if signing fails.
    pub fn issue(&self, user_id: UserId, ttl: Duration) -> jsonwebtoken::errors::Result<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.to_string(),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        };
        encode(&Header::new(JWT_ALGORITHM), &claims, &self.encoding)
    }

    /// Verify a token and return its user id.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Unauthenticated`] for a bad signature, an expired
    /// token or a non-numeric subject.
    pub fn verify(&self, token: &str) -> Result<UserId, ApiError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation).map_err(|e| {
            debug!(error = %e, "Rejected bearer token");
            ApiError::Unauthenticated
        })?;
        data.claims
            .sub
            .parse()
            .map_err(|_| ApiError::Unauthenticated)
    }
}

/// The authenticated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser {
    pub id: UserId,
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

fn bearer_token(parts: &Parts) -> Option<String> {
    let header = parts.headers.get(AUTHORIZATION)?.to_str().ok()?;
    header
        .strip_prefix("Bearer ")
        .map(|token| token.trim().to_string())
}

fn query_token(parts: &Parts) -> Option<String> {
    Query::<TokenQuery>::try_from_uri(&parts.uri)
        .ok()
        .and_then(|Query(query)| query.token)
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)
            .or_else(|| query_token(parts))
            .ok_or(ApiError::Unauthenticated)?;
        let id = state.tokens.verify(&token)?;
        Ok(Self { id })
    }
}

/// A caller holding the internal shared secret.
#[derive(Debug, Clone, Copy)]
pub struct InternalCaller;

#[async_trait]
impl FromRequestParts<Arc<AppState>> for InternalCaller {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let expected = state
            .config
            .auth
            .internal_token
            .as_deref()
            .ok_or(ApiError::Unauthenticated)?;
        let presented = parts
            .headers
            .get(INTERNAL_TOKEN_HEADER)
            .and_then(|value| value.to_str().ok())
            .ok_or(ApiError::Unauthenticated)?;

        if presented == expected {
            Ok(Self)
        } else {
            Err(ApiError::Unauthenticated)
        }
    }
}
