/**
 * Session Tokens
 *
 * HS256 JWTs carrying the numeric user id in `sub`. Issuing tokens is not
 * part of the server's HTTP surface; `create_token` exists for tooling and
 * tests that need a credential the server will accept.
 */
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::backend::error::BackendError;
use crate::shared::UserId;

/// JWT claims structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    /// User ID
    pub sub: String,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
    /// Issued at time (Unix timestamp)
    pub iat: u64,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Create a JWT token for a user
pub fn create_token(user_id: UserId, secret: &str, ttl: Duration) -> Result<String, BackendError> {
    let now = unix_now();
    let claims = Claims {
        sub: user_id.to_string(),
        exp: now + ttl.as_secs(),
        iat: now,
    };
    let key = EncodingKey::from_secret(secret.as_bytes());
    encode(&Header::default(), &claims, &key)
        .map_err(|e| BackendError::fatal(format!("token encoding failed: {}", e)))
}

/// Verify and decode a JWT token
pub fn verify_token(token: &str, secret: &str) -> Result<Claims, BackendError> {
    let key = DecodingKey::from_secret(secret.as_bytes());
    let data = decode::<Claims>(token, &key, &Validation::default()).map_err(|e| {
        tracing::debug!("[Auth] Token rejected: {}", e);
        BackendError::unauthenticated("invalid or expired token")
    })?;
    Ok(data.claims)
}

/// Extract the user id from a token
pub fn user_id_from_token(token: &str, secret: &str) -> Result<UserId, BackendError> {
    let claims = verify_token(token, secret)?;
    claims
        .sub
        .parse::<UserId>()
        .map_err(|_| BackendError::unauthenticated("token subject is not a user id"))
}
