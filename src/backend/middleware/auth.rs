/**
 * Authentication Extractor
 *
 * `AuthUser` pulls the bearer token out of the `Authorization` header,
 * verifies it against the configured secret and hands the user id to the
 * handler. It also captures the request and trace ids so handlers can echo
 * them in the response envelope.
 */
use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, HeaderMap},
};

use crate::backend::auth::sessions::user_id_from_token;
use crate::backend::error::BackendError;
use crate::backend::server::state::AppState;
use crate::shared::UserId;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const TRACE_ID_HEADER: &str = "x-trace-id";

/// Authenticated caller of a REST handler
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: UserId,
    pub request_id: Option<String>,
    pub trace_id: Option<String>,
}

/// Token from `Authorization: Bearer <token>`
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = BackendError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers).ok_or_else(|| {
            tracing::warn!("[Auth] Missing or malformed Authorization header");
            BackendError::unauthenticated("missing bearer token")
        })?;
        let user_id = user_id_from_token(token, &state.config.auth.jwt_secret)?;

        Ok(AuthUser {
            user_id,
            request_id: header_string(&parts.headers, REQUEST_ID_HEADER),
            trace_id: header_string(&parts.headers, TRACE_ID_HEADER),
        })
    }
}
