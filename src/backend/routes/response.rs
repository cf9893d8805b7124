/**
 * API Response Envelope
 *
 * Every REST response, success or error, has the same shape:
 *
 * ```json
 * { "success": true, "message": "...", "data": { ... }, "request_id": "..." }
 * ```
 *
 * Errors are rendered by `BackendError`'s `IntoResponse` with
 * `success: false` and the error kind under `data.kind`.
 */
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::backend::middleware::AuthUser;

#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
            request_id: None,
            trace_id: None,
        }
    }

    /// Echo the caller's request and trace ids
    pub fn for_user(mut self, user: &AuthUser) -> Self {
        self.request_id = user.request_id.clone();
        self.trace_id = user.trace_id.clone();
        self
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        (StatusCode::OK, Json(self)).into_response()
    }
}

/// `?limit=` with a default and a ceiling
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

pub const DEFAULT_LIMIT: usize = 50;
pub const MAX_LIMIT: usize = 500;

impl LimitQuery {
    pub fn resolve(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}
