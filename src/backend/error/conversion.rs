/**
 * Error Conversion
 *
 * `BackendError` renders as the uniform API envelope so handlers can
 * return it directly:
 *
 * ```json
 * {
 *   "success": false,
 *   "message": "operation abc has already been queued",
 *   "data": { "kind": "DuplicateOperation" }
 * }
 * ```
 */
use axum::{
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::backend::error::types::BackendError;

impl IntoResponse for BackendError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("[Server] {} ({})", self.message(), self.kind());
        }
        let body = json!({
            "success": false,
            "message": self.message(),
            "data": { "kind": self.kind() },
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use axum::http::StatusCode;

    #[tokio::test]
    async fn test_error_envelope_shape() {
        let response = BackendError::busy("sync already running").into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["message"], "sync already running");
        assert_eq!(body["data"]["kind"], "Busy");
    }
}
