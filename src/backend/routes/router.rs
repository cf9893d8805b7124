/**
 * Router Configuration
 *
 * Combines the realtime endpoint, the REST API and the tower-http layers
 * into a single Axum router.
 *
 * # Layers
 *
 * Outermost first:
 * 1. `SetRequestIdLayer` - assigns `x-request-id` when the client sent none
 * 2. `TraceLayer` - one span per request
 * 3. `PropagateRequestIdLayer` - copies the id onto the response
 *
 * Handlers read the id through `AuthUser` and echo it in the envelope.
 */

use axum::{routing::get, Json, Router};
use serde_json::{json, Value};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[cfg(feature = "ssr")]
use crate::backend::realtime::ws_handler;
#[cfg(feature = "ssr")]
use crate::backend::routes::api_routes::configure_api_routes;
#[cfg(feature = "ssr")]
use crate::backend::server::state::AppState;

/// Liveness check
async fn health() -> Json<Value> {
    Json(json!({ "success": true, "message": "ok" }))
}

/// Create the Axum router with all routes configured
///
/// - `GET /health` - liveness check
/// - `GET /ws` - WebSocket upgrade into a hub session
/// - REST routes from [`configure_api_routes`]
#[cfg(feature = "ssr")]
pub fn create_router(app_state: AppState) -> Router<()> {
    let router = Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler));

    let router = configure_api_routes(router);

    router
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(app_state)
}
