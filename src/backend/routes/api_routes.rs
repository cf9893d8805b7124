/**
 * API Routes
 *
 * ## Delivery
 * - `GET /notifications` - inbox
 * - `POST /notifications/{id}/ack` - delivery/read ack
 * - `GET /notifications/{id}/analytics` - event counts
 * - `GET /presence/{user_id}` - cached presence
 * - `GET /hub/stats` - hub counts
 *
 * ## Sync
 * - `POST /sync/queue`, `GET /sync/status`
 * - `POST /sync`, `POST /sync/force`
 * - `GET /sync/operations`, `GET /sync/conflicts`, `GET /sync/history`
 * - `POST /sync/conflicts/{id}/resolve`
 * - `POST /sync/online`, `POST /sync/offline`, `POST /sync/strategy`
 *
 * Every route requires a bearer token; the `AuthUser` extractor rejects
 * the request with 401 before the handler runs.
 */

use axum::{
    routing::{get, post},
    Router,
};

#[cfg(feature = "ssr")]
use crate::backend::delivery::handlers as delivery;
#[cfg(feature = "ssr")]
use crate::backend::server::state::AppState;
#[cfg(feature = "ssr")]
use crate::backend::sync::handlers as sync;

#[cfg(feature = "ssr")]
pub fn configure_api_routes(router: Router<AppState>) -> Router<AppState> {
    router
        // Delivery
        .route("/notifications", get(delivery::list_notifications))
        .route("/notifications/{id}/ack", post(delivery::ack_notification))
        .route(
            "/notifications/{id}/analytics",
            get(delivery::notification_analytics),
        )
        .route("/presence/{user_id}", get(delivery::presence))
        .route("/hub/stats", get(delivery::hub_stats))
        // Sync
        .route("/sync", post(sync::run_sync))
        .route("/sync/queue", post(sync::queue_operation))
        .route("/sync/status", get(sync::sync_status))
        .route("/sync/force", post(sync::force_sync))
        .route("/sync/operations", get(sync::list_operations))
        .route("/sync/conflicts", get(sync::list_conflicts))
        .route(
            "/sync/conflicts/{id}/resolve",
            post(sync::resolve_conflict),
        )
        .route("/sync/online", post(sync::go_online))
        .route("/sync/offline", post(sync::go_offline))
        .route("/sync/history", get(sync::sync_history))
        .route("/sync/strategy", post(sync::set_strategy))
}
