/**
 * Delivery HTTP Handlers
 *
 * - `GET /notifications?limit=` - inbox, newest first
 * - `POST /notifications/{id}/ack` - mark delivered and read
 * - `GET /notifications/{id}/analytics` - event counts
 * - `GET /presence/{user_id}` - cached presence status
 * - `GET /hub/stats` - session, user and room counts
 */
use axum::extract::{Path, Query, State};
use serde_json::json;
use uuid::Uuid;

use crate::backend::error::BackendError;
use crate::backend::middleware::AuthUser;
use crate::backend::realtime::HubStats;
use crate::backend::routes::response::{ApiResponse, LimitQuery};
use crate::backend::server::state::AppState;
use crate::shared::{AnalyticsCounts, Notification, UserId};

pub async fn list_notifications(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<LimitQuery>,
) -> Result<ApiResponse<Vec<Notification>>, BackendError> {
    let inbox = state.delivery.inbox(user.user_id, query.resolve()).await?;
    let message = format!("{} notifications", inbox.len());
    Ok(ApiResponse::ok(message, inbox).for_user(&user))
}

pub async fn ack_notification(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<ApiResponse<Notification>, BackendError> {
    let notification = state.delivery.mark_read(user.user_id, id).await?;
    Ok(ApiResponse::ok("notification acknowledged", notification).for_user(&user))
}

pub async fn notification_analytics(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<ApiResponse<AnalyticsCounts>, BackendError> {
    let counts = state.delivery.analytics(user.user_id, id).await?;
    Ok(ApiResponse::ok("notification analytics", counts).for_user(&user))
}

pub async fn presence(
    State(state): State<AppState>,
    user: AuthUser,
    Path(user_id): Path<UserId>,
) -> Result<ApiResponse<serde_json::Value>, BackendError> {
    let status = state.delivery.presence_of(user_id).await?;
    let data = json!({ "user_id": user_id, "status": status });
    Ok(ApiResponse::ok("presence", data).for_user(&user))
}

pub async fn hub_stats(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<ApiResponse<HubStats>, BackendError> {
    let stats = state.hub.stats().await;
    Ok(ApiResponse::ok("hub stats", stats).for_user(&user))
}
