/**
 * Sync HTTP Handlers
 *
 * - `POST /sync/queue` - enqueue an offline op
 * - `GET /sync/status` - counts, token and online flag
 * - `POST /sync` (`?last_sync=RFC3339` for a selective run) and `POST /sync/force`
 * - `GET /sync/operations`, `GET /sync/conflicts`, `GET /sync/history`
 * - `POST /sync/conflicts/{id}/resolve` - close a parked conflict
 * - `POST /sync/online`, `POST /sync/offline`
 * - `POST /sync/strategy` - per-table strategy for the caller
 *
 * Request bodies are decoded here rather than with `Json<T>` so that a
 * malformed body gets the same error envelope as every other failure.
 */
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::backend::error::BackendError;
use crate::backend::middleware::AuthUser;
use crate::backend::routes::response::{ApiResponse, LimitQuery};
use crate::backend::server::state::AppState;
use crate::backend::sync::controller::SyncReport;
use crate::shared::{
    NewOperation, OfflineOperation, OperationKind, Strategy, SyncConflict, SyncHistoryEntry,
    SyncStatus,
};

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, BackendError> {
    if body.is_empty() {
        return Err(BackendError::validation("body", "request body is empty"));
    }
    Ok(serde_json::from_slice(body)?)
}

#[derive(Debug, Deserialize)]
pub struct QueueRequest {
    pub operation_type: String,
    pub table_name: String,
    #[serde(default)]
    pub record_id: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub op_id: Option<String>,
    #[serde(default)]
    pub base_version: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct QueueResponse {
    pub operation_id: String,
    pub status: String,
    pub message: String,
}

pub async fn queue_operation(
    State(state): State<AppState>,
    user: AuthUser,
    body: Bytes,
) -> Result<ApiResponse<QueueResponse>, BackendError> {
    let request: QueueRequest = parse_body(&body)?;
    let kind: OperationKind = request.operation_type.parse()?;
    let new = NewOperation {
        op_id: request.op_id,
        kind,
        table: request.table_name,
        record_id: request.record_id,
        payload: request.data,
        base_version: request.base_version,
    };

    let op = state.controller.queue().enqueue(user.user_id, new).await?;
    // Only an accepted op makes the user a retry candidate
    state.controller.set_online(user.user_id, true).await?;
    let response = QueueResponse {
        operation_id: op.op_id.clone(),
        status: op.state.as_str().to_string(),
        message: format!("{} on {} queued", kind.as_str(), op.table),
    };
    Ok(ApiResponse::ok("operation queued", response).for_user(&user))
}

pub async fn sync_status(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<ApiResponse<SyncStatus>, BackendError> {
    let status = state.controller.queue().status(user.user_id).await?;
    Ok(ApiResponse::ok("sync status", status).for_user(&user))
}

#[derive(Debug, Default, Deserialize)]
pub struct SyncQuery {
    pub last_sync: Option<String>,
}

/// RFC3339 cursor; a `+` offset decoded to a space is put back
fn parse_cursor(raw: &str) -> Result<DateTime<Utc>, BackendError> {
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(&raw.replace(' ', "+")))
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| BackendError::validation("last_sync", e.to_string()))
}

fn report_message(report: &SyncReport) -> String {
    format!(
        "sync {}: {} processed, {} applied, {} conflicted, {} failed",
        report.outcome.as_str(),
        report.processed,
        report.applied,
        report.conflicted,
        report.failed
    )
}

pub async fn run_sync(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<SyncQuery>,
) -> Result<ApiResponse<SyncReport>, BackendError> {
    let report = match query.last_sync.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => {
            let cursor = parse_cursor(raw)?;
            state.controller.sync_since(user.user_id, cursor).await?
        }
        None => state.controller.sync(user.user_id).await?,
    };
    Ok(ApiResponse::ok(report_message(&report), report).for_user(&user))
}

pub async fn force_sync(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<ApiResponse<SyncReport>, BackendError> {
    let report = state.controller.force_sync(user.user_id).await?;
    Ok(ApiResponse::ok(report_message(&report), report).for_user(&user))
}

pub async fn list_operations(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<LimitQuery>,
) -> Result<ApiResponse<Vec<OfflineOperation>>, BackendError> {
    let ops = state.controller.queue().list(user.user_id, query.resolve()).await?;
    let message = format!("{} operations", ops.len());
    Ok(ApiResponse::ok(message, ops).for_user(&user))
}

pub async fn list_conflicts(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<LimitQuery>,
) -> Result<ApiResponse<Vec<SyncConflict>>, BackendError> {
    let conflicts = state.controller.conflicts(user.user_id, query.resolve()).await?;
    let message = format!("{} conflicts", conflicts.len());
    Ok(ApiResponse::ok(message, conflicts).for_user(&user))
}

#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    pub strategy: Strategy,
}

pub async fn resolve_conflict(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    body: Bytes,
) -> Result<ApiResponse<SyncConflict>, BackendError> {
    let request: ResolveRequest = parse_body(&body)?;
    let conflict = state
        .controller
        .resolve_conflict(user.user_id, id, request.strategy)
        .await?;
    Ok(ApiResponse::ok("conflict resolved", conflict).for_user(&user))
}

pub async fn go_online(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<ApiResponse<SyncStatus>, BackendError> {
    let status = state.controller.set_online(user.user_id, true).await?;
    Ok(ApiResponse::ok("online", status).for_user(&user))
}

pub async fn go_offline(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<ApiResponse<SyncStatus>, BackendError> {
    let status = state.controller.set_online(user.user_id, false).await?;
    Ok(ApiResponse::ok("offline", status).for_user(&user))
}

pub async fn sync_history(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<LimitQuery>,
) -> Result<ApiResponse<Vec<SyncHistoryEntry>>, BackendError> {
    let history = state.controller.history(user.user_id, query.resolve()).await?;
    let message = format!("{} sync runs", history.len());
    Ok(ApiResponse::ok(message, history).for_user(&user))
}

#[derive(Debug, Deserialize)]
pub struct StrategyRequest {
    pub table: String,
    pub strategy: Strategy,
}

#[derive(Debug, Serialize)]
pub struct StrategyResponse {
    pub table: String,
    pub strategy: Strategy,
}

pub async fn set_strategy(
    State(state): State<AppState>,
    user: AuthUser,
    body: Bytes,
) -> Result<ApiResponse<StrategyResponse>, BackendError> {
    let request: StrategyRequest = parse_body(&body)?;
    state
        .controller
        .set_strategy(user.user_id, &request.table, request.strategy)?;
    let response = StrategyResponse {
        table: request.table,
        strategy: request.strategy,
    };
    Ok(ApiResponse::ok("strategy updated", response).for_user(&user))
}
