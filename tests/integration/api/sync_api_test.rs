//! `/sync/*` endpoints

use axum::http::StatusCode;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::time::Duration;

use crate::assert_api_error;
use crate::common::TestApp;

fn queue_body(op_id: &str, name: &str) -> serde_json::Value {
    json!({
        "op_id": op_id,
        "operation_type": "update",
        "table_name": "profile",
        "record_id": "3",
        "data": { "name": name },
    })
}

#[tokio::test]
async fn test_queue_then_sync() {
    let app = TestApp::new();

    let (status, body) = app.post("/sync/queue", 3, queue_body("op-1", "Ann")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["operation_id"], json!("op-1"));
    assert_eq!(body["data"]["status"], json!("pending"));

    let (_, status_body) = app.get("/sync/status", 3).await;
    assert_eq!(status_body["data"]["pending_count"], json!(1));
    assert_eq!(status_body["data"]["online"], json!(true));

    let (status, body) = app.post_empty("/sync", 3).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["applied"], json!(1));
    assert_eq!(body["data"]["outcome"], json!("success"));
    assert_eq!(body["data"]["status"]["pending_count"], json!(0));

    let (_, ops) = app.get("/sync/operations", 3).await;
    assert_eq!(ops["data"][0]["state"], json!("applied"));

    let (_, history) = app.get("/sync/history?limit=5", 3).await;
    assert_eq!(history["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_queue_validation() {
    let app = TestApp::new();

    let mut bad_kind = queue_body("op-1", "Ann");
    bad_kind["operation_type"] = json!("upsert");
    let (status, body) = app.post("/sync/queue", 3, bad_kind).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_api_error!(body, "Validation");

    let mut bad_table = queue_body("op-2", "Ann");
    bad_table["table_name"] = json!("secrets");
    let (status, body) = app.post("/sync/queue", 3, bad_table).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_api_error!(body, "Validation");

    let (status, body) = app.post_empty("/sync/queue", 3).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_api_error!(body, "Validation");

    // Rejected ops leave the user offline, so the retry sweep ignores them
    let (_, status_body) = app.get("/sync/status", 3).await;
    assert_eq!(status_body["data"]["online"], json!(false));
    assert_eq!(status_body["data"]["pending_count"], json!(0));
}

#[tokio::test]
async fn test_duplicate_op_id_is_409() {
    let app = TestApp::new();
    let (status, _) = app.post("/sync/queue", 3, queue_body("abc", "Ann")).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = app.post("/sync/queue", 3, queue_body("abc", "Ann")).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_api_error!(body, "DuplicateOperation");

    let (_, ops) = app.get("/sync/operations", 3).await;
    assert_eq!(ops["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_manual_conflict_round_trip() {
    let app = TestApp::new();
    app.seed_record("profile", "3", json!({"name": "Ann"}), 5).await;

    let (status, _) = app
        .post("/sync/strategy", 3, json!({"table": "profile", "strategy": "manual"}))
        .await;
    assert_eq!(status, StatusCode::OK);

    let mut body = queue_body("op-1", "Bob");
    body["base_version"] = json!(4);
    app.post("/sync/queue", 3, body).await;

    let (_, report) = app.post_empty("/sync", 3).await;
    assert_eq!(report["data"]["conflicted"], json!(1));
    assert_eq!(report["data"]["status"]["conflict_count"], json!(1));

    let (_, conflicts) = app.get("/sync/conflicts", 3).await;
    let conflict = &conflicts["data"][0];
    assert_eq!(conflict["status"], json!("unresolved"));
    assert_eq!(conflict["server"], json!({"name": "Ann"}));
    let id = conflict["id"].as_str().unwrap().to_string();

    let uri = format!("/sync/conflicts/{}/resolve", id);
    let (status, body) = app.post(&uri, 3, json!({"strategy": "manual"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_api_error!(body, "Validation");

    let (status, body) = app.post(&uri, 3, json!({"strategy": "server-wins"})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], json!("resolved"));
    assert_eq!(body["data"]["strategy_used"], json!("server-wins"));

    let (_, status_body) = app.get("/sync/status", 3).await;
    assert_eq!(status_body["data"]["conflict_count"], json!(0));
}

#[tokio::test]
async fn test_strategy_for_unsynced_table_is_rejected() {
    let app = TestApp::new();
    let (status, body) = app
        .post("/sync/strategy", 3, json!({"table": "secrets", "strategy": "merge"}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_api_error!(body, "Validation");
}

#[tokio::test]
async fn test_selective_sync_with_cursor() {
    let app = TestApp::new();
    app.post("/sync/queue", 3, queue_body("old", "Old")).await;
    app.clock.advance(Duration::from_secs(60));
    let cursor = app.clock_now().to_rfc3339();
    app.clock.advance(Duration::from_secs(60));
    app.post("/sync/queue", 3, queue_body("new", "New")).await;

    let uri = format!("/sync?last_sync={}", cursor.replace('+', "%2B"));
    let (status, body) = app.post_empty(&uri, 3).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["processed"], json!(1));

    let (status, body) = app.post_empty("/sync?last_sync=yesterday", 3).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_api_error!(body, "Validation");
}

#[tokio::test]
async fn test_online_offline_toggle() {
    let app = TestApp::new();
    let (_, body) = app.post_empty("/sync/online", 3).await;
    assert_eq!(body["data"]["online"], json!(true));

    let (_, body) = app.post_empty("/sync/offline", 3).await;
    assert_eq!(body["data"]["online"], json!(false));

    // Force sync neither needs nor changes the flag
    app.state
        .controller
        .queue()
        .enqueue(
            3,
            hubsync::shared::NewOperation {
                op_id: None,
                kind: hubsync::shared::OperationKind::Create,
                table: "notes".into(),
                record_id: Some("n1".into()),
                payload: json!({"text": "hi"}),
                base_version: None,
            },
        )
        .await
        .unwrap();
    let (status, body) = app.post_empty("/sync/force", 3).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["applied"], json!(1));
    assert_eq!(body["data"]["status"]["online"], json!(false));
}
