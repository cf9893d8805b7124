//! Delivery endpoints: inbox, ack, analytics, presence, hub stats

use axum::http::{Method, StatusCode};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::time::Duration;

use crate::common::TestApp;
use crate::{assert_api_error, assert_ok};

async fn seed_notification(app: &TestApp, user_id: i64) -> String {
    let delivery = assert_ok!(
        app.state
            .delivery
            .notify(user_id, "order", "Shipped", "On its way", json!({"id": 42}))
            .await
    );
    delivery.notification.id.to_string()
}

#[tokio::test]
async fn test_health() {
    let app = TestApp::new();
    let (status, body) = app.request(Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(true));
}

#[tokio::test]
async fn test_missing_token_is_unauthenticated() {
    let app = TestApp::new();
    let (status, body) = app.request(Method::GET, "/notifications", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_api_error!(body, "Unauthenticated");
}

#[tokio::test]
async fn test_inbox_lists_newest_first_with_request_id() {
    let app = TestApp::new();
    seed_notification(&app, 7).await;
    app.clock.advance(Duration::from_secs(1));
    let newest = seed_notification(&app, 7).await;
    seed_notification(&app, 8).await;

    let (status, body) = app.get("/notifications?limit=10", 7).await;
    assert_eq!(status, StatusCode::OK);
    let items = body["data"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["id"], json!(newest));
    assert!(body["request_id"].is_string(), "body: {}", body);
}

#[tokio::test]
async fn test_ack_sets_read_once() {
    let app = TestApp::new();
    let id = seed_notification(&app, 7).await;
    let uri = format!("/notifications/{}/ack", id);

    let (status, first) = app.post_empty(&uri, 7).await;
    assert_eq!(status, StatusCode::OK);
    let read_at = first["data"]["read_at"].clone();
    assert!(read_at.is_string());
    assert!(first["data"]["delivered_at"].is_string());

    app.clock.advance(Duration::from_secs(30));
    let (_, second) = app.post_empty(&uri, 7).await;
    assert_eq!(second["data"]["read_at"], read_at);

    let (status, analytics) = app.get(&format!("/notifications/{}/analytics", id), 7).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(analytics["data"]["sent"], json!(1));
    assert_eq!(analytics["data"]["delivered"], json!(1));
    assert_eq!(analytics["data"]["opened"], json!(1));
}

#[tokio::test]
async fn test_other_users_notification_is_not_found() {
    let app = TestApp::new();
    let id = seed_notification(&app, 7).await;

    let (status, body) = app.post_empty(&format!("/notifications/{}/ack", id), 8).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_api_error!(body, "NotFound");

    let (status, _) = app.get(&format!("/notifications/{}/analytics", id), 8).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_presence_and_hub_stats() {
    let app = TestApp::new();
    let (_session, ctx) = app.connect(5).await;
    ctx.handle_text(r#"{"type":"join_room","data":{"room":"lobby"}}"#).await;
    ctx.handle_text(r#"{"type":"presence_update","data":{"status":"online"}}"#).await;

    let (status, body) = app.get("/presence/5", 1).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], json!("online"));

    let (_, body) = app.get("/presence/6", 1).await;
    assert_eq!(body["data"]["status"], json!("offline"));

    let (_, body) = app.get("/hub/stats", 1).await;
    assert_eq!(
        body["data"],
        json!({"total_sessions": 1, "users_online": 1, "rooms": 1})
    );
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let app = TestApp::new();
    let (status, body) = app.get("/nope", 1).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, Value::Null);
}
