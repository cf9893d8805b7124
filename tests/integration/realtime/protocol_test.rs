//! Inbound frame handling at the session boundary

use pretty_assertions::assert_eq;
use serde_json::json;

use hubsync::backend::realtime::FrameOutcome;
use hubsync::shared::EnvelopeType;

use crate::common::TestApp;

fn protocol_error(outcome: FrameOutcome) -> String {
    match outcome {
        FrameOutcome::Reply(env) => {
            assert_eq!(env.kind, EnvelopeType::SystemMessage);
            assert_eq!(env.payload["kind"], json!("protocol_error"));
            env.payload["detail"].as_str().unwrap_or_default().to_string()
        }
        other => panic!("expected a protocol_error reply, got {:?}", other),
    }
}

#[tokio::test]
async fn test_ping_gets_pong() {
    let app = TestApp::new();
    let (_session, ctx) = app.connect(1).await;
    match ctx.handle_text(r#"{"type":"ping"}"#).await {
        FrameOutcome::Reply(env) => assert_eq!(env.kind, EnvelopeType::Pong),
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[tokio::test]
async fn test_oversize_message_is_refused_but_session_survives() {
    let app = TestApp::new();
    let (_session, ctx) = app.connect(1).await;
    let big = json!({"type": "join_room", "data": {"room": "x".repeat(600)}}).to_string();

    let detail = protocol_error(ctx.handle_text(&big).await);
    assert!(detail.contains("exceeds"), "detail: {}", detail);
    assert!(app.state.hub.is_online(1).await);
}

#[tokio::test]
async fn test_unknown_frame_type() {
    let app = TestApp::new();
    let (_session, ctx) = app.connect(1).await;
    let detail = protocol_error(ctx.handle_text(r#"{"type":"teleport"}"#).await);
    assert!(detail.contains("teleport"), "detail: {}", detail);
}

#[tokio::test]
async fn test_ack_of_someone_elses_notification() {
    let app = TestApp::new();
    let (_session, ctx) = app.connect(1).await;
    let other = app
        .state
        .delivery
        .notify(2, "order", "Shipped", "", json!({}))
        .await
        .unwrap();

    let frame = json!({"type": "ack", "data": {"notification_id": other.notification.id}}).to_string();
    protocol_error(ctx.handle_text(&frame).await);
    let stored = app.state.delivery.inbox(2, 1).await.unwrap();
    assert!(stored[0].delivered_at.is_none());
}

#[tokio::test]
async fn test_repeat_offender_is_reaped() {
    let app = TestApp::new();
    let (mut session, ctx) = app.connect(1).await;

    protocol_error(ctx.handle_binary().await);
    protocol_error(ctx.handle_text("not json").await);
    assert_eq!(ctx.handle_text("still not json").await, FrameOutcome::Reaped);

    assert!(!app.state.hub.is_online(1).await);
    assert!(session.outbound.recv().await.is_none());
}
