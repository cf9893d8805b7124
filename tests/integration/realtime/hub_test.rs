//! Hub fan-out, reaping and delivery analytics

use pretty_assertions::assert_eq;
use serde_json::json;
use std::time::Duration;

use hubsync::backend::realtime::FrameOutcome;
use hubsync::shared::config::SessionConfig;
use hubsync::shared::{AnalyticsEvent, AppConfig, Envelope, EnvelopeType, PresenceStatus};

use crate::common::TestApp;
use crate::{assert_ok, expect_envelope};

fn small_queue_config(capacity: usize) -> AppConfig {
    let mut config = AppConfig::default();
    config.session = SessionConfig {
        outbound_queue: capacity,
        ..SessionConfig::default()
    };
    config
}

#[tokio::test]
async fn test_notification_reaches_every_session_and_ack_is_counted() {
    let app = TestApp::new();
    let (mut s1, ctx1) = app.connect(7).await;
    let (mut s2, _ctx2) = app.connect(7).await;

    let delivery = assert_ok!(
        app.state
            .delivery
            .notify(7, "order", "Shipped", "Your order is on its way", json!({"id": 42}))
            .await
    );
    assert_eq!(delivery.delivered, 2);
    let id = delivery.notification.id;

    for session in [&mut s1, &mut s2] {
        let env = expect_envelope!(session, EnvelopeType::Notification);
        assert_eq!(env.payload["id"], json!(id));
        assert_eq!(env.payload["data"]["id"], json!(42));
    }

    let inbox = assert_ok!(app.state.delivery.inbox(7, 10).await);
    assert_eq!(inbox.len(), 1);
    let counts = assert_ok!(app.state.delivery.analytics(7, id).await);
    assert_eq!(counts.get(&AnalyticsEvent::Sent), Some(&1));
    assert_eq!(counts.get(&AnalyticsEvent::Delivered), None);

    let frame = json!({"type": "ack", "data": {"id": id}}).to_string();
    match ctx1.handle_text(&frame).await {
        FrameOutcome::Reply(env) => assert_eq!(env.kind, EnvelopeType::Ack),
        other => panic!("unexpected outcome: {:?}", other),
    }
    // A second ack changes nothing
    ctx1.handle_text(&frame).await;

    let counts = assert_ok!(app.state.delivery.analytics(7, id).await);
    assert_eq!(counts.get(&AnalyticsEvent::Sent), Some(&1));
    assert_eq!(counts.get(&AnalyticsEvent::Delivered), Some(&1));
}

#[tokio::test]
async fn test_stale_session_is_reaped() {
    let app = TestApp::new();
    let (session, _ctx) = app.connect(9).await;

    app.clock.advance(Duration::from_secs(130));
    let reaped = app.state.hub.sweep_idle().await;
    assert_eq!(reaped, vec![session.id]);

    let sent = app
        .state
        .hub
        .send_to_user(9, Envelope::ping(app.clock_now()))
        .await;
    assert_eq!(sent, 0);
    assert!(!app.state.hub.is_online(9).await);
    assert!(app.state.hub.indexes_consistent().await);
}

#[tokio::test]
async fn test_pong_keeps_session_alive() {
    let app = TestApp::new();
    let (_session, ctx) = app.connect(9).await;

    app.clock.advance(Duration::from_secs(100));
    ctx.handle_text(r#"{"type":"pong"}"#).await;
    app.clock.advance(Duration::from_secs(100));

    assert!(app.state.hub.sweep_idle().await.is_empty());
    assert!(app.state.hub.is_online(9).await);
}

#[tokio::test]
async fn test_full_queue_reaps_only_the_slow_session() {
    let app = TestApp::with_config(small_queue_config(1));
    let (mut slow, _) = app.connect(5).await;
    let (mut fast, _) = app.connect(5).await;

    let first = Envelope::live_update("score", json!({"n": 1}), app.clock_now());
    assert_eq!(app.state.hub.send_to_user(5, first).await, 2);
    expect_envelope!(fast, EnvelopeType::LiveUpdate);

    let second = Envelope::live_update("score", json!({"n": 2}), app.clock_now());
    assert_eq!(app.state.hub.send_to_user(5, second).await, 1);

    let env = expect_envelope!(fast, EnvelopeType::LiveUpdate);
    assert_eq!(env.payload["data"]["n"], json!(2));
    assert_eq!(app.state.hub.sessions_of(5).await, vec![fast.id]);

    // The slow session keeps what was queued, then sees its queue close
    expect_envelope!(slow, EnvelopeType::LiveUpdate);
    assert!(slow.outbound.recv().await.is_none());
    assert!(app.state.hub.indexes_consistent().await);
}

#[tokio::test]
async fn test_session_ceiling_per_user() {
    let mut config = AppConfig::default();
    config.session.max_per_user = 2;
    let app = TestApp::with_config(config);
    let _a = app.connect(1).await;
    let _b = app.connect(1).await;

    let refused = app.state.hub.attach(Some(1)).await.unwrap_err();
    assert_eq!(refused.kind(), "Capacity");
    // Other users are unaffected
    assert!(app.state.hub.attach(Some(2)).await.is_ok());
}

#[tokio::test]
async fn test_presence_reaches_rooms_and_siblings_only() {
    let app = TestApp::new();
    let (mut origin, origin_ctx) = app.connect(1).await;
    let (mut sibling, _) = app.connect(1).await;
    let (mut friend, friend_ctx) = app.connect(2).await;
    let (mut stranger, _) = app.connect(3).await;

    origin_ctx.handle_text(r#"{"type":"join_room","data":{"room":"lobby"}}"#).await;
    friend_ctx.handle_text(r#"{"type":"join_room","data":{"room":"lobby"}}"#).await;

    let outcome = origin_ctx
        .handle_text(r#"{"type":"presence_update","data":{"status":"away"}}"#)
        .await;
    assert_eq!(outcome, FrameOutcome::Silent);

    let env = expect_envelope!(sibling, EnvelopeType::Presence);
    assert_eq!(env.payload["status"], json!("away"));
    expect_envelope!(friend, EnvelopeType::Presence);
    assert!(origin.outbound.try_recv().is_err());
    assert!(stranger.outbound.try_recv().is_err());

    let status = assert_ok!(app.state.delivery.presence_of(1).await);
    assert_eq!(status, PresenceStatus::Away);
}

#[tokio::test]
async fn test_typing_skips_the_typist() {
    let app = TestApp::new();
    let (mut typist, typist_ctx) = app.connect(1).await;
    let (mut reader, reader_ctx) = app.connect(2).await;
    typist_ctx.handle_text(r#"{"type":"join_room","data":{"room":"chat:1"}}"#).await;
    reader_ctx.handle_text(r#"{"type":"join_room","data":{"room":"chat:1"}}"#).await;

    typist_ctx
        .handle_text(r#"{"type":"typing_indicator","data":{"room":"chat:1","is_typing":true}}"#)
        .await;

    let env = expect_envelope!(reader, EnvelopeType::Typing);
    assert_eq!(env.payload["user_id"], json!(1));
    assert!(typist.outbound.try_recv().is_err());
}

#[tokio::test]
async fn test_reaped_session_marks_unacked_notification_failed() {
    let app = TestApp::new();
    let accounting = app.state.delivery.spawn_reap_accounting(app.shutdown.subscribe());
    let (_session, _ctx) = app.connect(4).await;

    let delivery = assert_ok!(
        app.state
            .delivery
            .notify(4, "reminder", "Ping", "", json!({}))
            .await
    );
    app.clock.advance(Duration::from_secs(130));
    assert_eq!(app.state.hub.sweep_idle().await.len(), 1);

    let mut failed = None;
    for _ in 0..50 {
        let counts = assert_ok!(app.state.delivery.analytics(4, delivery.notification.id).await);
        failed = counts.get(&AnalyticsEvent::Failed).copied();
        if failed.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(failed, Some(1));

    app.shutdown.send(true).unwrap();
    accounting.await.unwrap();
}
