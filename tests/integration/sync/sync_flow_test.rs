//! End-to-end sync runs over the in-memory store

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::time::Duration;

use hubsync::backend::error::BackendError;
use hubsync::backend::sync::{Outcome, CONFLICT_PENDING_KIND};
use hubsync::shared::config::RetryConfig;
use hubsync::shared::{
    AppConfig, ConflictStatus, ConflictType, EnvelopeType, NewOperation, OperationKind,
    OperationState, Strategy, SyncOutcome,
};

use crate::common::TestApp;
use crate::{assert_err, assert_ok, expect_envelope};

fn profile_update(payload: Value, base_version: Option<i64>) -> NewOperation {
    NewOperation {
        op_id: None,
        kind: OperationKind::Update,
        table: "profile".into(),
        record_id: Some("3".into()),
        payload,
        base_version,
    }
}

fn app_with_strategy(strategy: Strategy) -> TestApp {
    let mut config = AppConfig::default();
    config.resolver.default_strategy = strategy;
    TestApp::with_config(config)
}

#[tokio::test]
async fn test_sync_without_conflict_applies_in_order() {
    let app = TestApp::new();
    let (mut session, _) = app.connect(3).await;
    app.seed_record("profile", "3", json!({"name": "A", "city": "Oslo"}), 2).await;
    let queue = app.state.controller.queue();
    assert_ok!(queue.enqueue(3, profile_update(json!({"name": "Ann"}), None)).await);
    assert_ok!(queue.enqueue(3, profile_update(json!({"name": "Ana"}), None)).await);

    let report = assert_ok!(app.state.controller.sync(3).await);
    assert_eq!(report.processed, 2);
    assert_eq!(report.outcome, SyncOutcome::Success);

    let record = app.store.get_record("profile", "3").await.unwrap().unwrap();
    assert_eq!(record.value, Some(json!({"name": "Ana", "city": "Oslo"})));
    assert_eq!(record.version, 4);

    let first = expect_envelope!(session, EnvelopeType::DataUpdate);
    let second = expect_envelope!(session, EnvelopeType::DataUpdate);
    assert_eq!(first.payload["kind"], json!("profile"));
    assert_eq!(first.payload["data"]["version"], json!(3));
    assert_eq!(second.payload["data"]["version"], json!(4));
}

#[tokio::test]
async fn test_update_update_conflict_last_writer_wins() {
    let app = app_with_strategy(Strategy::LastWriterWins);
    app.seed_record("profile", "3", json!({"name": "Ann"}), 5).await;
    assert_ok!(
        app.state
            .controller
            .queue()
            .enqueue(3, profile_update(json!({"name": "Bob"}), Some(4)))
            .await
    );

    let report = assert_ok!(app.state.controller.sync(3).await);
    assert_eq!(report.applied, 1);
    assert_eq!(report.conflicts_resolved, 1);

    let record = app.store.get_record("profile", "3").await.unwrap().unwrap();
    assert_eq!(record.value, Some(json!({"name": "Bob"})));
    assert_eq!(record.version, 6);

    let conflicts = assert_ok!(app.state.controller.conflicts(3, 10).await);
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].conflict_type, ConflictType::UpdateUpdate);
    assert_eq!(conflicts[0].strategy_used, Some(Strategy::LastWriterWins));
    assert_eq!(conflicts[0].status, ConflictStatus::Resolved);
    assert_eq!(report.status.conflict_count, 0);
}

#[tokio::test]
async fn test_manual_conflict_then_server_wins() {
    let app = app_with_strategy(Strategy::Manual);
    app.seed_record("profile", "3", json!({"name": "Ann"}), 5).await;
    let op = assert_ok!(
        app.state
            .controller
            .queue()
            .enqueue(3, profile_update(json!({"name": "Bob"}), Some(4)))
            .await
    );

    let report = assert_ok!(app.state.controller.sync(3).await);
    assert_eq!(report.conflicted, 1);
    assert_eq!(report.status.conflict_count, 1);

    let parked = assert_ok!(app.state.controller.queue().get(3, &op.op_id).await);
    assert_eq!(parked.state, OperationState::Conflicted);
    let conflict = assert_ok!(app.state.controller.conflicts(3, 10).await).remove(0);
    assert_eq!(conflict.status, ConflictStatus::Unresolved);

    let inbox = assert_ok!(app.state.delivery.inbox(3, 10).await);
    assert_eq!(inbox[0].kind, CONFLICT_PENDING_KIND);

    let resolved = assert_ok!(
        app.state
            .controller
            .resolve_conflict(3, conflict.id, Strategy::ServerWins)
            .await
    );
    assert_eq!(resolved.status, ConflictStatus::Resolved);
    assert_eq!(resolved.strategy_used, Some(Strategy::ServerWins));

    let op = assert_ok!(app.state.controller.queue().get(3, &op.op_id).await);
    assert_eq!(op.state, OperationState::Applied);
    let record = app.store.get_record("profile", "3").await.unwrap().unwrap();
    assert_eq!(record.value, Some(json!({"name": "Ann"})));
    assert_eq!(record.version, 5);

    let status = assert_ok!(app.state.controller.queue().status(3).await);
    assert_eq!(status.conflict_count, 0);

    // A closed conflict cannot be resolved again
    assert_err!(
        app.state
            .controller
            .resolve_conflict(3, conflict.id, Strategy::LastWriterWins)
            .await,
        BackendError::Conflict { .. }
    );
}

#[tokio::test]
async fn test_manual_is_not_a_resolution() {
    let app = app_with_strategy(Strategy::Manual);
    app.seed_record("profile", "3", json!({"name": "Ann"}), 2).await;
    assert_ok!(
        app.state
            .controller
            .queue()
            .enqueue(3, profile_update(json!({"name": "Bob"}), Some(1)))
            .await
    );
    assert_ok!(app.state.controller.sync(3).await);
    let conflict = assert_ok!(app.state.controller.conflicts(3, 1).await).remove(0);

    assert_err!(
        app.state
            .controller
            .resolve_conflict(3, conflict.id, Strategy::Manual)
            .await,
        BackendError::Validation { .. }
    );
    // Nobody else can close it either
    assert_err!(
        app.state
            .controller
            .resolve_conflict(4, conflict.id, Strategy::ServerWins)
            .await,
        BackendError::NotFound { .. }
    );
}

#[tokio::test]
async fn test_duplicate_op_id_is_rejected() {
    let app = TestApp::new();
    let queue = app.state.controller.queue();
    let mut op = profile_update(json!({"name": "Ann"}), None);
    op.op_id = Some("abc".into());

    assert_ok!(queue.enqueue(3, op.clone()).await);
    assert_err!(queue.enqueue(3, op).await, BackendError::DuplicateOperation { .. });

    let ops = assert_ok!(queue.list(3, 100).await);
    assert_eq!(ops.iter().filter(|o| o.op_id == "abc").count(), 1);
}

#[tokio::test]
async fn test_replaying_an_applied_op_is_a_duplicate() {
    let app = TestApp::new();
    let queue = app.state.controller.queue();
    let mut op = profile_update(json!({"name": "Ann"}), None);
    op.op_id = Some("lww-1".into());

    assert_ok!(queue.enqueue(3, op.clone()).await);
    assert_ok!(app.state.controller.sync(3).await);
    let after_first = app.store.get_record("profile", "3").await.unwrap();

    assert_err!(queue.enqueue(3, op).await, BackendError::DuplicateOperation { .. });
    let report = assert_ok!(app.state.controller.sync(3).await);
    assert_eq!(report.outcome, SyncOutcome::Empty);
    assert_eq!(app.store.get_record("profile", "3").await.unwrap(), after_first);
}

#[tokio::test]
async fn test_op_dies_after_max_attempts() {
    let mut config = AppConfig::default();
    config.retry = RetryConfig {
        max_attempts: 2,
        ..RetryConfig::default()
    };
    let app = TestApp::with_config(config);
    let queue = app.state.controller.queue();
    let op = assert_ok!(queue.enqueue(3, profile_update(json!({"name": "Ann"}), None)).await);
    assert_eq!(assert_ok!(queue.status(3).await).pending_count, 1);

    let claimed = assert_ok!(queue.claim_batch(3, 10, None).await);
    let finished = assert_ok!(queue.finish(&claimed[0], Outcome::failed("store down")).await);
    assert_eq!(finished.state, OperationState::Pending);

    // Still backing off
    assert!(assert_ok!(queue.claim_batch(3, 10, None).await).is_empty());
    app.clock.advance(Duration::from_secs(3600));

    let claimed = assert_ok!(queue.claim_batch(3, 10, None).await);
    assert_eq!(claimed[0].attempts, 2);
    let finished = assert_ok!(queue.finish(&claimed[0], Outcome::failed("store down")).await);
    assert_eq!(finished.state, OperationState::Dead);

    let op = assert_ok!(queue.get(3, &op.op_id).await);
    assert_eq!(op.last_error.as_deref(), Some("store down"));
    assert_eq!(assert_ok!(queue.status(3).await).pending_count, 0);
}

#[tokio::test]
async fn test_selective_sync_only_takes_newer_ops() {
    let app = TestApp::new();
    let queue = app.state.controller.queue();
    let old = assert_ok!(queue.enqueue(3, profile_update(json!({"name": "Old"}), None)).await);
    app.clock.advance(Duration::from_secs(60));
    let cursor = app.clock_now();
    app.clock.advance(Duration::from_secs(60));
    let new = assert_ok!(queue.enqueue(3, profile_update(json!({"name": "New"}), None)).await);

    let report = assert_ok!(app.state.controller.sync_since(3, cursor).await);
    assert_eq!(report.processed, 1);
    assert_eq!(assert_ok!(queue.get(3, &new.op_id).await).state, OperationState::Applied);
    assert_eq!(assert_ok!(queue.get(3, &old.op_id).await).state, OperationState::Pending);
    assert!(report.sync_token >= cursor.timestamp_micros());
}

#[tokio::test]
async fn test_force_sync_does_not_mark_online() {
    let app = TestApp::new();
    let queue = app.state.controller.queue();
    assert_ok!(queue.enqueue(3, profile_update(json!({"name": "Ann"}), None)).await);

    let report = assert_ok!(app.state.controller.force_sync(3).await);
    assert_eq!(report.applied, 1);
    assert!(!report.status.online);
}

#[tokio::test]
async fn test_sync_tokens_increase() {
    let app = TestApp::new();
    let queue = app.state.controller.queue();
    let mut last = i64::MIN;
    for name in ["a", "b", "c"] {
        assert_ok!(queue.enqueue(3, profile_update(json!({ "name": name }), None)).await);
        let report = assert_ok!(app.state.controller.sync(3).await);
        assert!(report.sync_token > last);
        last = report.sync_token;
    }
    let history = assert_ok!(app.state.controller.history(3, 10).await);
    assert_eq!(history.len(), 3);
}

#[tokio::test]
async fn test_delete_then_recreate_keeps_versions_monotonic() {
    let app = TestApp::new();
    app.seed_record("notes", "n1", json!({"text": "hi"}), 1).await;
    let queue = app.state.controller.queue();
    assert_ok!(
        queue
            .enqueue(
                3,
                NewOperation {
                    op_id: None,
                    kind: OperationKind::Delete,
                    table: "notes".into(),
                    record_id: Some("n1".into()),
                    payload: Value::Null,
                    base_version: None,
                },
            )
            .await
    );
    assert_ok!(
        queue
            .enqueue(
                3,
                NewOperation {
                    op_id: None,
                    kind: OperationKind::Create,
                    table: "notes".into(),
                    record_id: Some("n1".into()),
                    payload: json!({"text": "again"}),
                    base_version: None,
                },
            )
            .await
    );

    let report = assert_ok!(app.state.controller.sync(3).await);
    assert_eq!(report.applied, 2);
    let record = app.store.get_record("notes", "n1").await.unwrap().unwrap();
    assert_eq!(record.value, Some(json!({"text": "again"})));
    assert_eq!(record.version, 3);
}

#[tokio::test]
async fn test_concurrent_sync_for_one_user_is_busy() {
    let app = TestApp::new();
    let controller = app.state.controller.clone();
    for i in 0..20 {
        assert_ok!(
            controller
                .queue()
                .enqueue(3, profile_update(json!({ "n": i }), None))
                .await
        );
    }

    let (a, b) = tokio::join!(controller.sync(3), controller.sync(3));
    let busy = [&a, &b]
        .iter()
        .filter(|r| matches!(r, Err(BackendError::Busy { .. })))
        .count();
    let ok = [&a, &b].iter().filter(|r| r.is_ok()).count();
    assert_eq!(ok + busy, 2);
    assert!(ok >= 1);
    assert_matches!(controller.queue().status(3).await, Ok(s) if s.pending_count == 0);
}
