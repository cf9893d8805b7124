//! Property-based tests for the operation state machine

use proptest::prelude::*;
use serde_json::json;
use std::time::Duration;

use hubsync::backend::store::{ConflictChange, OpCommit};
use hubsync::backend::sync::Outcome;
use hubsync::shared::{AppConfig, NewOperation, OperationKind, OperationState};

use crate::common::TestApp;

#[derive(Debug, Clone)]
enum Action {
    Claim,
    Fail,
    FailNow,
    Release,
    Apply,
    Advance(u64),
}

fn action() -> impl Strategy<Value = Action> {
    prop_oneof![
        3 => Just(Action::Claim),
        2 => Just(Action::Fail),
        1 => Just(Action::FailNow),
        1 => Just(Action::Release),
        1 => Just(Action::Apply),
        2 => (1u64..4000).prop_map(Action::Advance),
    ]
}

/// One store write moves an op along one edge, or along two edges whose
/// middle state is `failed`
fn observed_step_is_legal(prev: OperationState, next: OperationState) -> bool {
    let through_failed = prev.can_transition(OperationState::Failed)
        && OperationState::Failed.can_transition(next);
    prev == next || prev.can_transition(next) || through_failed
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn test_op_only_moves_along_legal_edges(actions in prop::collection::vec(action(), 1..30)) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut config = AppConfig::default();
            config.retry.max_attempts = 4;
            let app = TestApp::with_config(config);
            let queue = app.state.controller.queue().clone();
            let op = queue
                .enqueue(1, NewOperation {
                    op_id: Some("op".into()),
                    kind: OperationKind::Create,
                    table: "notes".into(),
                    record_id: Some("n".into()),
                    payload: json!({"text": "x"}),
                    base_version: None,
                })
                .await
                .unwrap();

            let mut prev = op.clone();
            for action in actions {
                let released = matches!(action, Action::Release);
                match action {
                    Action::Claim => {
                        queue.claim_batch(1, 10, None).await.unwrap();
                    }
                    Action::Fail => {
                        let _ = queue.finish(&prev, Outcome::failed("boom")).await;
                    }
                    Action::FailNow => {
                        let _ = queue.finish(&prev, Outcome::failed_now("boom")).await;
                    }
                    Action::Release => {
                        let _ = queue.release(&prev).await;
                    }
                    Action::Apply => {
                        let commit = OpCommit {
                            user_id: 1,
                            op_id: "op".into(),
                            expected_state: OperationState::InFlight,
                            write: None,
                            conflict: ConflictChange::None,
                            at: app.clock_now(),
                        };
                        let _ = queue.finish(&prev, Outcome::Applied(commit)).await;
                    }
                    Action::Advance(secs) => app.clock.advance(Duration::from_secs(secs)),
                }

                let now = queue.get(1, "op").await.unwrap();
                assert!(
                    observed_step_is_legal(prev.state, now.state),
                    "{:?} -> {:?}",
                    prev.state,
                    now.state
                );
                assert_ne!(now.state, OperationState::Failed);
                if prev.state.is_terminal() {
                    assert_eq!(now.state, prev.state);
                }
                if released {
                    assert!(now.attempts + 1 >= prev.attempts);
                } else {
                    assert!(now.attempts >= prev.attempts);
                }
                assert!(now.attempts <= 4);

                let status = queue.status(1).await.unwrap();
                let pending = i64::from(now.state == OperationState::Pending);
                assert_eq!(status.pending_count, pending);
                prev = now;
            }
        });
    }
}
