//! Property-based tests for record versions under sync

use proptest::prelude::*;
use serde_json::{json, Value};

use hubsync::shared::{NewOperation, OperationKind};

use crate::common::TestApp;

fn kind() -> impl Strategy<Value = OperationKind> {
    prop_oneof![
        Just(OperationKind::Create),
        Just(OperationKind::Update),
        Just(OperationKind::Delete),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn test_versions_strictly_increase_per_write(kinds in prop::collection::vec(kind(), 1..20)) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let app = TestApp::new();
            let mut exists = false;
            let mut version = 0;

            for (i, kind) in kinds.into_iter().enumerate() {
                let payload = match kind {
                    OperationKind::Delete => Value::Null,
                    _ => json!({ "n": i }),
                };
                app.state
                    .controller
                    .queue()
                    .enqueue(1, NewOperation {
                        op_id: None,
                        kind,
                        table: "notes".into(),
                        record_id: Some("r".into()),
                        payload,
                        base_version: None,
                    })
                    .await
                    .unwrap();
                let report = app.state.controller.sync(1).await.unwrap();
                assert_eq!(report.applied, 1);

                let record = app.store.get_record("notes", "r").await.unwrap();
                let now = record.as_ref().map(|r| r.version).unwrap_or(0);
                let wrote = !(kind == OperationKind::Delete && !exists);
                if wrote {
                    assert_eq!(now, version + 1);
                } else {
                    assert_eq!(now, version);
                }
                exists = kind != OperationKind::Delete;
                assert_eq!(record.and_then(|r| r.value).is_some(), exists);
                version = now;
            }
        });
    }
}
