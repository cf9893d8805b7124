//! Custom assertion macros
//!
//! `assert_ok!`/`assert_err!` unwrap with a readable panic; the rest check
//! the shapes hubsync puts on the wire.

/// Assert that a result is ok and return the value
#[macro_export]
macro_rules! assert_ok {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(e) => panic!("Expected Ok, got Err: {:?}", e),
        }
    };
    ($result:expr, $message:expr) => {
        match $result {
            Ok(value) => value,
            Err(e) => panic!("{}: {:?}", $message, e),
        }
    };
}

/// Assert that a result is an error, optionally of a given pattern
#[macro_export]
macro_rules! assert_err {
    ($result:expr) => {
        assert!($result.is_err(), "Expected Err, got Ok");
    };
    ($result:expr, $pattern:pat) => {
        match $result {
            Err($pattern) => {}
            Ok(value) => panic!("Expected Err, got Ok: {:?}", value),
            Err(e) => panic!("Expected different error variant, got: {:?}", e),
        }
    };
}

/// Assert that a value is within a range
#[macro_export]
macro_rules! assert_in_range {
    ($value:expr, $min:expr, $max:expr) => {
        assert!(
            $value >= $min && $value <= $max,
            "Value {:?} is not in range [{:?}, {:?}]",
            $value,
            $min,
            $max
        );
    };
}

/// Assert a JSON error envelope: `success: false` and `data.kind`
#[macro_export]
macro_rules! assert_api_error {
    ($body:expr, $kind:expr) => {
        let body: &serde_json::Value = &$body;
        assert_eq!(body["success"], serde_json::Value::Bool(false), "body: {}", body);
        assert_eq!(body["data"]["kind"], $kind, "body: {}", body);
    };
}

/// Receive the next envelope from a session handle and check its type
#[macro_export]
macro_rules! expect_envelope {
    ($session:expr, $kind:expr) => {{
        let envelope = tokio::time::timeout(std::time::Duration::from_secs(1), $session.outbound.recv())
            .await
            .expect("timed out waiting for an envelope")
            .expect("outbound queue closed");
        assert_eq!(envelope.kind, $kind, "envelope: {:?}", envelope);
        envelope
    }};
}
