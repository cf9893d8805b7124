//! Authentication test helpers

#[cfg(feature = "ssr")]
use std::time::Duration;
#[cfg(feature = "ssr")]
use hubsync::backend::auth::create_token;
#[cfg(feature = "ssr")]
use hubsync::shared::UserId;

/// Secret every fixture app is configured with
pub const TEST_SECRET: &str = "test_secret_for_hubsync";

/// Generate a test JWT for `user_id`
#[cfg(feature = "ssr")]
pub fn generate_test_token(user_id: UserId) -> String {
    create_token(user_id, TEST_SECRET, Duration::from_secs(3600))
        .expect("Failed to generate test token")
}

/// Create authorization header value
pub fn auth_header(token: &str) -> String {
    format!("Bearer {}", token)
}
