//! API integration tests
//!
//! Requests go through the full router with `tower::ServiceExt::oneshot`.

#[cfg(feature = "ssr")]
mod notifications_test;
#[cfg(feature = "ssr")]
mod sync_api_test;
