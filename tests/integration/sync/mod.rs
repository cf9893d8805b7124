//! Offline sync integration tests

#[cfg(feature = "ssr")]
mod sync_flow_test;
