//! Hub and delivery integration tests

#[cfg(feature = "ssr")]
mod hub_test;
#[cfg(feature = "ssr")]
mod protocol_test;
