//! Property-based tests

#[cfg(feature = "ssr")]
mod queue_proptest;
#[cfg(feature = "ssr")]
mod version_proptest;
