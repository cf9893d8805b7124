//! Integration tests
//!
//! Each suite builds a `TestApp` from `common` and drives the public API.

pub mod api;
pub mod realtime;
pub mod sync;
