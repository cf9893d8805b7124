//! Middleware Module
//!
//! Request-level concerns shared by every handler.
//!
//! - **`auth`** - `AuthUser` extractor (bearer JWT → user id)
//!
//! Request ids and HTTP tracing are `tower-http` layers installed in
//! `routes::router`.

/// Authentication extractor
pub mod auth;

pub use auth::{bearer_token, AuthUser, REQUEST_ID_HEADER, TRACE_ID_HEADER};
