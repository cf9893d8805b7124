//! Common test utilities and helpers
//!
//! This module provides shared utilities for all tests including:
//! - An in-memory application with a manual clock
//! - Token helpers
//! - Custom assertion macros

pub mod assertions;
pub mod auth_helpers;
#[cfg(feature = "ssr")]
pub mod fixtures;

// Re-export commonly used utilities
pub use assertions::*;
pub use auth_helpers::*;
#[cfg(feature = "ssr")]
pub use fixtures::*;
