//! Backend Error Module
//!
//! Error type returned by handlers and services. Lower layers have their own
//! errors (`StoreError`, `CacheError`, `SharedError`); they convert into
//! `BackendError` with `?`.
//!
//! # Module Structure
//!
//! ```text
//! error/
//! ├── mod.rs        - Module exports and documentation
//! ├── types.rs      - `BackendError` and its status/kind mapping
//! └── conversion.rs - `IntoResponse` (uniform JSON envelope)
//! ```

/// Error type definitions
pub mod types;

/// Error conversion implementations
pub mod conversion;

pub use types::BackendError;
