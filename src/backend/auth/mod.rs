//! Authentication Module
//!
//! Users are identified by a numeric id carried in a bearer JWT. The token is
//! accepted in the `Authorization: Bearer …` header on REST calls, and also
//! as a `token` query parameter on the WebSocket upgrade, where browsers
//! cannot set headers.
//!
//! # Module Structure
//!
//! ```text
//! auth/
//! ├── mod.rs          - Module exports and documentation
//! └── sessions.rs     - JWT creation and validation
//! ```
//!
//! The `AuthUser` extractor that handlers use lives in `backend::middleware`.

/// JWT token management
pub mod sessions;

pub use sessions::{create_token, user_id_from_token, verify_token, Claims};
