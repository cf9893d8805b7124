//! Route Configuration Module
//!
//! # Module Structure
//!
//! ```text
//! routes/
//! ├── mod.rs          - Module exports and documentation
//! ├── router.rs       - Router creation and tower-http layers
//! ├── api_routes.rs   - Delivery and sync REST routes
//! └── response.rs     - Uniform response envelope
//! ```
//!
//! # Route Organization
//!
//! 1. **Health** - `GET /health`
//! 2. **Realtime** - `GET /ws`
//! 3. **API Routes** - notifications, presence, hub stats, `/sync/*`
//!
//! Unknown paths fall through to axum's default 404.

/// Main router creation
pub mod router;

/// REST route table
pub mod api_routes;

/// Response envelope
pub mod response;

// Re-export commonly used functions
#[cfg(feature = "ssr")]
pub use router::create_router;
pub use response::{ApiResponse, LimitQuery};
