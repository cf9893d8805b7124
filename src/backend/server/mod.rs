//! Server Module
//!
//! Startup and shutdown of the hubsync server.
//!
//! # Module Structure
//!
//! ```text
//! server/
//! ├── mod.rs          - Module exports and documentation
//! ├── state.rs        - AppState and FromRef implementations
//! ├── config.rs       - Store loading (Postgres or in-memory)
//! └── init.rs         - create_app, background tasks, shutdown
//! ```
//!
//! # Initialization Flow
//!
//! 1. **Configuration**: `AppConfig` is validated
//! 2. **Store**: Postgres when `DATABASE_URL` is reachable, memory otherwise
//! 3. **Components**: hub, delivery, queue, resolver, controller
//! 4. **Background Tasks**: hub ping/reap, reap accounting, cache janitor,
//!    retry loop
//! 5. **Router Creation**: routes and tower-http layers

/// Application state management
pub mod state;

/// Store loading
pub mod config;

/// Server initialization
pub mod init;

// Re-export commonly used types
#[cfg(feature = "ssr")]
pub use state::AppState;
#[cfg(feature = "ssr")]
pub use init::{create_app, App};
#[cfg(feature = "ssr")]
pub use config::load_store;
