//! Backend Module
//!
//! All server-side code for hubsync: the connection hub, the delivery
//! service, the offline-sync engine and the Axum server that exposes them.
//!
//! This module is only compiled when the `ssr` feature is enabled.
//!
//! # Architecture
//!
//! - **`server`** - Startup, application state, store loading, shutdown
//! - **`routes`** - Router assembly, REST route table, response envelope
//! - **`realtime`** - Hub (session registry), WebSocket loop, inbound protocol
//! - **`delivery`** - Notifications, live/data updates, presence, typing
//! - **`sync`** - Operation queue, conflict resolver, controller, retry loop
//! - **`store`** - Persistence trait with Postgres and in-memory backends
//! - **`cache`** - Key-value cache with TTLs and pub/sub channels
//! - **`runtime`** - Clock, monotonic ids, keyed locks
//! - **`auth`** - JWT tokens
//! - **`middleware`** - `AuthUser` extractor
//! - **`error`** - `BackendError` and HTTP mapping
//!
//! # Module Structure
//!
//! ```text
//! backend/
//! ├── mod.rs          - Module exports and documentation
//! ├── main.rs         - hubsync-server binary
//! ├── server/         - Initialization and state
//! ├── routes/         - Route configuration
//! ├── realtime/       - Hub and sockets
//! ├── delivery/       - Typed sends over the hub
//! ├── sync/           - Offline sync engine
//! ├── store/          - Persistence
//! ├── cache/          - Key-value cache
//! ├── runtime/        - Clock, ids, locks
//! ├── auth/           - Tokens
//! ├── middleware/     - Request extractors
//! └── error/          - Error types
//! ```
//!
//! # Thread Safety
//!
//! - `Hub` keeps every index behind one `tokio::sync::RwLock`, so a send
//!   never observes a half-attached session
//! - Per-user work is serialised with `KeyedLocks`
//! - Store and cache are `Arc<dyn Trait>` and safe to share
//!
//! # Error Handling
//!
//! Handlers return `Result<ApiResponse<T>, BackendError>`; `BackendError`
//! renders the same envelope with a status from its kind.

/// Server setup and state
#[cfg(feature = "ssr")]
pub mod server;

/// Route configuration
#[cfg(feature = "ssr")]
pub mod routes;

/// Connection hub and WebSocket sessions
#[cfg(feature = "ssr")]
pub mod realtime;

/// Delivery service
#[cfg(feature = "ssr")]
pub mod delivery;

/// Offline sync engine
#[cfg(feature = "ssr")]
pub mod sync;

/// Persistence
#[cfg(feature = "ssr")]
pub mod store;

/// Key-value cache
#[cfg(feature = "ssr")]
pub mod cache;

/// Clock, ids and keyed locks
#[cfg(feature = "ssr")]
pub mod runtime;

/// Backend error types
#[cfg(feature = "ssr")]
pub mod error;

/// Token issuing and verification
#[cfg(feature = "ssr")]
pub mod auth;

/// Middleware for request processing
#[cfg(feature = "ssr")]
pub mod middleware;

/// Re-export commonly used types
#[cfg(feature = "ssr")]
pub use server::{create_app, App, AppState};
#[cfg(feature = "ssr")]
pub use error::BackendError;
#[cfg(feature = "ssr")]
pub use realtime::Hub;
#[cfg(feature = "ssr")]
pub use delivery::DeliveryService;
#[cfg(feature = "ssr")]
pub use sync::SyncController;
