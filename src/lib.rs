//! HubSync - Main Library
//!
//! HubSync is the realtime and offline-sync core of a mobile backend. It
//! keeps a registry of live client sessions, fans notifications and live
//! updates out to them, and drains per-user queues of mutations recorded by
//! clients while they were offline.
//!
//! # Module Structure
//!
//! - **`shared`** - Types shared between server and clients
//!   - Envelopes and inbound frames
//!   - Notification records, offline operations, conflicts, sync status
//!   - Configuration and error types
//!
//! - **`backend`** - Server-side code (only compiled with `ssr` feature)
//!   - Connection hub and WebSocket session loop
//!   - Delivery service (notifications, live updates, presence, typing)
//!   - Operation queue, conflict resolver, sync controller, retry loop
//!   - Store (Postgres or in-memory) and key-value cache
//!   - Axum routes, JWT authentication, error responses
//!
//! # Feature Flags
//!
//! - **`ssr`** - Server build (enabled by default). Pulls in Axum, tower,
//!   jsonwebtoken and the tracing subscriber.
//!
//! # Usage
//!
//! ```rust,no_run
//! use hubsync::backend::server::init::create_app;
//! use hubsync::shared::AppConfig;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::load()?;
//! let app = create_app(config).await?;
//! let router = app.router.clone();
//! // Serve `router` with axum, then call `app.shutdown().await`
//! # Ok(())
//! # }
//! ```
//!
//! # Thread Safety
//!
//! Every server component is `Send + Sync` and shared through `Arc`. The
//! hub guards its indexes with a single `tokio::sync::RwLock`; per-user
//! work (sync runs, notification ordering) is serialised with keyed locks.

/// Shared types and data structures
pub mod shared;

/// Backend server-side code
#[cfg(feature = "ssr")]
pub mod backend;
