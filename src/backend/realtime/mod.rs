//! Real-time Connection Module
//!
//! Keeps the registry of live client sessions and moves envelopes between
//! them and the rest of the server.
//!
//! # Architecture
//!
//! - **`hub`** - Session registry with user and room indexes, bounded
//!   outbound queues, heartbeat and idle reaping
//! - **`protocol`** - Dispatch of inbound client frames
//! - **`socket`** - `GET /ws` upgrade handler and per-connection loop
//!
//! # Module Structure
//!
//! ```text
//! realtime/
//! ├── mod.rs        - Module exports and documentation
//! ├── hub.rs        - `Hub` and session bookkeeping
//! ├── protocol.rs   - `SessionContext` frame handling
//! └── socket.rs     - WebSocket endpoint
//! ```
//!
//! # Delivery Guarantees
//!
//! Per session, envelopes are written in the order they were enqueued. A
//! session whose queue is full is treated as a slow consumer and reaped;
//! the rest of a fan-out is never held up by it.

/// Session registry
pub mod hub;

/// Inbound frame dispatch
pub mod protocol;

/// WebSocket endpoint
pub mod socket;

pub use hub::{
    DetachReason, Hub, HubEvent, HubStats, SessionHandle, SessionId, SessionInfo, MAX_UNACKED,
};
pub use protocol::{FrameOutcome, SessionContext};
pub use socket::ws_handler;
