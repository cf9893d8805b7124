//! Delivery Module
//!
//! Typed sending API on top of the hub: durable notifications with an
//! inbox and analytics, plus best-effort live updates, data updates,
//! typing indicators and presence.
//!
//! # Module Structure
//!
//! ```text
//! delivery/
//! ├── mod.rs        - Module exports and documentation
//! ├── service.rs    - `DeliveryService`
//! └── handlers.rs   - Inbox, ack, analytics, presence and hub stats endpoints
//! ```

/// Delivery service
pub mod service;

/// HTTP handlers
pub mod handlers;

pub use service::{Delivery, DeliveryService, SystemDelivery, DATA_UPDATE_KIND, SYSTEM_CHANNEL};
