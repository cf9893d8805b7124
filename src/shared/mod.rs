//! Shared Module
//!
//! Types that travel between the server and its clients: realtime envelopes
//! and inbound frames, notification records, the offline-sync data model,
//! configuration and the shared error type.
//!
//! # Overview
//!
//! Nothing in here touches the network, the database or the clock. All
//! types are plain data designed for serde, so client SDKs and tools can
//! depend on this module without pulling in the server stack.

/// Shared error types
pub mod error;

/// Realtime envelopes (server → client) and inbound frames (client → server)
pub mod envelope;

/// Notification records and delivery analytics
pub mod notification;

/// Offline operations, conflicts and sync status
pub mod sync;

/// Application configuration
pub mod config;

/// Numeric identity of an authenticated user
pub type UserId = i64;

/// Re-export commonly used types for convenience
pub use config::{AppConfig, AppConfigBuilder, ConfigError};
pub use envelope::{Envelope, EnvelopeType, InboundFrame, PresenceStatus};
pub use error::SharedError;
pub use notification::{AnalyticsCounts, AnalyticsEvent, Notification};
pub use sync::{
    ConflictStatus, ConflictType, NewOperation, OfflineOperation, OperationKind, OperationState,
    ServerRecord, Strategy, SyncConflict, SyncHistoryEntry, SyncOutcome, SyncStatus,
};
