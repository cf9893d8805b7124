//! Durable Store
//!
//! The persistence contract behind the delivery service and the sync
//! engine: notification inbox and analytics, the offline operation queue,
//! synced records with their versions, conflicts, sync status and history.
//!
//! # Module Structure
//!
//! ```text
//! store/
//! ├── mod.rs        - `Store` trait, `StoreError`, commit/transition shapes
//! ├── memory.rs     - `MemoryStore` (single `RwLock`, used without DATABASE_URL)
//! └── postgres.rs   - `PgStore` (sqlx, one transaction per multi-row call)
//! ```
//!
//! # Atomicity
//!
//! Every method is atomic on its own. `commit_operation` is the one that
//! matters most: it reads the record version, writes the record and its
//! version, records or closes the conflict and finishes the op, all or
//! nothing. A version that moved since the caller read it fails the whole
//! commit with `StoreError::Conflict`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::shared::{
    AnalyticsCounts, AnalyticsEvent, Notification, OfflineOperation, OperationState,
    ServerRecord, Strategy, SyncConflict, SyncHistoryEntry, SyncStatus, UserId,
};

pub mod memory;
pub mod postgres;

#[cfg(test)]
pub(crate) mod flaky;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Store failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Unique key already taken
    #[error("duplicate {entity}: {key}")]
    Duplicate { entity: &'static str, key: String },

    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    /// Optimistic check failed: a version or an op state moved
    #[error("write conflict: {0}")]
    Conflict(String),

    /// Backend unreachable, timed out or refused; safe to retry
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A row could not be decoded
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// The requested state change is not an edge of the op state machine
    #[error("illegal operation transition {} -> {}", .from.as_str(), .to.as_str())]
    IllegalTransition {
        from: OperationState,
        to: OperationState,
    },
}

impl StoreError {
    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        Self::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    pub fn duplicate(entity: &'static str, key: impl ToString) -> Self {
        Self::Duplicate {
            entity,
            key: key.to_string(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

pub type SharedStore = Arc<dyn Store>;

/// A compare-and-set write of one record
#[derive(Debug, Clone, PartialEq)]
pub struct RecordWrite {
    pub table: String,
    pub record_id: String,
    /// Version the writer read; `0` when the record never existed
    pub expected_version: i64,
    /// `None` writes a tombstone
    pub value: Option<Value>,
}

/// What a commit does to the conflict table
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictChange {
    None,
    /// Record a conflict (already resolved or not)
    Insert(SyncConflict),
    /// Close an unresolved conflict
    Resolve {
        id: Uuid,
        resolved: Option<Value>,
        strategy: Strategy,
    },
}

/// Finish an op as `applied`, optionally writing a record
#[derive(Debug, Clone, PartialEq)]
pub struct OpCommit {
    pub user_id: UserId,
    pub op_id: String,
    /// State the op must still be in (`in-flight`, or `conflicted` on manual resolve)
    pub expected_state: OperationState,
    pub write: Option<RecordWrite>,
    pub conflict: ConflictChange,
    pub at: DateTime<Utc>,
}

/// Move an op between non-applied states in one write.
///
/// `via` names the intermediate state of a two-edge move, so a retry is
/// `in-flight → failed → pending` and never rests in `failed`.
#[derive(Debug, Clone, PartialEq)]
pub struct OpTransition {
    pub user_id: UserId,
    pub op_id: String,
    pub from: OperationState,
    pub via: Option<OperationState>,
    pub to: OperationState,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Give back the attempt the claim counted (op released unprocessed)
    pub undo_claim: bool,
    pub at: DateTime<Utc>,
}

impl OpTransition {
    /// Every step of the move is an edge of the state machine
    pub fn check(&self) -> Result<(), StoreError> {
        let (first, second) = match self.via {
            Some(via) => ((self.from, via), Some((via, self.to))),
            None => ((self.from, self.to), None),
        };
        for (from, to) in std::iter::once(first).chain(second) {
            if !from.can_transition(to) {
                return Err(StoreError::IllegalTransition { from, to });
            }
        }
        Ok(())
    }
}

/// Which pending ops a claim may take
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClaimFilter {
    pub limit: usize,
    pub now: DateTime<Utc>,
    /// Only ops created strictly after this instant (selective sync)
    pub created_after: Option<DateTime<Utc>>,
}

/// Persistence used by the delivery service and the sync engine
#[async_trait]
pub trait Store: Send + Sync + 'static {
    // Notifications

    /// Insert and trim the user's inbox to `inbox_limit`; returns trimmed ids
    async fn insert_notification(
        &self,
        notification: &Notification,
        inbox_limit: usize,
    ) -> Result<Vec<Uuid>, StoreError>;

    async fn get_notification(&self, id: Uuid) -> Result<Option<Notification>, StoreError>;

    /// Newest first
    async fn list_notifications(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<Notification>, StoreError>;

    /// Set `delivered_at` if unset; returns whether this call set it
    async fn mark_delivered(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Set `read_at` if unset; returns whether this call set it
    async fn mark_read(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError>;

    async fn record_analytics(
        &self,
        notification_id: Uuid,
        event: AnalyticsEvent,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn analytics_counts(&self, notification_id: Uuid) -> Result<AnalyticsCounts, StoreError>;

    // Offline operations

    /// Insert a pending op and assign its `seq`.
    ///
    /// Fails with `Duplicate` when `(user_id, op_id)` exists and is either
    /// non-terminal or was last touched at or after `reuse_before`. An
    /// older terminal row is replaced.
    async fn insert_operation(
        &self,
        op: &OfflineOperation,
        reuse_before: DateTime<Utc>,
    ) -> Result<OfflineOperation, StoreError>;

    async fn get_operation(
        &self,
        user_id: UserId,
        op_id: &str,
    ) -> Result<Option<OfflineOperation>, StoreError>;

    /// Newest first
    async fn list_operations(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<OfflineOperation>, StoreError>;

    async fn count_operations(
        &self,
        user_id: UserId,
        states: &[OperationState],
    ) -> Result<i64, StoreError>;

    /// Move up to `filter.limit` of the oldest due pending ops to
    /// `in-flight`, bumping `attempts`; FIFO by `seq`
    async fn claim_operations(
        &self,
        user_id: UserId,
        filter: ClaimFilter,
    ) -> Result<Vec<OfflineOperation>, StoreError>;

    /// Conditional state change; `Ok(false)` when the op is not in `from`.
    /// Fails with `IllegalTransition` before touching anything when the
    /// path leaves the state machine.
    async fn transition_operation(&self, transition: &OpTransition) -> Result<bool, StoreError>;

    /// Atomically write the record, touch the conflict table and mark the op
    /// `applied`. Returns the new record when one was written.
    async fn commit_operation(&self, commit: &OpCommit) -> Result<Option<ServerRecord>, StoreError>;

    /// Insert an unresolved conflict and move the op `in-flight → conflicted`
    async fn park_conflict(
        &self,
        conflict: &SyncConflict,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Users owning at least one pending op due at `now`
    async fn users_with_due_operations(&self, now: DateTime<Utc>) -> Result<Vec<UserId>, StoreError>;

    /// In-flight ops untouched since `stale_before`
    async fn stale_in_flight(
        &self,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<OfflineOperation>, StoreError>;

    /// Delete applied and dead ops last touched before `cutoff`
    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    // Records

    async fn get_record(
        &self,
        table: &str,
        record_id: &str,
    ) -> Result<Option<ServerRecord>, StoreError>;

    /// Compare-and-set write outside the op queue (server-side writers)
    async fn write_record(
        &self,
        write: &RecordWrite,
        writer: UserId,
        at: DateTime<Utc>,
    ) -> Result<ServerRecord, StoreError>;

    // Conflicts

    async fn get_conflict(&self, id: Uuid) -> Result<Option<SyncConflict>, StoreError>;

    /// Newest first
    async fn list_conflicts(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<SyncConflict>, StoreError>;

    // Sync status and history

    async fn get_status(&self, user_id: UserId) -> Result<Option<SyncStatus>, StoreError>;

    /// Flip `online`; going online stamps `last_online_at`
    async fn set_online(
        &self,
        user_id: UserId,
        online: bool,
        at: DateTime<Utc>,
    ) -> Result<SyncStatus, StoreError>;

    /// Recompute `pending_count` and `conflict_count` from the op and conflict rows
    async fn refresh_status(&self, user_id: UserId) -> Result<SyncStatus, StoreError>;

    /// Recompute counts, store the new token and append the history row
    async fn complete_sync(
        &self,
        entry: &SyncHistoryEntry,
        sync_token: i64,
    ) -> Result<SyncStatus, StoreError>;

    /// Newest first
    async fn list_history(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<SyncHistoryEntry>, StoreError>;
}
