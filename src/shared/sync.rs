//! Offline-sync data model
//!
//! Types for the per-user operation queue, conflict records, record versions,
//! sync status and sync history. These are the shapes the sync REST API
//! returns and the shapes the store persists.
//!
//! # Operation state machine
//!
//! ```text
//! pending ──claim──▶ in-flight ──▶ applied
//!    ▲                   │   ├────▶ conflicted ──resolve──▶ applied | failed
//!    │                   │   └────▶ failed
//!    └──────retry──── failed ──max attempts──▶ dead
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::shared::error::SharedError;
use crate::shared::UserId;

/// Mutation kind of an offline operation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl std::str::FromStr for OperationKind {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(SharedError::validation(
                "operation_type",
                format!("unknown operation kind: {}", other),
            )),
        }
    }
}

/// Queue state of an offline operation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum OperationState {
    Pending,
    InFlight,
    Applied,
    Conflicted,
    Failed,
    Dead,
}

impl OperationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in-flight",
            Self::Applied => "applied",
            Self::Conflicted => "conflicted",
            Self::Failed => "failed",
            Self::Dead => "dead",
        }
    }

    /// Applied and dead ops never move again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Applied | Self::Dead)
    }

    /// Whether `self → next` is an edge of the state machine
    pub fn can_transition(&self, next: OperationState) -> bool {
        use OperationState::*;
        matches!(
            (self, next),
            (Pending, InFlight)
                | (InFlight, Applied)
                | (InFlight, Conflicted)
                | (InFlight, Failed)
                | (Conflicted, Applied)
                | (Conflicted, Failed)
                | (Failed, Pending)
                | (Failed, Dead)
        )
    }
}

impl std::str::FromStr for OperationState {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in-flight" => Ok(Self::InFlight),
            "applied" => Ok(Self::Applied),
            "conflicted" => Ok(Self::Conflicted),
            "failed" => Ok(Self::Failed),
            "dead" => Ok(Self::Dead),
            other => Err(SharedError::validation(
                "state",
                format!("unknown operation state: {}", other),
            )),
        }
    }
}

/// A client mutation waiting to be applied to server state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OfflineOperation {
    /// Client-chosen idempotency key, unique per user
    pub op_id: String,
    /// Server-assigned enqueue order; claims are FIFO on it
    #[serde(default)]
    pub seq: i64,
    pub user_id: UserId,
    pub kind: OperationKind,
    pub table: String,
    pub record_id: String,
    pub payload: Value,
    /// Version of the record the client last saw (`v_client`)
    pub base_version: Option<i64>,
    pub state: OperationState,
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input to `OperationQueue::enqueue`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewOperation {
    pub op_id: Option<String>,
    pub kind: OperationKind,
    pub table: String,
    pub record_id: Option<String>,
    pub payload: Value,
    pub base_version: Option<i64>,
}

/// Kind of concurrent modification detected by the resolver
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictType {
    UpdateUpdate,
    UpdateDelete,
    DeleteUpdate,
}

impl ConflictType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UpdateUpdate => "update-update",
            Self::UpdateDelete => "update-delete",
            Self::DeleteUpdate => "delete-update",
        }
    }
}

impl std::str::FromStr for ConflictType {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "update-update" => Ok(Self::UpdateUpdate),
            "update-delete" => Ok(Self::UpdateDelete),
            "delete-update" => Ok(Self::DeleteUpdate),
            other => Err(SharedError::validation(
                "type",
                format!("unknown conflict type: {}", other),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Unresolved,
    Resolved,
}

impl ConflictStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unresolved => "unresolved",
            Self::Resolved => "resolved",
        }
    }
}

impl std::str::FromStr for ConflictStatus {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unresolved" => Ok(Self::Unresolved),
            "resolved" => Ok(Self::Resolved),
            other => Err(SharedError::validation(
                "status",
                format!("unknown conflict status: {}", other),
            )),
        }
    }
}

/// Conflict resolution policy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    #[serde(alias = "lww")]
    LastWriterWins,
    ServerWins,
    Merge,
    Manual,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LastWriterWins => "last-writer-wins",
            Self::ServerWins => "server-wins",
            Self::Merge => "merge",
            Self::Manual => "manual",
        }
    }
}

impl Default for Strategy {
    fn default() -> Self {
        Self::LastWriterWins
    }
}

impl std::str::FromStr for Strategy {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "last-writer-wins" | "lww" => Ok(Self::LastWriterWins),
            "server-wins" => Ok(Self::ServerWins),
            "merge" => Ok(Self::Merge),
            "manual" => Ok(Self::Manual),
            other => Err(SharedError::validation(
                "strategy",
                format!("unknown resolver strategy: {}", other),
            )),
        }
    }
}

/// A recorded conflict between a queued op and server state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncConflict {
    pub id: Uuid,
    pub user_id: UserId,
    pub op_id: String,
    pub table: String,
    pub record_id: String,
    #[serde(rename = "type")]
    pub conflict_type: ConflictType,
    /// The op's payload
    pub local: Value,
    /// Server value at detection time (`null` when the record was gone)
    pub server: Value,
    pub resolved: Option<Value>,
    pub strategy_used: Option<Strategy>,
    pub status: ConflictStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl SyncConflict {
    /// A conflict left for an external decision
    pub fn unresolved(
        op: &OfflineOperation,
        conflict_type: ConflictType,
        server: Value,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: op.user_id,
            op_id: op.op_id.clone(),
            table: op.table.clone(),
            record_id: op.record_id.clone(),
            conflict_type,
            local: op.payload.clone(),
            server,
            resolved: None,
            strategy_used: None,
            status: ConflictStatus::Unresolved,
            created_at: at,
            resolved_at: None,
        }
    }

    /// A conflict an automatic strategy settled on the spot
    pub fn resolved_with(
        op: &OfflineOperation,
        conflict_type: ConflictType,
        server: Value,
        resolved: Value,
        strategy: Strategy,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            resolved: Some(resolved),
            strategy_used: Some(strategy),
            status: ConflictStatus::Resolved,
            resolved_at: Some(at),
            ..Self::unresolved(op, conflict_type, server, at)
        }
    }
}

/// Current server state of one synced record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerRecord {
    pub table: String,
    pub record_id: String,
    /// `None` when the record has been deleted (tombstone)
    pub value: Option<Value>,
    pub version: i64,
    pub last_writer_user_id: UserId,
    pub last_written_at: DateTime<Utc>,
}

/// Per-user sync status view
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncStatus {
    pub user_id: UserId,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub sync_token: Option<i64>,
    pub pending_count: i64,
    pub conflict_count: i64,
    pub online: bool,
    pub last_online_at: Option<DateTime<Utc>>,
}

impl SyncStatus {
    pub fn empty(user_id: UserId) -> Self {
        Self {
            user_id,
            last_sync_at: None,
            sync_token: None,
            pending_count: 0,
            conflict_count: 0,
            online: false,
            last_online_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Nothing was waiting
    Empty,
    /// Every processed op was applied
    Success,
    /// Some ops conflicted or failed
    Partial,
    /// No processed op was applied
    Failed,
}

impl SyncOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for SyncOutcome {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "empty" => Ok(Self::Empty),
            "success" => Ok(Self::Success),
            "partial" => Ok(Self::Partial),
            "failed" => Ok(Self::Failed),
            other => Err(SharedError::validation(
                "outcome",
                format!("unknown sync outcome: {}", other),
            )),
        }
    }
}

/// One row of the append-only sync history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncHistoryEntry {
    pub id: Uuid,
    pub user_id: UserId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub processed: i64,
    pub conflicts_resolved: i64,
    pub outcome: SyncOutcome,
}
