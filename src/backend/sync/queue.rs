//! # Operation Queue
//!
//! Durable per-user FIFO of mutations recorded by clients while offline.
//!
//! ## Features
//!
//! - **Idempotent enqueue**: `(user, op_id)` is reserved while the op is
//!   live and for `sync.idempotency_window` after it terminates
//! - **FIFO claims**: oldest due `pending` ops move to `in-flight` in one
//!   store call, so two drains never claim the same op
//! - **Retry with backoff**: failures go back to `pending` until
//!   `retry.max_attempts`, then the op is `dead`
//! - **Depth ceiling**: at most `sync.max_queue_depth` live ops per user

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use crate::backend::error::BackendError;
use crate::backend::runtime::SharedClock;
use crate::backend::store::{
    ClaimFilter, OpCommit, OpTransition, SharedStore, StoreError,
};
use crate::backend::sync::backoff::Backoff;
use crate::shared::config::{RetryConfig, SyncConfig};
use crate::shared::{
    NewOperation, OfflineOperation, OperationKind, OperationState, ServerRecord, SyncConflict,
    SyncStatus, UserId,
};

/// Payload key a client may use instead of `base_version`
pub const VERSION_KEY: &str = "_version";

/// States that count towards the depth ceiling
const LIVE_STATES: [OperationState; 4] = [
    OperationState::Pending,
    OperationState::InFlight,
    OperationState::Conflicted,
    OperationState::Failed,
];

/// How an in-flight op ended
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Applied(OpCommit),
    Conflicted(SyncConflict),
    Failed {
        error: String,
        /// `None` uses the backoff schedule
        retry_after: Option<Duration>,
    },
}

impl Outcome {
    pub fn failed(error: impl Into<String>) -> Self {
        Self::Failed {
            error: error.into(),
            retry_after: None,
        }
    }

    /// Failure that may be retried right away
    pub fn failed_now(error: impl Into<String>) -> Self {
        Self::Failed {
            error: error.into(),
            retry_after: Some(Duration::ZERO),
        }
    }
}

/// State an op ended up in after `finish`
#[derive(Debug, Clone, PartialEq)]
pub struct Finished {
    pub state: OperationState,
    pub record: Option<ServerRecord>,
}

pub struct OperationQueue {
    store: SharedStore,
    clock: SharedClock,
    config: SyncConfig,
    backoff: Backoff,
    max_attempts: u32,
}

impl OperationQueue {
    pub fn new(store: SharedStore, clock: SharedClock, config: SyncConfig, retry: &RetryConfig) -> Self {
        Self {
            store,
            clock,
            config,
            backoff: Backoff::from_config(retry),
            max_attempts: retry.max_attempts,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Validate and persist a new `pending` op
    pub async fn enqueue(&self, user_id: UserId, new: NewOperation) -> Result<OfflineOperation, BackendError> {
        let op = self.build(user_id, new)?;

        let live = self.store.count_operations(user_id, &LIVE_STATES).await?;
        if live >= self.config.max_queue_depth as i64 {
            return Err(BackendError::capacity(format!(
                "user {} already has {} queued operations",
                user_id, live
            )));
        }

        let window = chrono::Duration::from_std(self.config.idempotency_window)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let stored = self.store.insert_operation(&op, op.created_at - window).await?;
        self.store.refresh_status(user_id).await?;

        tracing::info!(
            "[Sync] Queued {} {} {}/{} for user {} (op {})",
            stored.kind.as_str(),
            stored.state.as_str(),
            stored.table,
            stored.record_id,
            user_id,
            stored.op_id
        );
        Ok(stored)
    }

    fn build(&self, user_id: UserId, new: NewOperation) -> Result<OfflineOperation, BackendError> {
        if !self.config.allowed_tables.iter().any(|t| t == &new.table) {
            return Err(BackendError::validation(
                "table_name",
                format!("table {} is not synced", new.table),
            ));
        }

        let op_id = match new.op_id {
            Some(id) if id.trim().is_empty() => {
                return Err(BackendError::validation("op_id", "must not be empty"))
            }
            Some(id) => id,
            None => Uuid::new_v4().to_string(),
        };

        let record_id = match (new.record_id, new.kind) {
            (Some(id), _) if !id.trim().is_empty() => id,
            (_, OperationKind::Create) => Uuid::new_v4().to_string(),
            (_, kind) => {
                return Err(BackendError::validation(
                    "record_id",
                    format!("required for {}", kind.as_str()),
                ))
            }
        };

        let mut payload = new.payload;
        let embedded = match payload.as_object_mut() {
            Some(fields) => fields.remove(VERSION_KEY),
            None => None,
        };
        let base_version = match (new.base_version, embedded) {
            (Some(v), _) => Some(v),
            (None, Some(Value::Number(n))) => Some(n.as_i64().ok_or_else(|| {
                BackendError::validation(VERSION_KEY, "must be an integer")
            })?),
            (None, Some(Value::Null)) | (None, None) => None,
            (None, Some(_)) => {
                return Err(BackendError::validation(VERSION_KEY, "must be an integer"))
            }
        };
        if new.kind != OperationKind::Delete && !payload.is_object() {
            return Err(BackendError::validation("data", "must be a JSON object"));
        }

        let now = self.now();
        Ok(OfflineOperation {
            op_id,
            seq: 0,
            user_id,
            kind: new.kind,
            table: new.table,
            record_id,
            payload,
            base_version,
            state: OperationState::Pending,
            attempts: 0,
            next_attempt_at: now,
            last_error: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Claim up to `limit` due ops, oldest first
    pub async fn claim_batch(
        &self,
        user_id: UserId,
        limit: usize,
        created_after: Option<DateTime<Utc>>,
    ) -> Result<Vec<OfflineOperation>, StoreError> {
        self.store
            .claim_operations(
                user_id,
                ClaimFilter {
                    limit,
                    now: self.now(),
                    created_after,
                },
            )
            .await
    }

    /// Move an in-flight op to its outcome
    pub async fn finish(&self, op: &OfflineOperation, outcome: Outcome) -> Result<Finished, StoreError> {
        match outcome {
            Outcome::Applied(commit) => {
                let record = self.store.commit_operation(&commit).await?;
                Ok(Finished {
                    state: OperationState::Applied,
                    record,
                })
            }
            Outcome::Conflicted(conflict) => {
                self.store.park_conflict(&conflict, self.now()).await?;
                Ok(Finished {
                    state: OperationState::Conflicted,
                    record: None,
                })
            }
            Outcome::Failed { error, retry_after } => {
                let state = self.fail(op, &error, retry_after).await?;
                Ok(Finished { state, record: None })
            }
        }
    }

    /// `in-flight → failed → pending|dead` as one store write
    async fn fail(
        &self,
        op: &OfflineOperation,
        error: &str,
        retry_after: Option<Duration>,
    ) -> Result<OperationState, StoreError> {
        let now = self.now();
        let exhausted = op.attempts >= self.max_attempts;
        let (to, next) = if exhausted {
            (OperationState::Dead, None)
        } else {
            let delay = retry_after.unwrap_or_else(|| self.backoff.delay(op.attempts));
            let next = now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            (OperationState::Pending, Some(next))
        };

        let moved = self
            .store
            .transition_operation(&OpTransition {
                user_id: op.user_id,
                op_id: op.op_id.clone(),
                from: OperationState::InFlight,
                via: Some(OperationState::Failed),
                to,
                next_attempt_at: next,
                last_error: Some(error.to_string()),
                undo_claim: false,
                at: now,
            })
            .await?;
        if !moved {
            return self.current_state(op).await;
        }

        if exhausted {
            tracing::warn!(
                "[Sync] Op {} of user {} is dead after {} attempts: {}",
                op.op_id,
                op.user_id,
                op.attempts,
                error
            );
        } else {
            tracing::debug!(
                "[Sync] Op {} of user {} failed ({}), retry at {:?}",
                op.op_id,
                op.user_id,
                error,
                next
            );
        }
        Ok(to)
    }

    /// Hand a claimed op back untouched: `pending` again, due now, and the
    /// claim's attempt is not counted
    pub async fn release(&self, op: &OfflineOperation) -> Result<bool, StoreError> {
        let moved = self
            .store
            .transition_operation(&OpTransition {
                user_id: op.user_id,
                op_id: op.op_id.clone(),
                from: OperationState::InFlight,
                via: Some(OperationState::Failed),
                to: OperationState::Pending,
                next_attempt_at: None,
                last_error: None,
                undo_claim: true,
                at: self.now(),
            })
            .await?;
        if moved {
            tracing::debug!("[Sync] Released op {} of user {}", op.op_id, op.user_id);
        }
        Ok(moved)
    }

    /// State of an op another writer moved first
    async fn current_state(&self, op: &OfflineOperation) -> Result<OperationState, StoreError> {
        let current = self
            .store
            .get_operation(op.user_id, &op.op_id)
            .await?
            .ok_or_else(|| StoreError::not_found("operation", &op.op_id))?;
        tracing::debug!(
            "[Sync] Op {} was already {}",
            op.op_id,
            current.state.as_str()
        );
        Ok(current.state)
    }

    pub async fn get(&self, user_id: UserId, op_id: &str) -> Result<OfflineOperation, BackendError> {
        self.store
            .get_operation(user_id, op_id)
            .await?
            .ok_or_else(|| BackendError::not_found("operation", op_id))
    }

    pub async fn list(&self, user_id: UserId, limit: usize) -> Result<Vec<OfflineOperation>, BackendError> {
        Ok(self.store.list_operations(user_id, limit).await?)
    }

    /// Status with counts recomputed from the store
    pub async fn status(&self, user_id: UserId) -> Result<SyncStatus, BackendError> {
        Ok(self.store.refresh_status(user_id).await?)
    }

    /// In-flight ops nobody finished within `older_than`
    pub async fn stale(&self, older_than: Duration) -> Result<Vec<OfflineOperation>, StoreError> {
        let age = chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());
        self.store.stale_in_flight(self.now() - age).await
    }

    /// Drop applied and dead ops whose id reservation has expired
    pub async fn purge_expired(&self) -> Result<u64, StoreError> {
        let window = chrono::Duration::from_std(self.config.idempotency_window)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        self.store.purge_terminal_before(self.now() - window).await
    }

    pub async fn users_with_due_operations(&self) -> Result<Vec<UserId>, StoreError> {
        self.store.users_with_due_operations(self.now()).await
    }
}
