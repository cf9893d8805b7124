/**
 * Sync Controller
 *
 * Drains one user's operation queue end to end:
 *
 * 1. take the per-user sync lock (`Busy` when another run holds it)
 * 2. mark the user online (full and selective runs only)
 * 3. claim batches FIFO; for each op read the record, ask the resolver,
 *    then commit, park or fail the op
 * 4. recompute counts, mint a sync token and append a history row
 *
 * Applied ops push a `data_update` to the user's live sessions; parked
 * conflicts send a durable `conflict_pending` notification.
 *
 * # Failure handling
 *
 * Per-op store errors never fail the run. A version that moved between
 * read and commit finishes the op as `failed(race)` with an immediate
 * retry; other store errors use the backoff schedule. Each op runs under
 * `sync.op_timeout`.
 *
 * # Shutdown
 *
 * When the shutdown signal flips, the op being processed is finished and
 * the rest of the claimed batch is released: back to `pending`, due now,
 * with the claim's attempt given back. Released ops are not counted as
 * processed.
 *
 * A claim that fails before any op was processed fails the run. One that
 * fails later ends the drain early and the run reports `partial`.
 */
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

use crate::backend::delivery::DeliveryService;
use crate::backend::error::BackendError;
use crate::backend::runtime::{IdSource, KeyedGuard, KeyedLocks, SharedClock};
use crate::backend::store::{
    ConflictChange, OpCommit, RecordWrite, SharedStore, StoreError,
};
use crate::backend::sync::queue::{OperationQueue, Outcome};
use crate::backend::sync::resolver::{ConflictResolver, Decision, Effect, Resolution};
use crate::shared::{
    ConflictStatus, OfflineOperation, OperationState, ServerRecord, Strategy, SyncConflict,
    SyncHistoryEntry, SyncOutcome, SyncStatus, UserId,
};

/// Notification kind sent when a conflict waits for a manual decision
pub const CONFLICT_PENDING_KIND: &str = "conflict_pending";

/// Which ops a run drains
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SyncMode {
    Full,
    /// Only ops created after the cursor
    Since(DateTime<Utc>),
    /// Full drain that neither needs nor changes `online`
    Force,
}

impl SyncMode {
    fn created_after(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Since(cursor) => Some(*cursor),
            _ => None,
        }
    }
}

/// Result of one sync run
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SyncReport {
    pub user_id: UserId,
    pub processed: i64,
    pub applied: i64,
    pub conflicted: i64,
    pub failed: i64,
    pub conflicts_resolved: i64,
    pub outcome: SyncOutcome,
    pub sync_token: i64,
    pub status: SyncStatus,
}

#[derive(Debug, Default)]
struct Tally {
    processed: i64,
    applied: i64,
    conflicted: i64,
    failed: i64,
    conflicts_resolved: i64,
    max_created_micros: Option<i64>,
    /// The drain stopped on a store error after making progress
    interrupted: bool,
}

impl Tally {
    fn count(&mut self, op: &OfflineOperation, state: OperationState, settled: bool) {
        self.processed += 1;
        let created = op.created_at.timestamp_micros();
        self.max_created_micros = Some(self.max_created_micros.map_or(created, |m| m.max(created)));
        match state {
            OperationState::Applied => {
                self.applied += 1;
                if settled {
                    self.conflicts_resolved += 1;
                }
            }
            OperationState::Conflicted => self.conflicted += 1,
            _ => self.failed += 1,
        }
    }

    fn outcome(&self) -> SyncOutcome {
        if self.processed == 0 {
            SyncOutcome::Empty
        } else if self.applied == self.processed && !self.interrupted {
            SyncOutcome::Success
        } else if self.applied == 0 {
            SyncOutcome::Failed
        } else {
            SyncOutcome::Partial
        }
    }
}

pub struct SyncController {
    queue: Arc<OperationQueue>,
    resolver: Arc<ConflictResolver>,
    delivery: DeliveryService,
    store: SharedStore,
    clock: SharedClock,
    ids: Arc<IdSource>,
    locks: KeyedLocks<UserId>,
    shutdown: watch::Receiver<bool>,
}

impl SyncController {
    pub fn new(
        queue: Arc<OperationQueue>,
        resolver: Arc<ConflictResolver>,
        delivery: DeliveryService,
        clock: SharedClock,
        ids: Arc<IdSource>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store: queue.store().clone(),
            queue,
            resolver,
            delivery,
            clock,
            ids,
            locks: KeyedLocks::new(),
            shutdown,
        }
    }

    pub fn queue(&self) -> &Arc<OperationQueue> {
        &self.queue
    }

    pub fn resolver(&self) -> &Arc<ConflictResolver> {
        &self.resolver
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub(crate) fn lock(&self, user_id: UserId) -> Result<KeyedGuard<UserId>, BackendError> {
        self.locks.try_acquire(user_id).ok_or_else(|| {
            BackendError::busy(format!("a sync for user {} is already running", user_id))
        })
    }

    pub fn is_syncing(&self, user_id: UserId) -> bool {
        self.locks.is_locked(&user_id)
    }

    pub async fn sync(&self, user_id: UserId) -> Result<SyncReport, BackendError> {
        self.run(user_id, SyncMode::Full).await
    }

    pub async fn sync_since(&self, user_id: UserId, cursor: DateTime<Utc>) -> Result<SyncReport, BackendError> {
        self.run(user_id, SyncMode::Since(cursor)).await
    }

    pub async fn force_sync(&self, user_id: UserId) -> Result<SyncReport, BackendError> {
        self.run(user_id, SyncMode::Force).await
    }

    pub async fn run(&self, user_id: UserId, mode: SyncMode) -> Result<SyncReport, BackendError> {
        let _guard = self.lock(user_id)?;
        let started_at = self.now();
        let previous = self.store.get_status(user_id).await?;
        if mode != SyncMode::Force {
            self.store.set_online(user_id, true, started_at).await?;
        }

        tracing::info!("[Sync] Starting {:?} sync for user {}", mode, user_id);
        let batch_size = self.queue.config().batch_size;
        let mut tally = Tally::default();

        'drain: while !self.stopping() {
            let batch = match self
                .queue
                .claim_batch(user_id, batch_size, mode.created_after())
                .await
            {
                Ok(batch) => batch,
                // Nothing happened yet: the caller sees the store error
                Err(e) if tally.processed == 0 => return Err(e.into()),
                Err(e) => {
                    tracing::warn!(
                        "[Sync] Claim for user {} failed after {} ops, stopping early: {}",
                        user_id,
                        tally.processed,
                        e
                    );
                    tally.interrupted = true;
                    break;
                }
            };
            if batch.is_empty() {
                break;
            }

            let mut ops = batch.into_iter();
            while let Some(op) = ops.next() {
                if self.stopping() {
                    self.release(&op).await;
                    for rest in ops.by_ref() {
                        self.release(&rest).await;
                    }
                    break 'drain;
                }
                self.step(&op, &mut tally).await;
                tokio::task::yield_now().await;
            }
        }

        let sync_token = self.mint_token(mode, previous.as_ref(), &tally);
        let entry = SyncHistoryEntry {
            id: Uuid::new_v4(),
            user_id,
            started_at,
            finished_at: self.now(),
            processed: tally.processed,
            conflicts_resolved: tally.conflicts_resolved,
            outcome: tally.outcome(),
        };
        let status = self.store.complete_sync(&entry, sync_token).await?;

        tracing::info!(
            "[Sync] User {} {}: {} processed, {} applied, {} conflicted, {} failed",
            user_id,
            entry.outcome.as_str(),
            tally.processed,
            tally.applied,
            tally.conflicted,
            tally.failed
        );
        Ok(SyncReport {
            user_id,
            processed: tally.processed,
            applied: tally.applied,
            conflicted: tally.conflicted,
            failed: tally.failed,
            conflicts_resolved: tally.conflicts_resolved,
            outcome: entry.outcome,
            sync_token,
            status,
        })
    }

    fn mint_token(&self, mode: SyncMode, previous: Option<&SyncStatus>, tally: &Tally) -> i64 {
        let token = match mode {
            SyncMode::Since(cursor) => {
                let existing = previous.and_then(|s| s.sync_token).unwrap_or(0);
                existing
                    .max(tally.max_created_micros.unwrap_or(0))
                    .max(cursor.timestamp_micros())
            }
            SyncMode::Full | SyncMode::Force => self.ids.monotonic_id(),
        };
        self.ids.observe(token);
        token
    }

    /// Give a claimed op back without processing it. A failed release
    /// leaves the op in flight for the retry sweep to recover.
    async fn release(&self, op: &OfflineOperation) {
        if let Err(e) = self.queue.release(op).await {
            tracing::error!("[Sync] Could not release op {}: {}", op.op_id, e);
        }
    }

    async fn step(&self, op: &OfflineOperation, tally: &mut Tally) {
        let limit = self.queue.config().op_timeout;
        match tokio::time::timeout(limit, self.process(op)).await {
            Ok((state, settled)) => tally.count(op, state, settled),
            Err(_) => {
                tracing::warn!("[Sync] Op {} timed out after {:?}", op.op_id, limit);
                let state = self.fail(op, Outcome::failed("timeout")).await;
                tally.count(op, state, false);
            }
        }
    }

    async fn fail(&self, op: &OfflineOperation, outcome: Outcome) -> OperationState {
        match self.queue.finish(op, outcome).await {
            Ok(finished) => finished.state,
            Err(e) => {
                tracing::error!("[Sync] Could not finish op {}: {}", op.op_id, e);
                OperationState::InFlight
            }
        }
    }

    /// Returns the op's new state and whether a conflict was settled inline
    async fn process(&self, op: &OfflineOperation) -> (OperationState, bool) {
        let current = match self.store.get_record(&op.table, &op.record_id).await {
            Ok(current) => current,
            Err(e) => return (self.fail(op, Outcome::failed(e.to_string())).await, false),
        };

        match self.resolver.decide(op, current.as_ref(), self.now()) {
            Decision::Apply(resolution) => self.apply(op, current, resolution).await,
            Decision::Park(conflict) => (self.park(op, conflict).await, false),
        }
    }

    async fn apply(
        &self,
        op: &OfflineOperation,
        current: Option<ServerRecord>,
        resolution: Resolution,
    ) -> (OperationState, bool) {
        let now = self.now();
        let settled = resolution.settled.is_some();
        let commit = OpCommit {
            user_id: op.user_id,
            op_id: op.op_id.clone(),
            expected_state: OperationState::InFlight,
            write: record_write(op, &resolution.effect),
            conflict: resolution
                .settled
                .map(|s| ConflictChange::Insert(s.into_conflict(op, now)))
                .unwrap_or(ConflictChange::None),
            at: now,
        };

        match self.queue.finish(op, Outcome::Applied(commit)).await {
            Ok(finished) => {
                self.publish(op.user_id, finished.record.or(current)).await;
                (finished.state, settled)
            }
            Err(StoreError::Conflict(reason)) => {
                tracing::debug!("[Sync] Op {} lost a race: {}", op.op_id, reason);
                (self.fail(op, Outcome::failed_now(format!("race: {}", reason))).await, false)
            }
            Err(e) => {
                if !e.is_transient() {
                    tracing::error!("[Sync] Commit of op {} failed: {}", op.op_id, e);
                }
                (self.fail(op, Outcome::failed(e.to_string())).await, false)
            }
        }
    }

    async fn park(&self, op: &OfflineOperation, conflict: SyncConflict) -> OperationState {
        let id = conflict.id;
        let data = json!({
            "conflict_id": id,
            "op_id": op.op_id,
            "table": op.table,
            "record_id": op.record_id,
            "type": conflict.conflict_type.as_str(),
        });
        match self.queue.finish(op, Outcome::Conflicted(conflict)).await {
            Ok(finished) => {
                let body = format!("{} {} needs a decision", op.table, op.record_id);
                if let Err(e) = self
                    .delivery
                    .notify(op.user_id, CONFLICT_PENDING_KIND, "Sync conflict", &body, data)
                    .await
                {
                    tracing::warn!("[Sync] Conflict {} notification failed: {}", id, e.message());
                }
                finished.state
            }
            Err(e) => self.fail(op, Outcome::failed(e.to_string())).await,
        }
    }

    async fn publish(&self, user_id: UserId, record: Option<ServerRecord>) {
        let Some(record) = record else {
            return;
        };
        let payload = json!({
            "record_id": record.record_id,
            "version": record.version,
            "value": record.value,
            "deleted": record.value.is_none(),
        });
        if let Err(e) = self.delivery.data_update(user_id, &record.table, payload).await {
            tracing::warn!("[Sync] data_update for user {} failed: {}", user_id, e.message());
        }
    }

    /// Close a parked conflict with an automatic strategy
    pub async fn resolve_conflict(
        &self,
        user_id: UserId,
        conflict_id: Uuid,
        strategy: Strategy,
    ) -> Result<SyncConflict, BackendError> {
        ConflictResolver::check_resolvable(strategy)?;
        let _guard = self.lock(user_id)?;

        let conflict = self.owned_conflict(user_id, conflict_id).await?;
        if conflict.status != ConflictStatus::Unresolved {
            return Err(BackendError::conflict(format!(
                "conflict {} is already resolved",
                conflict_id
            )));
        }
        let op = self
            .store
            .get_operation(user_id, &conflict.op_id)
            .await?
            .ok_or_else(|| BackendError::not_found("operation", &conflict.op_id))?;
        if op.state != OperationState::Conflicted {
            return Err(BackendError::conflict(format!(
                "operation {} is {}",
                op.op_id,
                op.state.as_str()
            )));
        }

        let current = self.store.get_record(&op.table, &op.record_id).await?;
        let resolution = self
            .resolver
            .settle(&op, current.as_ref(), conflict.conflict_type, strategy);
        let (resolved, used) = match &resolution.settled {
            Some(s) => (Some(s.resolved.clone()), s.strategy),
            None => (None, strategy),
        };
        let now = self.now();
        let commit = OpCommit {
            user_id,
            op_id: op.op_id.clone(),
            expected_state: OperationState::Conflicted,
            write: record_write(&op, &resolution.effect),
            conflict: ConflictChange::Resolve {
                id: conflict_id,
                resolved,
                strategy: used,
            },
            at: now,
        };
        let record = self.store.commit_operation(&commit).await?;
        self.store.refresh_status(user_id).await?;
        tracing::info!(
            "[Sync] Conflict {} of user {} resolved with {}",
            conflict_id,
            user_id,
            used.as_str()
        );
        self.publish(user_id, record).await;

        self.owned_conflict(user_id, conflict_id).await
    }

    async fn owned_conflict(&self, user_id: UserId, id: Uuid) -> Result<SyncConflict, BackendError> {
        match self.store.get_conflict(id).await? {
            Some(c) if c.user_id == user_id => Ok(c),
            _ => Err(BackendError::not_found("conflict", id)),
        }
    }

    pub async fn conflicts(&self, user_id: UserId, limit: usize) -> Result<Vec<SyncConflict>, BackendError> {
        Ok(self.store.list_conflicts(user_id, limit).await?)
    }

    pub async fn history(&self, user_id: UserId, limit: usize) -> Result<Vec<SyncHistoryEntry>, BackendError> {
        Ok(self.store.list_history(user_id, limit).await?)
    }

    pub async fn set_online(&self, user_id: UserId, online: bool) -> Result<SyncStatus, BackendError> {
        self.store.set_online(user_id, online, self.now()).await?;
        Ok(self.store.refresh_status(user_id).await?)
    }

    /// Runtime strategy for one of the user's tables
    pub fn set_strategy(&self, user_id: UserId, table: &str, strategy: Strategy) -> Result<(), BackendError> {
        if !self.queue.config().allowed_tables.iter().any(|t| t == table) {
            return Err(BackendError::validation(
                "table",
                format!("table {} is not synced", table),
            ));
        }
        self.resolver.set_override(user_id, table, strategy);
        Ok(())
    }
}

fn record_write(op: &OfflineOperation, effect: &Effect) -> Option<RecordWrite> {
    match effect {
        Effect::Write {
            value,
            expected_version,
        } => Some(RecordWrite {
            table: op.table.clone(),
            record_id: op.record_id.clone(),
            expected_version: *expected_version,
            value: value.clone(),
        }),
        Effect::Noop => None,
    }
}
