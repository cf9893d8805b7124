/**
 * In-Memory Store
 *
 * All tables live behind one `tokio::sync::RwLock`. Every trait method
 * takes the lock once, validates everything it is about to touch, and only
 * then mutates, so a failed call leaves no partial state behind.
 *
 * Used when `DATABASE_URL` is not configured and by the test suite.
 */
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::backend::store::{
    ClaimFilter, ConflictChange, OpCommit, OpTransition, RecordWrite, Store, StoreError,
};
use crate::shared::{
    AnalyticsCounts, AnalyticsEvent, ConflictStatus, Notification, OfflineOperation,
    OperationState, ServerRecord, SyncConflict, SyncHistoryEntry, SyncStatus, UserId,
};

type OpKey = (UserId, String);
type RecordKey = (String, String);

#[derive(Default)]
struct Tables {
    notifications: HashMap<Uuid, Notification>,
    /// Per-user notification ids, oldest first
    inboxes: HashMap<UserId, VecDeque<Uuid>>,
    analytics: Vec<(Uuid, AnalyticsEvent, DateTime<Utc>)>,
    operations: HashMap<OpKey, OfflineOperation>,
    next_seq: i64,
    records: HashMap<RecordKey, ServerRecord>,
    conflicts: HashMap<Uuid, SyncConflict>,
    statuses: HashMap<UserId, SyncStatus>,
    history: Vec<SyncHistoryEntry>,
}

impl Tables {
    fn check_version(&self, write: &RecordWrite) -> Result<(), StoreError> {
        let current = self
            .records
            .get(&(write.table.clone(), write.record_id.clone()))
            .map(|r| r.version)
            .unwrap_or(0);
        if current != write.expected_version {
            return Err(StoreError::Conflict(format!(
                "{}/{} is at version {}, expected {}",
                write.table, write.record_id, current, write.expected_version
            )));
        }
        Ok(())
    }

    fn apply_write(&mut self, write: &RecordWrite, writer: UserId, at: DateTime<Utc>) -> ServerRecord {
        let record = ServerRecord {
            table: write.table.clone(),
            record_id: write.record_id.clone(),
            value: write.value.clone(),
            version: write.expected_version + 1,
            last_writer_user_id: writer,
            last_written_at: at,
        };
        self.records
            .insert((write.table.clone(), write.record_id.clone()), record.clone());
        record
    }

    fn status_mut(&mut self, user_id: UserId) -> &mut SyncStatus {
        self.statuses
            .entry(user_id)
            .or_insert_with(|| SyncStatus::empty(user_id))
    }

    fn refresh_counts(&mut self, user_id: UserId) -> SyncStatus {
        let pending = self
            .operations
            .values()
            .filter(|op| op.user_id == user_id && op.state == OperationState::Pending)
            .count() as i64;
        let conflicts = self
            .conflicts
            .values()
            .filter(|c| c.user_id == user_id && c.status == ConflictStatus::Unresolved)
            .count() as i64;
        let status = self.status_mut(user_id);
        status.pending_count = pending;
        status.conflict_count = conflicts;
        status.clone()
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn op_key(user_id: UserId, op_id: &str) -> OpKey {
    (user_id, op_id.to_string())
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_notification(
        &self,
        notification: &Notification,
        inbox_limit: usize,
    ) -> Result<Vec<Uuid>, StoreError> {
        let mut t = self.tables.write().await;
        if t.notifications.contains_key(&notification.id) {
            return Err(StoreError::duplicate("notification", notification.id));
        }
        t.notifications.insert(notification.id, notification.clone());
        let inbox = t.inboxes.entry(notification.user_id).or_default();
        inbox.push_back(notification.id);

        let mut trimmed = Vec::new();
        while inbox.len() > inbox_limit {
            if let Some(oldest) = inbox.pop_front() {
                trimmed.push(oldest);
            }
        }
        for id in &trimmed {
            t.notifications.remove(id);
        }
        Ok(trimmed)
    }

    async fn get_notification(&self, id: Uuid) -> Result<Option<Notification>, StoreError> {
        Ok(self.tables.read().await.notifications.get(&id).cloned())
    }

    async fn list_notifications(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<Notification>, StoreError> {
        let t = self.tables.read().await;
        let Some(inbox) = t.inboxes.get(&user_id) else {
            return Ok(Vec::new());
        };
        Ok(inbox
            .iter()
            .rev()
            .filter_map(|id| t.notifications.get(id).cloned())
            .take(limit)
            .collect())
    }

    async fn mark_delivered(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut t = self.tables.write().await;
        let n = t
            .notifications
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("notification", id))?;
        if n.delivered_at.is_some() {
            return Ok(false);
        }
        n.delivered_at = Some(at.max(n.created_at));
        Ok(true)
    }

    async fn mark_read(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut t = self.tables.write().await;
        let n = t
            .notifications
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("notification", id))?;
        if n.read_at.is_some() {
            return Ok(false);
        }
        n.read_at = Some(at.max(n.created_at));
        Ok(true)
    }

    async fn record_analytics(
        &self,
        notification_id: Uuid,
        event: AnalyticsEvent,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .analytics
            .push((notification_id, event, at));
        Ok(())
    }

    async fn analytics_counts(&self, notification_id: Uuid) -> Result<AnalyticsCounts, StoreError> {
        let t = self.tables.read().await;
        let mut counts = AnalyticsCounts::new();
        for (id, event, _) in &t.analytics {
            if *id == notification_id {
                *counts.entry(*event).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    async fn insert_operation(
        &self,
        op: &OfflineOperation,
        reuse_before: DateTime<Utc>,
    ) -> Result<OfflineOperation, StoreError> {
        let mut t = self.tables.write().await;
        let key = op_key(op.user_id, &op.op_id);
        if let Some(existing) = t.operations.get(&key) {
            if !existing.state.is_terminal() || existing.updated_at >= reuse_before {
                return Err(StoreError::duplicate("operation", &op.op_id));
            }
        }
        t.next_seq += 1;
        let mut stored = op.clone();
        stored.seq = t.next_seq;
        t.operations.insert(key, stored.clone());
        Ok(stored)
    }

    async fn get_operation(
        &self,
        user_id: UserId,
        op_id: &str,
    ) -> Result<Option<OfflineOperation>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .operations
            .get(&op_key(user_id, op_id))
            .cloned())
    }

    async fn list_operations(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<OfflineOperation>, StoreError> {
        let t = self.tables.read().await;
        let mut ops: Vec<OfflineOperation> = t
            .operations
            .values()
            .filter(|op| op.user_id == user_id)
            .cloned()
            .collect();
        ops.sort_by(|a, b| b.seq.cmp(&a.seq));
        ops.truncate(limit);
        Ok(ops)
    }

    async fn count_operations(
        &self,
        user_id: UserId,
        states: &[OperationState],
    ) -> Result<i64, StoreError> {
        let t = self.tables.read().await;
        Ok(t.operations
            .values()
            .filter(|op| op.user_id == user_id && states.contains(&op.state))
            .count() as i64)
    }

    async fn claim_operations(
        &self,
        user_id: UserId,
        filter: ClaimFilter,
    ) -> Result<Vec<OfflineOperation>, StoreError> {
        let mut t = self.tables.write().await;
        let mut due: Vec<(i64, OpKey)> = t
            .operations
            .iter()
            .filter(|(_, op)| {
                op.user_id == user_id
                    && op.state == OperationState::Pending
                    && op.next_attempt_at <= filter.now
                    && filter.created_after.map_or(true, |after| op.created_at > after)
            })
            .map(|(key, op)| (op.seq, key.clone()))
            .collect();
        due.sort_by_key(|(seq, _)| *seq);
        due.truncate(filter.limit);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, key) in due {
            if let Some(op) = t.operations.get_mut(&key) {
                op.state = OperationState::InFlight;
                op.attempts += 1;
                op.updated_at = filter.now;
                claimed.push(op.clone());
            }
        }
        Ok(claimed)
    }

    async fn transition_operation(&self, transition: &OpTransition) -> Result<bool, StoreError> {
        transition.check()?;
        let mut t = self.tables.write().await;
        let op = t
            .operations
            .get_mut(&op_key(transition.user_id, &transition.op_id))
            .ok_or_else(|| StoreError::not_found("operation", &transition.op_id))?;
        if op.state != transition.from {
            return Ok(false);
        }
        op.state = transition.to;
        if transition.undo_claim {
            op.attempts = op.attempts.saturating_sub(1);
        }
        if let Some(next) = transition.next_attempt_at {
            op.next_attempt_at = next;
        }
        if transition.last_error.is_some() {
            op.last_error = transition.last_error.clone();
        }
        op.updated_at = transition.at;
        Ok(true)
    }

    async fn commit_operation(&self, commit: &OpCommit) -> Result<Option<ServerRecord>, StoreError> {
        let mut t = self.tables.write().await;
        let key = op_key(commit.user_id, &commit.op_id);

        // Validate everything first
        let op_state = t
            .operations
            .get(&key)
            .map(|op| op.state)
            .ok_or_else(|| StoreError::not_found("operation", &commit.op_id))?;
        if op_state != commit.expected_state {
            return Err(StoreError::Conflict(format!(
                "operation {} is {}, expected {}",
                commit.op_id,
                op_state.as_str(),
                commit.expected_state.as_str()
            )));
        }
        if let ConflictChange::Resolve { id, .. } = &commit.conflict {
            match t.conflicts.get(id) {
                Some(c) if c.status == ConflictStatus::Unresolved => {}
                Some(_) => {
                    return Err(StoreError::Conflict(format!("conflict {} already resolved", id)))
                }
                None => return Err(StoreError::not_found("conflict", id)),
            }
        }
        if let Some(write) = &commit.write {
            t.check_version(write)?;
        }

        // Then mutate
        let record = commit
            .write
            .as_ref()
            .map(|write| t.apply_write(write, commit.user_id, commit.at));
        match &commit.conflict {
            ConflictChange::None => {}
            ConflictChange::Insert(conflict) => {
                t.conflicts.insert(conflict.id, conflict.clone());
            }
            ConflictChange::Resolve {
                id,
                resolved,
                strategy,
            } => {
                if let Some(c) = t.conflicts.get_mut(id) {
                    c.status = ConflictStatus::Resolved;
                    c.resolved = resolved.clone();
                    c.strategy_used = Some(*strategy);
                    c.resolved_at = Some(commit.at);
                }
            }
        }
        if let Some(op) = t.operations.get_mut(&key) {
            op.state = OperationState::Applied;
            op.last_error = None;
            op.updated_at = commit.at;
        }
        Ok(record)
    }

    async fn park_conflict(
        &self,
        conflict: &SyncConflict,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut t = self.tables.write().await;
        let key = op_key(conflict.user_id, &conflict.op_id);
        let op = t
            .operations
            .get_mut(&key)
            .ok_or_else(|| StoreError::not_found("operation", &conflict.op_id))?;
        if op.state != OperationState::InFlight {
            return Err(StoreError::Conflict(format!(
                "operation {} is {}, expected in-flight",
                conflict.op_id,
                op.state.as_str()
            )));
        }
        op.state = OperationState::Conflicted;
        op.updated_at = at;
        t.conflicts.insert(conflict.id, conflict.clone());
        Ok(())
    }

    async fn users_with_due_operations(&self, now: DateTime<Utc>) -> Result<Vec<UserId>, StoreError> {
        let t = self.tables.read().await;
        let users: HashSet<UserId> = t
            .operations
            .values()
            .filter(|op| op.state == OperationState::Pending && op.next_attempt_at <= now)
            .map(|op| op.user_id)
            .collect();
        let mut users: Vec<UserId> = users.into_iter().collect();
        users.sort_unstable();
        Ok(users)
    }

    async fn stale_in_flight(
        &self,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<OfflineOperation>, StoreError> {
        let t = self.tables.read().await;
        let mut ops: Vec<OfflineOperation> = t
            .operations
            .values()
            .filter(|op| op.state == OperationState::InFlight && op.updated_at < stale_before)
            .cloned()
            .collect();
        ops.sort_by_key(|op| op.seq);
        Ok(ops)
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut t = self.tables.write().await;
        let before = t.operations.len();
        t.operations
            .retain(|_, op| !(op.state.is_terminal() && op.updated_at < cutoff));
        Ok((before - t.operations.len()) as u64)
    }

    async fn get_record(
        &self,
        table: &str,
        record_id: &str,
    ) -> Result<Option<ServerRecord>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .records
            .get(&(table.to_string(), record_id.to_string()))
            .cloned())
    }

    async fn write_record(
        &self,
        write: &RecordWrite,
        writer: UserId,
        at: DateTime<Utc>,
    ) -> Result<ServerRecord, StoreError> {
        let mut t = self.tables.write().await;
        t.check_version(write)?;
        Ok(t.apply_write(write, writer, at))
    }

    async fn get_conflict(&self, id: Uuid) -> Result<Option<SyncConflict>, StoreError> {
        Ok(self.tables.read().await.conflicts.get(&id).cloned())
    }

    async fn list_conflicts(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<SyncConflict>, StoreError> {
        let t = self.tables.read().await;
        let mut conflicts: Vec<SyncConflict> = t
            .conflicts
            .values()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect();
        conflicts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        conflicts.truncate(limit);
        Ok(conflicts)
    }

    async fn get_status(&self, user_id: UserId) -> Result<Option<SyncStatus>, StoreError> {
        Ok(self.tables.read().await.statuses.get(&user_id).cloned())
    }

    async fn set_online(
        &self,
        user_id: UserId,
        online: bool,
        at: DateTime<Utc>,
    ) -> Result<SyncStatus, StoreError> {
        let mut t = self.tables.write().await;
        let status = t.status_mut(user_id);
        status.online = online;
        if online {
            status.last_online_at = Some(at);
        }
        Ok(status.clone())
    }

    async fn refresh_status(&self, user_id: UserId) -> Result<SyncStatus, StoreError> {
        Ok(self.tables.write().await.refresh_counts(user_id))
    }

    async fn complete_sync(
        &self,
        entry: &SyncHistoryEntry,
        sync_token: i64,
    ) -> Result<SyncStatus, StoreError> {
        let mut t = self.tables.write().await;
        t.refresh_counts(entry.user_id);
        let status = t.status_mut(entry.user_id);
        status.sync_token = Some(sync_token);
        status.last_sync_at = Some(entry.finished_at);
        let status = status.clone();
        t.history.push(entry.clone());
        Ok(status)
    }

    async fn list_history(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<SyncHistoryEntry>, StoreError> {
        let t = self.tables.read().await;
        Ok(t.history
            .iter()
            .rev()
            .filter(|h| h.user_id == user_id)
            .take(limit)
            .cloned()
            .collect())
    }
}
