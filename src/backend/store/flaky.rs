//! Test store that wraps another `Store` and misbehaves on demand:
//! failing claims or transitions, moving a record under a commit, slowing
//! commits down, or flipping a shutdown signal mid-read.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

use crate::backend::store::{
    ClaimFilter, OpCommit, OpTransition, RecordWrite, SharedStore, Store, StoreError,
};
use crate::shared::{
    AnalyticsCounts, AnalyticsEvent, Notification, OfflineOperation, OperationState,
    ServerRecord, SyncConflict, SyncHistoryEntry, SyncStatus, UserId,
};

pub struct FlakyStore {
    inner: SharedStore,
    claims: AtomicUsize,
    fail_claims_from: AtomicUsize,
    fail_transitions: AtomicBool,
    bump_next_commit: AtomicBool,
    commit_delay: Mutex<Option<Duration>>,
    stop_on_read: Mutex<Option<Arc<watch::Sender<bool>>>>,
}

impl FlakyStore {
    pub fn new(inner: SharedStore) -> Self {
        Self {
            inner,
            claims: AtomicUsize::new(0),
            fail_claims_from: AtomicUsize::new(usize::MAX),
            fail_transitions: AtomicBool::new(false),
            bump_next_commit: AtomicBool::new(false),
            commit_delay: Mutex::new(None),
            stop_on_read: Mutex::new(None),
        }
    }

    /// Claims number `n` (0-based) and later return `Unavailable`
    pub fn fail_claims_from(&self, n: usize) {
        self.fail_claims_from.store(n, Ordering::SeqCst);
    }

    pub fn heal_claims(&self) {
        self.fail_claims_from.store(usize::MAX, Ordering::SeqCst);
    }

    pub fn fail_transitions(&self, fail: bool) {
        self.fail_transitions.store(fail, Ordering::SeqCst);
    }

    /// Another writer bumps the record right before the next commit
    pub fn bump_next_commit(&self) {
        self.bump_next_commit.store(true, Ordering::SeqCst);
    }

    pub fn delay_commits(&self, delay: Duration) {
        *self.commit_delay.lock().unwrap() = Some(delay);
    }

    /// Flip `signal` to true during the next `get_record`
    pub fn stop_on_next_read(&self, signal: Arc<watch::Sender<bool>>) {
        *self.stop_on_read.lock().unwrap() = Some(signal);
    }
}

#[async_trait]
impl Store for FlakyStore {
    async fn insert_notification(
        &self,
        notification: &Notification,
        inbox_limit: usize,
    ) -> Result<Vec<Uuid>, StoreError> {
        self.inner.insert_notification(notification, inbox_limit).await
    }

    async fn get_notification(&self, id: Uuid) -> Result<Option<Notification>, StoreError> {
        self.inner.get_notification(id).await
    }

    async fn list_notifications(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<Notification>, StoreError> {
        self.inner.list_notifications(user_id, limit).await
    }

    async fn mark_delivered(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError> {
        self.inner.mark_delivered(id, at).await
    }

    async fn mark_read(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError> {
        self.inner.mark_read(id, at).await
    }

    async fn record_analytics(
        &self,
        notification_id: Uuid,
        event: AnalyticsEvent,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.inner.record_analytics(notification_id, event, at).await
    }

    async fn analytics_counts(&self, notification_id: Uuid) -> Result<AnalyticsCounts, StoreError> {
        self.inner.analytics_counts(notification_id).await
    }

    async fn insert_operation(
        &self,
        op: &OfflineOperation,
        reuse_before: DateTime<Utc>,
    ) -> Result<OfflineOperation, StoreError> {
        self.inner.insert_operation(op, reuse_before).await
    }

    async fn get_operation(
        &self,
        user_id: UserId,
        op_id: &str,
    ) -> Result<Option<OfflineOperation>, StoreError> {
        self.inner.get_operation(user_id, op_id).await
    }

    async fn list_operations(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<OfflineOperation>, StoreError> {
        self.inner.list_operations(user_id, limit).await
    }

    async fn count_operations(
        &self,
        user_id: UserId,
        states: &[OperationState],
    ) -> Result<i64, StoreError> {
        self.inner.count_operations(user_id, states).await
    }

    async fn claim_operations(
        &self,
        user_id: UserId,
        filter: ClaimFilter,
    ) -> Result<Vec<OfflineOperation>, StoreError> {
        let n = self.claims.fetch_add(1, Ordering::SeqCst);
        if n >= self.fail_claims_from.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("claim refused".into()));
        }
        self.inner.claim_operations(user_id, filter).await
    }

    async fn transition_operation(&self, transition: &OpTransition) -> Result<bool, StoreError> {
        if self.fail_transitions.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("transition refused".into()));
        }
        self.inner.transition_operation(transition).await
    }

    async fn commit_operation(&self, commit: &OpCommit) -> Result<Option<ServerRecord>, StoreError> {
        let delay = *self.commit_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.bump_next_commit.swap(false, Ordering::SeqCst) {
            if let Some(write) = &commit.write {
                let current = self
                    .inner
                    .get_record(&write.table, &write.record_id)
                    .await?
                    .map_or(0, |r| r.version);
                let bump = RecordWrite {
                    table: write.table.clone(),
                    record_id: write.record_id.clone(),
                    expected_version: current,
                    value: Some(json!({"written_by": "someone else"})),
                };
                self.inner.write_record(&bump, 0, commit.at).await?;
            }
        }
        self.inner.commit_operation(commit).await
    }

    async fn park_conflict(
        &self,
        conflict: &SyncConflict,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.inner.park_conflict(conflict, at).await
    }

    async fn users_with_due_operations(&self, now: DateTime<Utc>) -> Result<Vec<UserId>, StoreError> {
        self.inner.users_with_due_operations(now).await
    }

    async fn stale_in_flight(
        &self,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<OfflineOperation>, StoreError> {
        self.inner.stale_in_flight(stale_before).await
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.inner.purge_terminal_before(cutoff).await
    }

    async fn get_record(
        &self,
        table: &str,
        record_id: &str,
    ) -> Result<Option<ServerRecord>, StoreError> {
        let signal = self.stop_on_read.lock().unwrap().take();
        if let Some(signal) = signal {
            let _ = signal.send(true);
        }
        self.inner.get_record(table, record_id).await
    }

    async fn write_record(
        &self,
        write: &RecordWrite,
        writer: UserId,
        at: DateTime<Utc>,
    ) -> Result<ServerRecord, StoreError> {
        self.inner.write_record(write, writer, at).await
    }

    async fn get_conflict(&self, id: Uuid) -> Result<Option<SyncConflict>, StoreError> {
        self.inner.get_conflict(id).await
    }

    async fn list_conflicts(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<SyncConflict>, StoreError> {
        self.inner.list_conflicts(user_id, limit).await
    }

    async fn get_status(&self, user_id: UserId) -> Result<Option<SyncStatus>, StoreError> {
        self.inner.get_status(user_id).await
    }

    async fn set_online(
        &self,
        user_id: UserId,
        online: bool,
        at: DateTime<Utc>,
    ) -> Result<SyncStatus, StoreError> {
        self.inner.set_online(user_id, online, at).await
    }

    async fn refresh_status(&self, user_id: UserId) -> Result<SyncStatus, StoreError> {
        self.inner.refresh_status(user_id).await
    }

    async fn complete_sync(
        &self,
        entry: &SyncHistoryEntry,
        sync_token: i64,
    ) -> Result<SyncStatus, StoreError> {
        self.inner.complete_sync(entry, sync_token).await
    }

    async fn list_history(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<SyncHistoryEntry>, StoreError> {
        self.inner.list_history(user_id, limit).await
    }
}
