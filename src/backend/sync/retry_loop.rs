//! # Retry Loop
//!
//! Background sweeper that re-drives queued ops once their backoff has
//! elapsed. Every `retry.sweep_interval` it:
//!
//! 1. returns in-flight ops abandoned for more than twice `sync.op_timeout`
//!    to `pending`
//! 2. purges applied and dead ops older than the idempotency window
//! 3. runs `sync` once for every online user with a due op, concurrently;
//!    users whose sync lock is held are skipped until the next sweep
//!
//! A sweep always runs to completion, so stopping the loop waits for the
//! syncs it started.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

use crate::backend::error::BackendError;
use crate::backend::sync::controller::SyncController;
use crate::backend::sync::queue::Outcome;
use crate::shared::UserId;

/// What one sweep did
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct SweepReport {
    pub recovered: usize,
    pub purged: u64,
    pub synced: Vec<UserId>,
    pub skipped: Vec<UserId>,
}

pub struct RetryLoop {
    controller: Arc<SyncController>,
    interval: Duration,
}

impl RetryLoop {
    pub fn new(controller: Arc<SyncController>, interval: Duration) -> Self {
        Self {
            controller,
            interval,
        }
    }

    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let queue = self.controller.queue();

        let stale_after = queue.config().op_timeout * 2;
        match queue.stale(stale_after).await {
            Ok(stale) => {
                for op in stale {
                    match queue.finish(&op, Outcome::failed_now("timeout")).await {
                        Ok(_) => {
                            report.recovered += 1;
                            if let Err(e) = queue.status(op.user_id).await {
                                tracing::warn!("[Retry] Status refresh for user {} failed: {}", op.user_id, e.message());
                            }
                        }
                        Err(e) => tracing::warn!("[Retry] Could not recover op {}: {}", op.op_id, e),
                    }
                }
            }
            Err(e) => tracing::warn!("[Retry] Stale scan failed: {}", e),
        }

        match queue.purge_expired().await {
            Ok(purged) => report.purged = purged,
            Err(e) => tracing::warn!("[Retry] Purge failed: {}", e),
        }

        let users = match queue.users_with_due_operations().await {
            Ok(users) => users,
            Err(e) => {
                tracing::warn!("[Retry] Due scan failed: {}", e);
                return report;
            }
        };

        let mut runs = JoinSet::new();
        for user_id in users {
            match queue.store().get_status(user_id).await {
                Ok(Some(status)) if status.online => {}
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!("[Retry] Status of user {} unavailable: {}", user_id, e);
                    continue;
                }
            }
            let controller = self.controller.clone();
            runs.spawn(async move { (user_id, controller.sync(user_id).await) });
        }

        while let Some(joined) = runs.join_next().await {
            match joined {
                Ok((user_id, Ok(_))) => report.synced.push(user_id),
                Ok((user_id, Err(BackendError::Busy { .. }))) => report.skipped.push(user_id),
                Ok((user_id, Err(e))) => {
                    tracing::warn!("[Retry] Sync for user {} failed: {}", user_id, e.message());
                    report.skipped.push(user_id);
                }
                Err(e) => tracing::error!("[Retry] Sync task panicked: {}", e),
            }
        }
        report.synced.sort_unstable();
        report.skipped.sort_unstable();

        if report.recovered > 0 || !report.synced.is_empty() {
            tracing::info!(
                "[Retry] Sweep: {} recovered, {} purged, {} users synced, {} skipped",
                report.recovered,
                report.purged,
                report.synced.len(),
                report.skipped.len()
            );
        }
        report
    }

    /// Sweep every interval until `shutdown` flips
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!("[Retry] Loop started, sweeping every {:?}", self.interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("[Retry] Loop stopped");
        })
    }
}
