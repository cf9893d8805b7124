/**
 * Delivery Service
 *
 * Typed sending API over the hub. Notifications are written to the store
 * before they are pushed, so a user with no live session picks them up
 * from the inbox later; every other family (live updates, data updates,
 * typing, presence) is best effort.
 *
 * # Ordering
 *
 * `notify` holds a per-user keyed mutex across persist and push, so two
 * notifications for the same user reach each session in the order the
 * service received them.
 *
 * # Analytics
 *
 * - `sent` when the record is persisted
 * - `delivered` the first time a session acknowledges it
 * - `opened` the first time the client marks it read
 * - `failed` when persisting fails, or when a reaped session still held it
 *   unacknowledged
 */
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::backend::cache::SharedCache;
use crate::backend::error::BackendError;
use crate::backend::realtime::{DetachReason, Hub, HubEvent, SessionId};
use crate::backend::runtime::{KeyedLocks, SharedClock};
use crate::backend::store::SharedStore;
use crate::shared::config::DeliveryConfig;
use crate::shared::{
    AnalyticsCounts, AnalyticsEvent, Envelope, EnvelopeType, Notification, PresenceStatus, UserId,
};

/// Cache channel system messages are mirrored on
pub const SYSTEM_CHANNEL: &str = "system";

/// Notification kind used for persisted data updates
pub const DATA_UPDATE_KIND: &str = "data_update";

/// Result of a durable notification
#[derive(Debug, Clone, Serialize)]
pub struct Delivery {
    pub notification: Notification,
    /// Sessions that accepted the push
    pub delivered: usize,
}

/// Result of a system-wide message
#[derive(Debug, Clone, Default, Serialize)]
pub struct SystemDelivery {
    pub delivered: usize,
    /// Inbox records written when `data.persist` was set
    pub persisted: Vec<Uuid>,
}

struct DeliveryInner {
    hub: Hub,
    store: SharedStore,
    cache: SharedCache,
    clock: SharedClock,
    config: DeliveryConfig,
    ordering: KeyedLocks<UserId>,
}

#[derive(Clone)]
pub struct DeliveryService {
    inner: Arc<DeliveryInner>,
}

/// `persist: true` in an opaque payload
fn wants_persist(data: &Value) -> bool {
    data.get("persist").and_then(Value::as_bool).unwrap_or(false)
}

fn presence_key(user_id: UserId) -> String {
    format!("presence:{}", user_id)
}

impl DeliveryService {
    pub fn new(
        hub: Hub,
        store: SharedStore,
        cache: SharedCache,
        clock: SharedClock,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            inner: Arc::new(DeliveryInner {
                hub,
                store,
                cache,
                clock,
                config,
                ordering: KeyedLocks::new(),
            }),
        }
    }

    pub fn hub(&self) -> &Hub {
        &self.inner.hub
    }

    fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    /// Write the record and its `sent` event
    async fn persist(&self, notification: &Notification) -> Result<(), BackendError> {
        let store = &self.inner.store;
        match store
            .insert_notification(notification, self.inner.config.inbox_limit)
            .await
        {
            Ok(trimmed) => {
                if !trimmed.is_empty() {
                    tracing::debug!(
                        "[Delivery] Trimmed {} old notifications of user {}",
                        trimmed.len(),
                        notification.user_id
                    );
                }
            }
            Err(e) => {
                tracing::error!(
                    "[Delivery] Failed to persist notification for user {}: {}",
                    notification.user_id,
                    e
                );
                if let Err(e) = store
                    .record_analytics(notification.id, AnalyticsEvent::Failed, self.now())
                    .await
                {
                    tracing::warn!("[Delivery] Could not record failure: {}", e);
                }
                return Err(e.into());
            }
        }
        store
            .record_analytics(notification.id, AnalyticsEvent::Sent, self.now())
            .await?;
        Ok(())
    }

    /// Persist a notification, then push it to the user's live sessions
    pub async fn notify(
        &self,
        user_id: UserId,
        kind: &str,
        title: &str,
        body: &str,
        data: Value,
    ) -> Result<Delivery, BackendError> {
        let _order = self.inner.ordering.acquire(user_id).await;

        let notification = Notification::new(user_id, kind, title, body, data, self.now());
        self.persist(&notification).await?;

        let delivered = self
            .inner
            .hub
            .send_notification(user_id, notification.id, notification.to_envelope(self.now()))
            .await;
        tracing::info!(
            "[Delivery] Notification {} ({}) to user {}: {} sessions",
            notification.id,
            kind,
            user_id,
            delivered
        );
        Ok(Delivery {
            notification,
            delivered,
        })
    }

    /// Broadcast a system message; `data.persist` also writes an inbox
    /// record for every user connected right now
    pub async fn notify_system(
        &self,
        kind: &str,
        title: &str,
        body: &str,
        data: Value,
    ) -> Result<SystemDelivery, BackendError> {
        let payload = json!({ "title": title, "body": body, "data": data });
        let envelope = Envelope::system_message(kind, payload, self.now());

        match envelope.to_json() {
            Ok(text) => {
                if let Err(e) = self.inner.cache.publish(SYSTEM_CHANNEL, text).await {
                    tracing::warn!("[Delivery] System channel publish failed: {}", e);
                }
            }
            Err(e) => tracing::warn!("[Delivery] System message not serializable: {}", e),
        }

        let mut persisted = Vec::new();
        if wants_persist(&data) {
            for user_id in self.inner.hub.users_online().await {
                let _order = self.inner.ordering.acquire(user_id).await;
                let notification =
                    Notification::new(user_id, kind, title, body, data.clone(), self.now());
                self.persist(&notification).await?;
                persisted.push(notification.id);
            }
        }

        let delivered = self.inner.hub.broadcast(envelope).await;
        tracing::info!(
            "[Delivery] System message {} to {} sessions ({} persisted)",
            kind,
            delivered,
            persisted.len()
        );
        Ok(SystemDelivery {
            delivered,
            persisted,
        })
    }

    /// Non-durable notification to everyone in a room
    pub async fn notify_room(
        &self,
        room: &str,
        kind: &str,
        title: &str,
        body: &str,
        data: Value,
    ) -> usize {
        let payload = json!({
            "room": room,
            "kind": kind,
            "title": title,
            "body": body,
            "data": data,
        });
        self.inner
            .hub
            .send_to_room(room, Envelope::new(EnvelopeType::Notification, payload, self.now()))
            .await
    }

    pub async fn live_update(&self, user_id: UserId, kind: &str, payload: Value) -> usize {
        self.inner
            .hub
            .send_to_user(user_id, Envelope::live_update(kind, payload, self.now()))
            .await
    }

    /// Push a data update; `payload.persist` also stores it in the inbox
    pub async fn data_update(
        &self,
        user_id: UserId,
        kind: &str,
        payload: Value,
    ) -> Result<usize, BackendError> {
        if wants_persist(&payload) {
            let _order = self.inner.ordering.acquire(user_id).await;
            let notification =
                Notification::new(user_id, DATA_UPDATE_KIND, kind, "", payload.clone(), self.now());
            self.persist(&notification).await?;
        }
        Ok(self
            .inner
            .hub
            .send_to_user(user_id, Envelope::data_update(kind, payload, self.now()))
            .await)
    }

    pub async fn broadcast_data_update(&self, kind: &str, payload: Value) -> usize {
        self.inner
            .hub
            .broadcast(Envelope::data_update(kind, payload, self.now()))
            .await
    }

    /// Echo a typing indicator to the room, skipping the typist's sessions
    pub async fn typing(&self, user_id: UserId, room: &str, is_typing: bool) -> usize {
        self.inner
            .hub
            .send_to_room_except_user(room, user_id, Envelope::typing(user_id, room, is_typing, self.now()))
            .await
    }

    /// Record a presence status and fan it out to every room the user's
    /// sessions joined plus the user's other sessions
    pub async fn presence(
        &self,
        user_id: UserId,
        status: PresenceStatus,
        origin: Option<SessionId>,
    ) -> Result<usize, BackendError> {
        let key = presence_key(user_id);
        match status {
            PresenceStatus::Offline => {
                self.inner.cache.delete(&key).await?;
            }
            _ => {
                self.inner
                    .cache
                    .put(&key, status.as_str().to_string(), Some(self.inner.hub.presence_ttl()))
                    .await?;
            }
        }
        Ok(self
            .inner
            .hub
            .send_to_presence_audience(user_id, origin, Envelope::presence(user_id, status, self.now()))
            .await)
    }

    /// Cached presence, `offline` when unknown or expired
    pub async fn presence_of(&self, user_id: UserId) -> Result<PresenceStatus, BackendError> {
        let cached = self.inner.cache.get(&presence_key(user_id)).await?;
        Ok(cached
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(PresenceStatus::Offline))
    }

    /// Newest first
    pub async fn inbox(&self, user_id: UserId, limit: usize) -> Result<Vec<Notification>, BackendError> {
        Ok(self.inner.store.list_notifications(user_id, limit).await?)
    }

    async fn owned(&self, user_id: UserId, id: Uuid) -> Result<Notification, BackendError> {
        match self.inner.store.get_notification(id).await? {
            Some(n) if n.user_id == user_id => Ok(n),
            _ => Err(BackendError::not_found("notification", id)),
        }
    }

    async fn mark_delivered(&self, notification: &Notification) -> Result<(), BackendError> {
        let now = self.now();
        if self.inner.store.mark_delivered(notification.id, now).await? {
            self.inner
                .store
                .record_analytics(notification.id, AnalyticsEvent::Delivered, now)
                .await?;
        }
        self.inner
            .hub
            .acknowledge(notification.user_id, notification.id)
            .await;
        Ok(())
    }

    /// Session acknowledgement (`ack` frame)
    pub async fn acknowledge(&self, user_id: UserId, id: Uuid) -> Result<Notification, BackendError> {
        let notification = self.owned(user_id, id).await?;
        self.mark_delivered(&notification).await?;
        self.owned(user_id, id).await
    }

    /// Explicit read; also counts as delivery when no session acked first
    pub async fn mark_read(&self, user_id: UserId, id: Uuid) -> Result<Notification, BackendError> {
        let notification = self.owned(user_id, id).await?;
        self.mark_delivered(&notification).await?;
        let now = self.now();
        if self.inner.store.mark_read(id, now).await? {
            self.inner
                .store
                .record_analytics(id, AnalyticsEvent::Opened, now)
                .await?;
        }
        self.owned(user_id, id).await
    }

    pub async fn analytics(&self, user_id: UserId, id: Uuid) -> Result<AnalyticsCounts, BackendError> {
        self.owned(user_id, id).await?;
        Ok(self.inner.store.analytics_counts(id).await?)
    }

    /// Record `failed` for notifications a reaped session never acknowledged
    async fn on_detached(&self, reason: DetachReason, unacked: Vec<Uuid>) {
        if !reason.is_reap() {
            return;
        }
        for id in unacked {
            let pending = match self.inner.store.get_notification(id).await {
                Ok(Some(n)) => !n.is_delivered(),
                Ok(None) => false,
                Err(e) => {
                    tracing::warn!("[Delivery] Could not load notification {}: {}", id, e);
                    continue;
                }
            };
            if pending {
                if let Err(e) = self
                    .inner
                    .store
                    .record_analytics(id, AnalyticsEvent::Failed, self.now())
                    .await
                {
                    tracing::warn!("[Delivery] Could not record failure for {}: {}", id, e);
                }
            }
        }
    }

    /// Follow hub detach events until `shutdown` flips
    pub fn spawn_reap_accounting(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let service = self.clone();
        let mut events = self.inner.hub.subscribe_events();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(HubEvent::Detached { reason, unacked, .. }) => {
                            service.on_detached(reason, unacked).await;
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!("[Delivery] Missed {} hub events", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::cache::MemoryCache;
    use crate::backend::runtime::ManualClock;
    use crate::backend::store::MemoryStore;
    use crate::shared::config::SessionConfig;
    use pretty_assertions::assert_eq;

    fn service() -> DeliveryService {
        let clock = Arc::new(ManualClock::at_epoch());
        let cache = Arc::new(MemoryCache::new(clock.clone()));
        let hub = Hub::new(SessionConfig::default(), clock.clone(), cache.clone());
        DeliveryService::new(
            hub,
            Arc::new(MemoryStore::new()),
            cache,
            clock,
            DeliveryConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_notify_persists_and_pushes() {
        let svc = service();
        let mut s1 = svc.hub().attach(Some(7)).await.unwrap();
        let mut s2 = svc.hub().attach(Some(7)).await.unwrap();

        let d = svc
            .notify(7, "order", "Shipped", "on its way", json!({"id": 42}))
            .await
            .unwrap();
        assert_eq!(d.delivered, 2);

        for s in [&mut s1, &mut s2] {
            let env = s.outbound.recv().await.unwrap();
            assert_eq!(env.kind, EnvelopeType::Notification);
            assert_eq!(env.payload["id"], json!(d.notification.id));
        }
        let counts = svc.analytics(7, d.notification.id).await.unwrap();
        assert_eq!(counts.get(&AnalyticsEvent::Sent), Some(&1));

        svc.acknowledge(7, d.notification.id).await.unwrap();
        svc.acknowledge(7, d.notification.id).await.unwrap();
        let counts = svc.analytics(7, d.notification.id).await.unwrap();
        assert_eq!(counts.get(&AnalyticsEvent::Delivered), Some(&1));
    }

    #[tokio::test]
    async fn test_offline_user_still_gets_inbox_record() {
        let svc = service();
        let d = svc.notify(3, "news", "t", "b", json!({})).await.unwrap();
        assert_eq!(d.delivered, 0);
        let inbox = svc.inbox(3, 10).await.unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].id, d.notification.id);
    }

    #[tokio::test]
    async fn test_mark_read_twice_keeps_first_read_at() {
        let svc = service();
        let d = svc.notify(3, "news", "t", "b", json!({})).await.unwrap();
        let first = svc.mark_read(3, d.notification.id).await.unwrap();
        let second = svc.mark_read(3, d.notification.id).await.unwrap();
        assert!(first.read_at.is_some());
        assert_eq!(first.read_at, second.read_at);
        let counts = svc.analytics(3, d.notification.id).await.unwrap();
        assert_eq!(counts.get(&AnalyticsEvent::Opened), Some(&1));
        assert_eq!(counts.get(&AnalyticsEvent::Delivered), Some(&1));
    }

    #[tokio::test]
    async fn test_foreign_notification_is_not_found() {
        let svc = service();
        let d = svc.notify(3, "news", "t", "b", json!({})).await.unwrap();
        let err = svc.mark_read(4, d.notification.id).await.unwrap_err();
        assert_eq!(err.kind(), "NotFound");
    }

    #[tokio::test]
    async fn test_typing_skips_sender() {
        let svc = service();
        let typist = svc.hub().attach(Some(1)).await.unwrap();
        let mut peer = svc.hub().attach(Some(2)).await.unwrap();
        svc.hub().join_room(typist.id, "r").await.unwrap();
        svc.hub().join_room(peer.id, "r").await.unwrap();

        assert_eq!(svc.typing(1, "r", true).await, 1);
        let env = peer.outbound.recv().await.unwrap();
        assert_eq!(env.kind, EnvelopeType::Typing);
        assert_eq!(env.payload["is_typing"], true);
    }

    #[tokio::test]
    async fn test_presence_is_cached() {
        let svc = service();
        assert_eq!(svc.presence_of(5).await.unwrap(), PresenceStatus::Offline);
        svc.presence(5, PresenceStatus::Away, None).await.unwrap();
        assert_eq!(svc.presence_of(5).await.unwrap(), PresenceStatus::Away);
        svc.presence(5, PresenceStatus::Offline, None).await.unwrap();
        assert_eq!(svc.presence_of(5).await.unwrap(), PresenceStatus::Offline);
    }

    #[tokio::test]
    async fn test_data_update_persist_flag() {
        let svc = service();
        assert_eq!(svc.data_update(8, "profile", json!({"a": 1})).await.unwrap(), 0);
        assert!(svc.inbox(8, 10).await.unwrap().is_empty());

        svc.data_update(8, "profile", json!({"a": 1, "persist": true}))
            .await
            .unwrap();
        let inbox = svc.inbox(8, 10).await.unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].kind, DATA_UPDATE_KIND);
    }

    #[tokio::test]
    async fn test_system_message_persists_for_connected_users() {
        let svc = service();
        let mut a = svc.hub().attach(Some(1)).await.unwrap();
        let _b = svc.hub().attach(Some(2)).await.unwrap();

        let out = svc
            .notify_system("maintenance", "Down soon", "10 min", json!({"persist": true}))
            .await
            .unwrap();
        assert_eq!(out.delivered, 2);
        assert_eq!(out.persisted.len(), 2);
        assert_eq!(a.outbound.recv().await.unwrap().kind, EnvelopeType::SystemMessage);
        assert_eq!(svc.inbox(1, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reap_before_ack_records_failed() {
        let svc = service();
        let s = svc.hub().attach(Some(6)).await.unwrap();
        let d = svc.notify(6, "k", "t", "b", json!({})).await.unwrap();

        svc.on_detached(DetachReason::Idle, vec![d.notification.id]).await;
        let counts = svc.analytics(6, d.notification.id).await.unwrap();
        assert_eq!(counts.get(&AnalyticsEvent::Failed), Some(&1));
        drop(s);
    }
}
