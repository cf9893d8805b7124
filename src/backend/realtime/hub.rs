/**
 * Connection Registry (Hub)
 *
 * Owns every live session and routes envelopes to them by user, by room,
 * or to everyone.
 *
 * # Indexes
 *
 * Three maps behind one `RwLock`:
 *
 * - `sessions`: session id → session entry
 * - `by_user`: user id → session ids
 * - `by_room`: room → session ids
 *
 * Membership changes take the write lock. Routing collects the target
 * senders under the read lock, releases it, then does a non-blocking
 * `try_send` into each session's bounded queue. A full or closed queue
 * never blocks the other targets; that session is reaped afterwards.
 *
 * # Lifecycle of a session
 *
 * `attach` hands back a `SessionHandle` holding the receiving end of the
 * outbound queue. Dropping the entry (detach, reap, shutdown) drops the
 * sender, which ends the socket's write loop and closes the connection.
 * Every detach is announced on the hub's event channel so the delivery
 * service can account for notifications that were never acknowledged.
 */
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::backend::cache::SharedCache;
use crate::backend::error::BackendError;
use crate::backend::runtime::SharedClock;
use crate::shared::config::SessionConfig;
use crate::shared::{Envelope, UserId};

pub type SessionId = Uuid;

/// Unacknowledged notification ids tracked per session
pub const MAX_UNACKED: usize = 1024;

/// Why a session left the hub
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetachReason {
    /// Client closed the connection
    Closed,
    /// No ping or pong within the idle timeout
    Idle,
    /// Outbound queue overflowed
    SlowConsumer,
    /// Write to the transport failed
    TransportError,
    /// Too many bad frames within the violation window
    ProtocolViolations,
    Shutdown,
}

impl DetachReason {
    /// Whether the hub removed the session rather than the client
    pub fn is_reap(&self) -> bool {
        !matches!(self, Self::Closed)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    Detached {
        session_id: SessionId,
        user_id: UserId,
        reason: DetachReason,
        /// Notifications pushed to this session and never acknowledged
        unacked: Vec<Uuid>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub total_sessions: usize,
    pub users_online: usize,
    pub rooms: usize,
}

/// Read-only view of one session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub user_id: UserId,
    pub joined_at: DateTime<Utc>,
    pub last_ping_at: DateTime<Utc>,
    pub rooms: Vec<String>,
}

/// The socket side of an attached session
#[derive(Debug)]
pub struct SessionHandle {
    pub id: SessionId,
    pub user_id: UserId,
    pub outbound: mpsc::Receiver<Envelope>,
}

struct SessionEntry {
    user_id: UserId,
    joined_at: DateTime<Utc>,
    last_ping_at: DateTime<Utc>,
    rooms: HashSet<String>,
    outbound: mpsc::Sender<Envelope>,
    unacked: HashSet<Uuid>,
}

#[derive(Default)]
struct Indexes {
    sessions: HashMap<SessionId, SessionEntry>,
    by_user: HashMap<UserId, HashSet<SessionId>>,
    by_room: HashMap<String, HashSet<SessionId>>,
}

impl Indexes {
    fn remove(&mut self, id: &SessionId) -> Option<SessionEntry> {
        let entry = self.sessions.remove(id)?;
        if let Some(ids) = self.by_user.get_mut(&entry.user_id) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_user.remove(&entry.user_id);
            }
        }
        for room in &entry.rooms {
            unlink(&mut self.by_room, room, id);
        }
        Some(entry)
    }

    fn senders<'a>(
        &self,
        ids: impl IntoIterator<Item = &'a SessionId>,
    ) -> Vec<(SessionId, mpsc::Sender<Envelope>)> {
        ids.into_iter()
            .filter_map(|id| {
                self.sessions
                    .get(id)
                    .map(|entry| (*id, entry.outbound.clone()))
            })
            .collect()
    }
}

fn unlink(index: &mut HashMap<String, HashSet<SessionId>>, room: &str, id: &SessionId) {
    if let Some(ids) = index.get_mut(room) {
        ids.remove(id);
        if ids.is_empty() {
            index.remove(room);
        }
    }
}

struct HubInner {
    indexes: RwLock<Indexes>,
    config: SessionConfig,
    clock: SharedClock,
    cache: SharedCache,
    events: broadcast::Sender<HubEvent>,
    shutting_down: AtomicBool,
}

/// Process-wide session registry
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    pub fn new(config: SessionConfig, clock: SharedClock, cache: SharedCache) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(HubInner {
                indexes: RwLock::new(Indexes::default()),
                config,
                clock,
                cache,
                events,
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<HubEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    /// Register a session for an authenticated user
    pub async fn attach(&self, user_id: Option<UserId>) -> Result<SessionHandle, BackendError> {
        let user_id =
            user_id.ok_or_else(|| BackendError::unauthenticated("no authenticated user"))?;
        if self.is_shutting_down() {
            return Err(BackendError::transient("hub is shutting down"));
        }

        let now = self.inner.clock.now();
        let (tx, rx) = mpsc::channel(self.inner.config.outbound_queue);
        let id = Uuid::new_v4();

        let mut indexes = self.inner.indexes.write().await;
        let open = indexes.by_user.get(&user_id).map(|ids| ids.len()).unwrap_or(0);
        if open >= self.inner.config.max_per_user {
            tracing::warn!(
                "[Hub] User {} refused: {} sessions already open",
                user_id,
                open
            );
            return Err(BackendError::capacity(format!(
                "user {} already has {} sessions",
                user_id, open
            )));
        }
        indexes.sessions.insert(
            id,
            SessionEntry {
                user_id,
                joined_at: now,
                last_ping_at: now,
                rooms: HashSet::new(),
                outbound: tx,
                unacked: HashSet::new(),
            },
        );
        indexes.by_user.entry(user_id).or_default().insert(id);
        drop(indexes);

        tracing::info!("[Hub] Session {} attached for user {}", id, user_id);
        Ok(SessionHandle {
            id,
            user_id,
            outbound: rx,
        })
    }

    /// Idempotent removal of a session the client closed
    pub async fn detach(&self, id: SessionId) -> bool {
        self.detach_with(id, DetachReason::Closed).await
    }

    pub async fn detach_with(&self, id: SessionId, reason: DetachReason) -> bool {
        let removed = self.inner.indexes.write().await.remove(&id);
        match removed {
            Some(entry) => {
                self.announce_detach(id, entry, reason);
                true
            }
            None => false,
        }
    }

    fn announce_detach(&self, id: SessionId, entry: SessionEntry, reason: DetachReason) {
        if reason.is_reap() {
            tracing::info!("[Hub] Reaped session {} of user {} ({:?})", id, entry.user_id, reason);
        } else {
            tracing::debug!("[Hub] Session {} of user {} detached", id, entry.user_id);
        }
        // No subscribers is fine
        let _ = self.inner.events.send(HubEvent::Detached {
            session_id: id,
            user_id: entry.user_id,
            reason,
            unacked: entry.unacked.into_iter().collect(),
        });
    }

    /// Non-blocking enqueue to every target; reaps the ones that refused
    async fn deliver(&self, targets: Vec<(SessionId, mpsc::Sender<Envelope>)>, envelope: &Envelope) -> usize {
        let mut delivered = 0;
        let mut refused = Vec::new();
        for (id, tx) in targets {
            match tx.try_send(envelope.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!("[Hub] Session {} outbound queue full", id);
                    refused.push((id, DetachReason::SlowConsumer));
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    refused.push((id, DetachReason::TransportError));
                }
            }
        }
        for (id, reason) in refused {
            self.detach_with(id, reason).await;
        }
        delivered
    }

    /// Best-effort delivery to every live session of a user
    pub async fn send_to_user(&self, user_id: UserId, envelope: Envelope) -> usize {
        self.send_to_user_except(user_id, None, envelope).await
    }

    pub async fn send_to_user_except(
        &self,
        user_id: UserId,
        except: Option<SessionId>,
        envelope: Envelope,
    ) -> usize {
        let targets = {
            let indexes = self.inner.indexes.read().await;
            match indexes.by_user.get(&user_id) {
                Some(ids) => indexes.senders(ids.iter().filter(|id| Some(**id) != except)),
                None => return 0,
            }
        };
        self.deliver(targets, &envelope).await
    }

    /// Push a notification and remember it as unacknowledged on each target
    pub async fn send_notification(
        &self,
        user_id: UserId,
        notification_id: Uuid,
        envelope: Envelope,
    ) -> usize {
        let targets = {
            let mut indexes = self.inner.indexes.write().await;
            let ids: Vec<SessionId> = match indexes.by_user.get(&user_id) {
                Some(ids) => ids.iter().copied().collect(),
                None => return 0,
            };
            for id in &ids {
                if let Some(entry) = indexes.sessions.get_mut(id) {
                    if entry.unacked.len() < MAX_UNACKED {
                        entry.unacked.insert(notification_id);
                    }
                }
            }
            indexes.senders(ids.iter())
        };
        self.deliver(targets, &envelope).await
    }

    /// Forget an acknowledged notification on all of the user's sessions
    pub async fn acknowledge(&self, user_id: UserId, notification_id: Uuid) {
        let mut indexes = self.inner.indexes.write().await;
        let ids: Vec<SessionId> = indexes
            .by_user
            .get(&user_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        for id in ids {
            if let Some(entry) = indexes.sessions.get_mut(&id) {
                entry.unacked.remove(&notification_id);
            }
        }
    }

    pub async fn send_to_room(&self, room: &str, envelope: Envelope) -> usize {
        self.send_to_room_except(room, None, envelope).await
    }

    pub async fn send_to_room_except(
        &self,
        room: &str,
        except: Option<SessionId>,
        envelope: Envelope,
    ) -> usize {
        let targets = {
            let indexes = self.inner.indexes.read().await;
            match indexes.by_room.get(room) {
                Some(ids) => indexes.senders(ids.iter().filter(|id| Some(**id) != except)),
                None => return 0,
            }
        };
        self.deliver(targets, &envelope).await
    }

    /// Room delivery skipping every session of `user_id`
    pub async fn send_to_room_except_user(
        &self,
        room: &str,
        user_id: UserId,
        envelope: Envelope,
    ) -> usize {
        let targets = {
            let indexes = self.inner.indexes.read().await;
            match indexes.by_room.get(room) {
                Some(ids) => indexes.senders(ids.iter().filter(|id| {
                    indexes
                        .sessions
                        .get(*id)
                        .map(|entry| entry.user_id != user_id)
                        .unwrap_or(false)
                })),
                None => return 0,
            }
        };
        self.deliver(targets, &envelope).await
    }

    pub async fn send_to_session(&self, id: SessionId, envelope: Envelope) -> bool {
        let targets = {
            let indexes = self.inner.indexes.read().await;
            indexes.senders([id].iter())
        };
        self.deliver(targets, &envelope).await == 1
    }

    pub async fn broadcast(&self, envelope: Envelope) -> usize {
        let targets = {
            let indexes = self.inner.indexes.read().await;
            indexes.senders(indexes.sessions.keys())
        };
        self.deliver(targets, &envelope).await
    }

    /// Every room joined by any of the user's sessions plus the user's own
    /// sessions, each session once, minus `except`
    pub async fn send_to_presence_audience(
        &self,
        user_id: UserId,
        except: Option<SessionId>,
        envelope: Envelope,
    ) -> usize {
        let targets = {
            let indexes = self.inner.indexes.read().await;
            let own = indexes.by_user.get(&user_id).cloned().unwrap_or_default();
            let mut audience: HashSet<SessionId> = own.clone();
            for id in &own {
                if let Some(entry) = indexes.sessions.get(id) {
                    for room in &entry.rooms {
                        if let Some(members) = indexes.by_room.get(room) {
                            audience.extend(members.iter().copied());
                        }
                    }
                }
            }
            if let Some(except) = except {
                audience.remove(&except);
            }
            indexes.senders(audience.iter())
        };
        self.deliver(targets, &envelope).await
    }

    pub async fn join_room(&self, id: SessionId, room: &str) -> Result<(), BackendError> {
        let room = room.trim();
        if room.is_empty() {
            return Err(BackendError::validation("room", "room name is empty"));
        }
        let mut indexes = self.inner.indexes.write().await;
        let entry = indexes
            .sessions
            .get_mut(&id)
            .ok_or_else(|| BackendError::not_found("session", id))?;
        entry.rooms.insert(room.to_string());
        indexes.by_room.entry(room.to_string()).or_default().insert(id);
        Ok(())
    }

    pub async fn leave_room(&self, id: SessionId, room: &str) -> Result<(), BackendError> {
        let mut indexes = self.inner.indexes.write().await;
        let entry = indexes
            .sessions
            .get_mut(&id)
            .ok_or_else(|| BackendError::not_found("session", id))?;
        if entry.rooms.remove(room) {
            unlink(&mut indexes.by_room, room, &id);
        }
        Ok(())
    }

    /// Refresh `last_ping_at`; false when the session is gone
    pub async fn touch(&self, id: SessionId) -> bool {
        let now = self.inner.clock.now();
        let mut indexes = self.inner.indexes.write().await;
        match indexes.sessions.get_mut(&id) {
            Some(entry) => {
                entry.last_ping_at = entry.last_ping_at.max(now);
                true
            }
            None => false,
        }
    }

    /// Count a bad frame; reaps the session once it is a repeat offender.
    /// Returns whether the session was reaped.
    pub async fn record_violation(&self, id: SessionId) -> Result<bool, BackendError> {
        let key = format!("violations:{}", id);
        let count = self.inner.cache.incr(&key, 1).await?;
        if count == 1 {
            self.inner
                .cache
                .expire(&key, self.inner.config.violation_window)
                .await?;
        }
        let limit = i64::from(self.inner.config.max_protocol_violations);
        if count < limit {
            return Ok(false);
        }
        self.inner.cache.delete(&key).await?;
        Ok(self.detach_with(id, DetachReason::ProtocolViolations).await)
    }

    /// Detach every session whose last ping is older than the idle timeout
    pub async fn sweep_idle(&self) -> Vec<SessionId> {
        let now = self.inner.clock.now();
        let idle = chrono::Duration::from_std(self.inner.config.idle_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(120));

        let mut indexes = self.inner.indexes.write().await;
        let stale: Vec<SessionId> = indexes
            .sessions
            .iter()
            .filter(|(_, entry)| now - entry.last_ping_at > idle)
            .map(|(id, _)| *id)
            .collect();
        let removed: Vec<(SessionId, SessionEntry)> = stale
            .iter()
            .filter_map(|id| indexes.remove(id).map(|entry| (*id, entry)))
            .collect();
        drop(indexes);

        for (id, entry) in removed {
            self.announce_detach(id, entry, DetachReason::Idle);
        }
        stale
    }

    pub async fn ping_all(&self) -> usize {
        self.broadcast(Envelope::ping(self.inner.clock.now())).await
    }

    pub async fn stats(&self) -> HubStats {
        let indexes = self.inner.indexes.read().await;
        HubStats {
            total_sessions: indexes.sessions.len(),
            users_online: indexes.by_user.len(),
            rooms: indexes.by_room.len(),
        }
    }

    pub async fn is_online(&self, user_id: UserId) -> bool {
        self.inner.indexes.read().await.by_user.contains_key(&user_id)
    }

    pub async fn users_online(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .inner
            .indexes
            .read()
            .await
            .by_user
            .keys()
            .copied()
            .collect();
        users.sort_unstable();
        users
    }

    pub async fn sessions_of(&self, user_id: UserId) -> Vec<SessionId> {
        self.inner
            .indexes
            .read()
            .await
            .by_user
            .get(&user_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn session_info(&self, id: SessionId) -> Option<SessionInfo> {
        let indexes = self.inner.indexes.read().await;
        indexes.sessions.get(&id).map(|entry| {
            let mut rooms: Vec<String> = entry.rooms.iter().cloned().collect();
            rooms.sort();
            SessionInfo {
                id,
                user_id: entry.user_id,
                joined_at: entry.joined_at,
                last_ping_at: entry.last_ping_at,
                rooms,
            }
        })
    }

    /// The three indexes agree with each other
    pub async fn indexes_consistent(&self) -> bool {
        let indexes = self.inner.indexes.read().await;
        let forward = indexes.sessions.iter().all(|(id, entry)| {
            indexes
                .by_user
                .get(&entry.user_id)
                .map(|ids| ids.contains(id))
                .unwrap_or(false)
                && entry.rooms.iter().all(|room| {
                    indexes
                        .by_room
                        .get(room)
                        .map(|ids| ids.contains(id))
                        .unwrap_or(false)
                })
        });
        let by_user = indexes.by_user.iter().all(|(user, ids)| {
            !ids.is_empty()
                && ids.iter().all(|id| {
                    indexes
                        .sessions
                        .get(id)
                        .map(|entry| entry.user_id == *user)
                        .unwrap_or(false)
                })
        });
        let by_room = indexes.by_room.iter().all(|(room, ids)| {
            !ids.is_empty()
                && ids.iter().all(|id| {
                    indexes
                        .sessions
                        .get(id)
                        .map(|entry| entry.rooms.contains(room))
                        .unwrap_or(false)
                })
        });
        forward && by_user && by_room
    }

    /// Ping and reap tickers, until `shutdown` flips to true
    pub fn spawn_maintenance(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let hub = self.clone();
        let ping_every = self.inner.config.ping_interval;
        let reap_every = self.inner.config.reap_interval;
        tokio::spawn(async move {
            let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + ping_every, ping_every);
            let mut reap = tokio::time::interval_at(tokio::time::Instant::now() + reap_every, reap_every);
            ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            reap.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ping.tick() => {
                        let sent = hub.ping_all().await;
                        tracing::debug!("[Hub] Pinged {} sessions", sent);
                    }
                    _ = reap.tick() => {
                        let reaped = hub.sweep_idle().await;
                        if !reaped.is_empty() {
                            tracing::info!("[Hub] Idle sweep reaped {} sessions", reaped.len());
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("[Hub] Maintenance stopped");
        })
    }

    /// Stop accepting sessions and detach every live one
    pub async fn shutdown(&self) -> usize {
        self.inner.shutting_down.store(true, Ordering::Release);
        let drained: Vec<(SessionId, SessionEntry)> = {
            let mut indexes = self.inner.indexes.write().await;
            indexes.by_user.clear();
            indexes.by_room.clear();
            indexes.sessions.drain().collect()
        };
        let count = drained.len();
        for (id, entry) in drained {
            self.announce_detach(id, entry, DetachReason::Shutdown);
        }
        tracing::info!("[Hub] Shut down, detached {} sessions", count);
        count
    }

    /// How long a presence entry lives in the cache
    pub fn presence_ttl(&self) -> Duration {
        self.inner.config.idle_timeout
    }
}
