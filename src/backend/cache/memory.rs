/**
 * In-Memory Cache
 *
 * `HashMap` of entries with an optional deadline, checked lazily on read.
 * Pub/sub uses one `tokio::sync::broadcast` sender per channel; channels
 * whose subscribers have all gone are pruned on the next publish.
 */
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};

use crate::backend::cache::{glob_match, Cache, CacheError};
use crate::backend::runtime::SharedClock;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at > now).unwrap_or(true)
    }
}

pub struct MemoryCache {
    clock: SharedClock,
    entries: Mutex<HashMap<String, Entry>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl MemoryCache {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn deadline(&self, ttl: Duration) -> Option<DateTime<Utc>> {
        chrono::Duration::from_std(ttl)
            .ok()
            .map(|ttl| self.clock.now() + ttl)
    }

    /// Drop expired entries eagerly
    pub async fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        before - entries.len()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), CacheError> {
        let expires_at = ttl.and_then(|ttl| self.deadline(ttl));
        self.entries
            .lock()
            .await
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let now = self.clock.now();
        let removed = self.entries.lock().await.remove(key);
        Ok(removed.map(|entry| entry.is_live(now)).unwrap_or(false))
    }

    async fn incr(&self, key: &str, by: i64) -> Result<i64, CacheError> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        let (current, expires_at) = match entries.get(key) {
            Some(entry) if entry.is_live(now) => {
                let value = entry.value.parse::<i64>().map_err(|_| CacheError::NotAnInteger {
                    key: key.to_string(),
                })?;
                (value, entry.expires_at)
            }
            _ => (0, None),
        };
        let next = current + by;
        entries.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let now = self.clock.now();
        let deadline = self.deadline(ttl);
        let mut entries = self.entries.lock().await;
        match entries.get_mut(key) {
            Some(entry) if entry.is_live(now) => {
                entry.expires_at = deadline;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        let now = self.clock.now();
        let entries = self.entries.lock().await;
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(key, entry)| entry.is_live(now) && glob_match(pattern, key))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn publish(&self, channel: &str, message: String) -> Result<usize, CacheError> {
        let mut channels = self.channels.lock().await;
        channels.retain(|_, sender| sender.receiver_count() > 0);
        match channels.get(channel) {
            Some(sender) => Ok(sender.send(message).unwrap_or(0)),
            None => Ok(0),
        }
    }

    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>, CacheError> {
        let mut channels = self.channels.lock().await;
        let sender = channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        Ok(sender.subscribe())
    }
}
