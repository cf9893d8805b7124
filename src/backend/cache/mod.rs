//! Key-value cache
//!
//! A small cache contract the hub and delivery service lean on for
//! short-lived state: presence status per user, protocol-violation counters
//! per session, and the `system` pub/sub channel.
//!
//! # Module Structure
//!
//! ```text
//! cache/
//! ├── mod.rs      - `Cache` trait and `CacheError`
//! └── memory.rs   - In-process implementation with lazy TTL eviction
//! ```

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

pub mod memory;

pub use memory::MemoryCache;

/// Cache failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Backend unreachable or refused the command
    #[error("cache unavailable: {0}")]
    Unavailable(String),
    /// Value under the key is not of the expected shape
    #[error("cache value under '{key}' is not an integer")]
    NotAnInteger { key: String },
}

pub type SharedCache = Arc<dyn Cache>;

/// TTL'd key-value store with atomic counters and pub/sub
#[async_trait]
pub trait Cache: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Store `value`; `ttl = None` keeps it until deleted
    async fn put(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), CacheError>;

    /// Returns whether the key existed
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    /// Atomically add `by`, creating the key at 0; returns the new value
    async fn incr(&self, key: &str, by: i64) -> Result<i64, CacheError>;

    /// Set a TTL on an existing key; returns whether the key existed
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError>;

    /// Live keys matching a glob (`*` and `?`)
    async fn scan(&self, pattern: &str) -> Result<Vec<String>, CacheError>;

    /// Returns how many subscribers received the message
    async fn publish(&self, channel: &str, message: String) -> Result<usize, CacheError>;

    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>, CacheError>;
}

/// Glob match supporting `*` and `?`
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut mark = 0usize;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            mark = ti;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
