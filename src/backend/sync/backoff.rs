//! # Retry Backoff
//!
//! Exponential backoff with jitter for failed offline operations:
//!
//! ```text
//! backoff(a) = min(max_backoff, base · 2^a) · uniform(0.5, 1.5)
//! ```
//!
//! `a` is the number of attempts already made, so the first retry of an op
//! claimed once waits around `2 · base`.

use std::time::Duration;

use crate::backend::runtime::jitter;
use crate::shared::config::RetryConfig;

/// Backoff schedule
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub max_backoff: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max_backoff: Duration) -> Self {
        Self { base, max_backoff }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.base, config.max_backoff)
    }

    /// Deterministic part: `min(max_backoff, base · 2^attempts)`
    pub fn ceiling(&self, attempts: u32) -> Duration {
        let factor = 2u32.checked_pow(attempts).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Delay before the next attempt
    pub fn delay(&self, attempts: u32) -> Duration {
        self.ceiling(attempts).mul_f64(jitter(0.5, 1.5))
    }
}

impl From<&RetryConfig> for Backoff {
    fn from(config: &RetryConfig) -> Self {
        Self::from_config(config)
    }
}
