//! Plain in-memory configuration for a [`Notifier`](crate::Notifier).
//!
//! No file format or CLI lives here; callers construct these values however
//! they load configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level notifier configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub throttle: ThrottleConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Upper bound on a single Bot API call, in milliseconds. A hung call
    /// fails instead of stalling the dispatch lock for everyone behind it.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Emit `tracing` debug events for every dispatch decision.
    #[serde(default)]
    pub debug: bool,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            throttle: ThrottleConfig::default(),
            retry: RetryConfig::default(),
            request_timeout_ms: default_request_timeout_ms(),
            debug: false,
        }
    }
}

impl NotifierConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Bounds for the delivered-message cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Entry count at which the cache evicts before inserting.
    #[serde(default = "default_cache_max_size")]
    pub max_size: usize,

    /// How long a delivered message stays eligible for dedup-to-update,
    /// in milliseconds.
    #[serde(default = "default_cache_ttl_ms")]
    pub ttl_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: default_cache_max_size(),
            ttl_ms: default_cache_ttl_ms(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

/// Admission-control bounds for outbound dispatches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Maximum admitted dispatches per interval.
    #[serde(default = "default_throttle_limit")]
    pub limit: u32,

    /// Advisory bound on the deferred-task queue. New work is deferred once
    /// the queue reaches this length, but retries may still be parked.
    #[serde(default = "default_throttle_max_size")]
    pub max_size: usize,

    /// Length of one rate window, in milliseconds. The drain tick resets the
    /// budget and flushes parked work once per interval.
    #[serde(default = "default_throttle_interval_ms")]
    pub interval_ms: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            limit: default_throttle_limit(),
            max_size: default_throttle_max_size(),
            interval_ms: default_throttle_interval_ms(),
        }
    }
}

impl ThrottleConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Retry policy for rate-limited (429) dispatches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total transport attempts per logical delivery, including the first.
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,

    /// Base backoff delay in milliseconds; attempt `n` waits `base * 2^(n-1)`
    /// before re-entering the throttle queue.
    #[serde(default = "default_retry_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_max_attempts(),
            base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_cache_max_size() -> usize {
    1_000
}

fn default_cache_ttl_ms() -> u64 {
    60_000
}

fn default_throttle_limit() -> u32 {
    20
}

fn default_throttle_max_size() -> usize {
    100
}

fn default_throttle_interval_ms() -> u64 {
    60_000
}

fn default_retry_max_attempts() -> u32 {
    5
}

fn default_retry_base_delay_ms() -> u64 {
    500
}
