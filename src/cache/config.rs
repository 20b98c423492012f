//! Cache tuning

use std::time::Duration;

/// Configuration for the authorization cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Live events each watcher may have queued before it is closed
    pub watch_buffer: usize,

    /// Initial delay before reconnecting a lost feed
    pub resync_backoff: Duration,

    /// Maximum delay between reconnection attempts
    pub max_resync_backoff: Duration,

    /// Consecutive failed resyncs before the cache reports itself degraded
    pub max_resync_failures: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            watch_buffer: 100,
            resync_backoff: Duration::from_secs(1),
            max_resync_backoff: Duration::from_secs(30),
            max_resync_failures: 5,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-watcher buffer (at least one event)
    pub fn watch_buffer(mut self, events: usize) -> Self {
        self.watch_buffer = events.max(1);
        self
    }

    /// Set the reconnection delay range
    pub fn resync_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.resync_backoff = initial;
        self.max_resync_backoff = max.max(initial);
        self
    }

    pub fn max_resync_failures(mut self, failures: u32) -> Self {
        self.max_resync_failures = failures.max(1);
        self
    }

    /// Delay before reconnect attempt number `attempt` (0-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.resync_backoff
            .checked_mul(2u32.saturating_pow(attempt.min(16)))
            .map_or(self.max_resync_backoff, |delay| delay.min(self.max_resync_backoff))
    }
}
