//! Store-local wall clock.
//!
//! Lease and cache deadlines are stored as epoch milliseconds. The
//! clock anchors the epoch once and then advances with
//! `tokio::time::Instant`, so tests driving a paused tokio clock see
//! leases and TTLs expire on virtual time.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: Instant,
    origin_epoch_ms: u64,
}

impl Clock {
    pub fn new() -> Self {
        let origin_epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self {
            origin: Instant::now(),
            origin_epoch_ms,
        }
    }

    /// Current time in epoch milliseconds.
    pub fn now_ms(&self) -> u64 {
        let elapsed = Instant::now().saturating_duration_since(self.origin);
        self.origin_epoch_ms + elapsed.as_millis() as u64
    }

    /// Epoch milliseconds `ttl` from now.
    pub fn deadline_ms(&self, ttl: Duration) -> u64 {
        self.now_ms().saturating_add(ttl.as_millis() as u64)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
