//! Per-key fixed window state.

use std::time::{Duration, Instant};

/// A fixed window tracking calls for a single key.
///
/// `expires_at` is fixed when the window is created. An expired window is
/// replaced wholesale rather than extended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowEntry {
    /// Calls admitted in this window
    count: u64,
    /// Maximum calls admitted in this window
    limit: u64,
    /// When the window stops applying
    expires_at: Instant,
}

impl WindowEntry {
    /// Open a new window with the first call already counted.
    pub fn open(limit: u64, expires_at: Instant) -> Self {
        Self {
            count: 1,
            limit,
            expires_at,
        }
    }

    /// Whether the window still applies at `now`.
    pub fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }

    /// Count one more call if the window has capacity left.
    ///
    /// Returns `false` without mutating when the window is full.
    pub fn try_increment(&mut self) -> bool {
        if self.count < self.limit {
            self.count += 1;
            true
        } else {
            false
        }
    }

    /// Get the current count.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Get the limit for this window.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Get the expiry instant.
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Get the remaining quota.
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.count)
    }

    /// Get the duration until the window resets.
    pub fn reset_after(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }

    /// Snapshot the window as seen at `now`.
    pub fn usage(&self, now: Instant) -> WindowUsage {
        WindowUsage {
            count: self.count,
            limit: self.limit,
            remaining: self.remaining(),
            reset_after: self.reset_after(now),
        }
    }
}

/// Read-only view of a live window, suitable for rate limit headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUsage {
    /// Calls admitted so far
    pub count: u64,
    /// Maximum calls for the window
    pub limit: u64,
    /// Calls still available
    pub remaining: u64,
    /// Time until a fresh window can be opened
    pub reset_after: Duration,
}
