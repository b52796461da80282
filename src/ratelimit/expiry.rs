//! Expiry index used by the reclaimer to find expired windows.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::time::Instant;

/// A `(key, expires_at)` pair queued when a window is opened.
///
/// A record may outlive its window if the key is renewed before the
/// reclaimer gets to it. Such records are detected at pop time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiryRecord {
    /// The key whose window this record refers to
    pub key: String,
    /// Expiry of the window at the time it was opened
    pub expires_at: Instant,
}

impl ExpiryRecord {
    /// Create a new expiry record.
    pub fn new(key: impl Into<String>, expires_at: Instant) -> Self {
        Self {
            key: key.into(),
            expires_at,
        }
    }

    /// Whether the record is due for reclamation at `now`.
    pub fn is_due(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

impl Ord for ExpiryRecord {
    fn cmp(&self, other: &Self) -> Ordering {
        self.expires_at
            .cmp(&other.expires_at)
            .then_with(|| self.key.cmp(&other.key))
    }
}

impl PartialOrd for ExpiryRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of expiry records ordered by expiry.
#[derive(Debug, Default)]
pub struct ExpiryIndex {
    heap: BinaryHeap<Reverse<ExpiryRecord>>,
}

impl ExpiryIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a record.
    pub fn push(&mut self, record: ExpiryRecord) {
        self.heap.push(Reverse(record));
    }

    /// The earliest expiring record, if any.
    pub fn peek(&self) -> Option<&ExpiryRecord> {
        self.heap.peek().map(|Reverse(record)| record)
    }

    /// Remove and return the earliest expiring record.
    pub fn pop(&mut self) -> Option<ExpiryRecord> {
        self.heap.pop().map(|Reverse(record)| record)
    }

    /// Pop the earliest record only if it is due at `now`.
    ///
    /// Everything behind a not-yet-due minimum is also not due, so `None`
    /// means the caller can stop sweeping.
    pub fn pop_due(&mut self, now: Instant) -> Option<ExpiryRecord> {
        match self.peek() {
            Some(record) if record.is_due(now) => self.pop(),
            _ => None,
        }
    }

    /// Number of queued records, including stale ones.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
