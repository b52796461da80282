//! Core rate store implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, trace, warn};

use super::expiry::{ExpiryIndex, ExpiryRecord};
use super::reclaimer;
use super::window::{WindowEntry, WindowUsage};
use crate::config::StoreOptions;
use crate::error::{RateStoreError, Result};

/// Longest window accepted; longer periods are clamped so `Instant`
/// arithmetic cannot overflow.
const MAX_PERIOD: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Counter table, expiry index and closed flag, guarded as one unit.
#[derive(Debug, Default)]
pub(crate) struct StoreState {
    windows: HashMap<String, WindowEntry>,
    index: ExpiryIndex,
    closed: bool,
}

/// Outcome of a single bounded reclaimer batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SweepBatch {
    /// Windows removed from the counter table
    pub removed: usize,
    /// Records whose window had been renewed or already removed
    pub stale: usize,
    /// The batch limit was reached before running out of due records
    pub exhausted: bool,
}

impl StoreState {
    /// Decide and record a call for `key` at `now`.
    pub(crate) fn allow(
        &mut self,
        key: &str,
        period: Duration,
        limit: u64,
        now: Instant,
    ) -> Result<()> {
        if self.closed {
            debug!(key = %key, "Rejecting call on closed rate store");
            return Err(RateStoreError::StoreClosed);
        }

        if let Some(entry) = self.windows.get_mut(key) {
            if entry.is_live(now) {
                if entry.try_increment() {
                    trace!(key = %key, count = entry.count(), limit = entry.limit(), "Call admitted");
                    return Ok(());
                }

                debug!(key = %key, limit = entry.limit(), "Rate limit exceeded");
                return Err(RateStoreError::RateLimitExceeded);
            }
        }

        // No live window: open a fresh one. The opening call is always admitted.
        let expires_at = now + period.min(MAX_PERIOD);
        self.windows
            .insert(key.to_owned(), WindowEntry::open(limit, expires_at));
        self.index.push(ExpiryRecord::new(key, expires_at));

        debug!(
            key = %key,
            limit = limit,
            period = ?period,
            "Opened rate limit window"
        );
        Ok(())
    }

    /// Reclaim up to `batch_size` due expiry records.
    ///
    /// A window is only removed when its expiry still matches the record, so
    /// a renewed window survives its predecessor's record.
    pub(crate) fn sweep_batch(&mut self, now: Instant, batch_size: usize) -> SweepBatch {
        let mut batch = SweepBatch::default();

        for _ in 0..batch_size {
            let Some(record) = self.index.pop_due(now) else {
                return batch;
            };

            let current = self
                .windows
                .get(&record.key)
                .is_some_and(|entry| entry.expires_at() == record.expires_at);

            if current {
                self.windows.remove(&record.key);
                batch.removed += 1;
            } else {
                batch.stale += 1;
            }
        }

        batch.exhausted = true;
        batch
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    /// Mark the state closed, returning whether it already was.
    fn mark_closed(&mut self) -> bool {
        std::mem::replace(&mut self.closed, true)
    }
}

/// State shared between callers and the reclaimer thread.
#[derive(Debug, Default)]
pub(crate) struct Shared {
    pub(crate) state: Mutex<StoreState>,
    /// Signalled on close so the reclaimer stops waiting for its next tick.
    pub(crate) wakeup: Condvar,
}

/// An in-process fixed-window rate limiter.
///
/// Every key gets its own window of `period`, opened by the first call after
/// the previous window expired. Expired windows are reclaimed by a background
/// thread in bounded batches, so memory does not grow with keys that have
/// gone quiet.
///
/// All calls serialize through one lock; the check and the increment are
/// atomic for a given key.
///
/// ```no_run
/// use std::time::Duration;
/// use ratestore::config::StoreOptions;
/// use ratestore::ratelimit::RateStore;
///
/// let store = RateStore::new(StoreOptions::default()).unwrap();
/// match store.allow("client-42", Duration::from_secs(1), 10) {
///     Ok(()) => { /* serve */ }
///     Err(e) if e.is_rate_limited() => { /* 429 */ }
///     Err(e) => panic!("{e}"),
/// }
/// store.close();
/// ```
pub struct RateStore {
    shared: Arc<Shared>,
    reclaimer: Mutex<Option<JoinHandle<()>>>,
    options: StoreOptions,
}

impl RateStore {
    /// Create a rate store and start its reclaimer.
    pub fn new(options: StoreOptions) -> Result<Self> {
        options.validate()?;

        let shared = Arc::new(Shared::default());
        let handle = reclaimer::spawn(Arc::clone(&shared), options)?;

        info!(
            gc_interval = ?options.gc_interval,
            gc_batch_size = options.gc_batch_size,
            "Rate store started"
        );

        Ok(Self {
            shared,
            reclaimer: Mutex::new(Some(handle)),
            options,
        })
    }

    /// Admit or reject a call for `key`.
    ///
    /// Returns `Ok(())` when the call fits in the key's current window,
    /// [`RateStoreError::RateLimitExceeded`] when the window is full and
    /// [`RateStoreError::StoreClosed`] after [`close`](Self::close).
    ///
    /// The first call of a window is always admitted, even with a `limit` of
    /// zero. A zero `period` opens a window that is already expired, so every
    /// such call opens a new one.
    pub fn allow(&self, key: &str, period: Duration, limit: u64) -> Result<()> {
        let mut state = self.shared.state.lock();
        state.allow(key, period, limit, Instant::now())
    }

    /// Stop the reclaimer and reject all further calls.
    ///
    /// Blocks until the reclaimer thread has exited. Calling it again is a
    /// no-op.
    pub fn close(&self) {
        let already_closed = self.shared.state.lock().mark_closed();
        if already_closed {
            warn!("Rate store already closed");
            return;
        }

        self.shared.wakeup.notify_all();

        if let Some(handle) = self.reclaimer.lock().take() {
            if handle.join().is_err() {
                error!("Reclaimer thread panicked");
            }
        }

        info!("Rate store closed");
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().is_closed()
    }

    /// Usage of the live window for `key`, if there is one.
    pub fn usage(&self, key: &str) -> Option<WindowUsage> {
        let now = Instant::now();
        let state = self.shared.state.lock();
        state
            .windows
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.usage(now))
    }

    /// Whether the counter table holds an entry for `key`.
    ///
    /// Expired entries stay present until the reclaimer removes them.
    pub fn contains_key(&self, key: &str) -> bool {
        self.shared.state.lock().windows.contains_key(key)
    }

    /// Number of entries in the counter table, expired or not.
    pub fn len(&self) -> usize {
        self.shared.state.lock().windows.len()
    }

    /// Whether the counter table is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of queued expiry records, including stale ones.
    pub fn pending_expiries(&self) -> usize {
        self.shared.state.lock().index.len()
    }

    /// The options this store was created with.
    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    #[cfg(test)]
    pub(crate) fn reclaimer_running(&self) -> bool {
        self.reclaimer
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for RateStore {
    fn drop(&mut self) {
        if !self.is_closed() {
            self.close();
        }
    }
}

impl std::fmt::Debug for RateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateStore")
            .field("options", &self.options)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::thread;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn test_store(gc_interval: Duration) -> RateStore {
        RateStore::new(StoreOptions::default().with_gc_interval(gc_interval)).unwrap()
    }

    #[test]
    fn test_allow_until_limit_then_renew() {
        let t0 = Instant::now();
        let mut state = StoreState::default();

        assert!(state.allow("k", ms(1), 2, t0).is_ok());
        assert!(state.allow("k", ms(1), 2, t0).is_ok());
        assert!(matches!(
            state.allow("k", ms(1), 2, t0),
            Err(RateStoreError::RateLimitExceeded)
        ));

        // A new window after expiry uses the new limit.
        let t1 = t0 + ms(2);
        assert!(state.allow("k", ms(1), 1, t1).is_ok());
        assert!(matches!(
            state.allow("k", ms(1), 1, t1),
            Err(RateStoreError::RateLimitExceeded)
        ));
    }

    #[test]
    fn test_rejection_does_not_mutate() {
        let t0 = Instant::now();
        let mut state = StoreState::default();

        state.allow("k", ms(100), 1, t0).unwrap();
        for _ in 0..5 {
            assert!(state.allow("k", ms(100), 1, t0).is_err());
        }

        assert_eq!(state.windows["k"].count(), 1);
        assert_eq!(state.index.len(), 1);
    }

    #[test]
    fn test_index_pushed_once_per_window() {
        let t0 = Instant::now();
        let mut state = StoreState::default();

        for _ in 0..10 {
            state.allow("k", ms(100), 100, t0).unwrap();
        }
        assert_eq!(state.index.len(), 1);

        state.allow("k", ms(100), 100, t0 + ms(100)).unwrap();
        assert_eq!(state.index.len(), 2);
        assert_eq!(state.windows.len(), 1);
    }

    #[test]
    fn test_window_expires_exactly_at_deadline() {
        let t0 = Instant::now();
        let mut state = StoreState::default();

        state.allow("k", ms(10), 1, t0).unwrap();
        assert!(state.allow("k", ms(10), 1, t0 + ms(9)).is_err());
        assert!(state.allow("k", ms(10), 1, t0 + ms(10)).is_ok());
    }

    #[test]
    fn test_zero_limit_admits_first_call_only() {
        // The opening call is admitted before any limit comparison.
        let t0 = Instant::now();
        let mut state = StoreState::default();

        assert!(state.allow("k", ms(100), 0, t0).is_ok());
        assert!(matches!(
            state.allow("k", ms(100), 0, t0),
            Err(RateStoreError::RateLimitExceeded)
        ));
    }

    #[test]
    fn test_zero_period_always_opens_new_window() {
        let t0 = Instant::now();
        let mut state = StoreState::default();

        for _ in 0..3 {
            assert!(state.allow("k", Duration::ZERO, 1, t0).is_ok());
        }
        assert_eq!(state.index.len(), 3);
    }

    #[test]
    fn test_huge_period_is_clamped() {
        let t0 = Instant::now();
        let mut state = StoreState::default();

        assert!(state.allow("k", Duration::MAX, 1, t0).is_ok());
        assert_eq!(state.windows["k"].expires_at(), t0 + MAX_PERIOD);
    }

    #[test]
    fn test_closed_state_rejects_without_mutation() {
        let t0 = Instant::now();
        let mut state = StoreState::default();

        assert!(!state.mark_closed());
        assert!(matches!(
            state.allow("k", ms(100), 10, t0),
            Err(RateStoreError::StoreClosed)
        ));
        assert!(state.windows.is_empty());
        assert!(state.index.is_empty());
        assert!(state.mark_closed());
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let t0 = Instant::now();
        let mut state = StoreState::default();

        state.allow("short", ms(10), 1, t0).unwrap();
        state.allow("long", ms(1000), 1, t0).unwrap();

        let batch = state.sweep_batch(t0 + ms(5), 100);
        assert_eq!(batch, SweepBatch::default());
        assert_eq!(state.windows.len(), 2);

        let batch = state.sweep_batch(t0 + ms(10), 100);
        assert_eq!(batch.removed, 1);
        assert!(!batch.exhausted);
        assert!(!state.windows.contains_key("short"));
        assert!(state.windows.contains_key("long"));
        assert_eq!(state.index.len(), 1);
    }

    #[test]
    fn test_sweep_keeps_renewed_window() {
        let t0 = Instant::now();
        let mut state = StoreState::default();

        state.allow("k", ms(10), 1, t0).unwrap();
        // Renewed after expiry, before the reclaimer ran.
        state.allow("k", ms(10), 1, t0 + ms(15)).unwrap();
        assert_eq!(state.index.len(), 2);

        let batch = state.sweep_batch(t0 + ms(20), 100);
        assert_eq!(batch.removed, 0);
        assert_eq!(batch.stale, 1);
        assert!(state.windows.contains_key("k"));

        let batch = state.sweep_batch(t0 + ms(25), 100);
        assert_eq!(batch.removed, 1);
        assert!(state.windows.is_empty());
        assert!(state.index.is_empty());
    }

    #[test]
    fn test_sweep_respects_batch_size() {
        let t0 = Instant::now();
        let mut state = StoreState::default();

        for i in 0..25 {
            state.allow(&format!("key-{}", i), ms(1), 1, t0).unwrap();
        }

        let now = t0 + ms(5);
        let first = state.sweep_batch(now, 10);
        assert_eq!(first.removed, 10);
        assert!(first.exhausted);

        let second = state.sweep_batch(now, 10);
        assert_eq!(second.removed, 10);
        assert!(second.exhausted);

        let third = state.sweep_batch(now, 10);
        assert_eq!(third.removed, 5);
        assert!(!third.exhausted);
        assert!(state.windows.is_empty());
    }

    #[test]
    fn test_store_allow_scenario() {
        let store = test_store(Duration::from_secs(1));

        assert!(store.allow("k", ms(50), 2).is_ok());
        assert!(store.allow("k", ms(50), 2).is_ok());
        let err = store.allow("k", ms(50), 2).unwrap_err();
        assert!(err.is_rate_limited());

        thread::sleep(ms(100));
        assert!(store.allow("k", ms(50), 1).is_ok());

        store.close();
    }

    #[test]
    fn test_independent_keys() {
        let store = test_store(Duration::from_secs(1));

        assert!(store.allow("a", Duration::from_secs(10), 1).is_ok());
        assert!(store.allow("b", Duration::from_secs(10), 1).is_ok());
        assert!(store.allow("a", Duration::from_secs(10), 1).is_err());
        assert_eq!(store.len(), 2);

        store.close();
    }

    #[test]
    fn test_usage_reports_live_window() {
        let store = test_store(Duration::from_secs(1));

        assert!(store.usage("k").is_none());
        store.allow("k", Duration::from_secs(10), 5).unwrap();
        store.allow("k", Duration::from_secs(10), 5).unwrap();

        let usage = store.usage("k").unwrap();
        assert_eq!(usage.count, 2);
        assert_eq!(usage.limit, 5);
        assert_eq!(usage.remaining, 3);
        assert!(usage.reset_after <= Duration::from_secs(10));

        store.close();
    }

    #[test]
    fn test_usage_hides_expired_window() {
        let store = test_store(Duration::from_secs(60));

        store.allow("k", ms(10), 5).unwrap();
        thread::sleep(ms(30));

        assert!(store.usage("k").is_none());
        assert!(store.contains_key("k"));

        store.close();
    }

    #[test]
    fn test_gc_removes_expired_key() {
        let store = test_store(ms(20));

        store.allow("k", ms(60), 1).unwrap();
        assert!(store.contains_key("k"));

        thread::sleep(ms(20));
        assert!(store.contains_key("k"));

        thread::sleep(ms(150));
        assert!(!store.contains_key("k"));
        assert!(store.is_empty());
        assert_eq!(store.pending_expiries(), 0);

        store.close();
    }

    #[test]
    fn test_renewed_window_survives_gc() {
        let store = test_store(ms(30));

        store.allow("k", ms(5), 1).unwrap();
        thread::sleep(ms(10));
        // Old window has expired; this opens a new one.
        store.allow("k", Duration::from_secs(10), 1).unwrap();

        thread::sleep(ms(100));
        assert!(store.contains_key("k"));
        assert!(store.allow("k", Duration::from_secs(10), 1).is_err());

        store.close();
    }

    #[test]
    fn test_closed_store_rejects_calls() {
        let store = test_store(Duration::from_secs(1));
        store.allow("k", Duration::from_secs(10), 5).unwrap();

        store.close();
        assert!(store.is_closed());

        for _ in 0..3 {
            assert!(matches!(
                store.allow("k", Duration::from_secs(10), 5),
                Err(RateStoreError::StoreClosed)
            ));
        }
        assert_eq!(store.usage("k").unwrap().count, 1);
    }

    #[test]
    fn test_close_twice_is_noop() {
        let store = test_store(Duration::from_secs(1));
        store.close();
        store.close();
        assert!(store.is_closed());
    }

    #[test]
    fn test_invalid_options_rejected() {
        let result = RateStore::new(StoreOptions::default().with_gc_batch_size(0));
        assert!(matches!(result, Err(RateStoreError::Config(_))));
    }

    #[test]
    fn test_concurrent_single_key_never_overshoots() {
        let store = test_store(Duration::from_secs(1));
        let admitted = AtomicU64::new(0);
        let limit = 50;

        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..100 {
                        if store.allow("hot", Duration::from_secs(60), limit).is_ok() {
                            admitted.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                });
            }
        });

        assert_eq!(admitted.load(Ordering::SeqCst), limit);
        store.close();
    }

    #[test]
    fn test_concurrent_random_keys_respect_limits() {
        let store = test_store(ms(10));
        let keys = 64;
        let limit = 3;
        let admitted: Vec<AtomicU64> = (0..keys).map(|_| AtomicU64::new(0)).collect();

        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    let mut rng = rand::thread_rng();
                    for _ in 0..500 {
                        let k = rng.gen_range(0..keys);
                        let key = format!("key-{}", k);
                        if store.allow(&key, Duration::from_secs(60), limit).is_ok() {
                            admitted[k].fetch_add(1, Ordering::SeqCst);
                        }
                    }
                });
            }
        });

        for count in &admitted {
            assert!(count.load(Ordering::SeqCst) <= limit);
        }
        assert!(store.len() <= keys);
        store.close();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_tasks_share_limit() {
        let store = Arc::new(test_store(Duration::from_secs(1)));
        let limit = 5;

        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.allow("contended", Duration::from_secs(60), limit).is_ok()
            }));
        }

        let mut accepted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                accepted += 1;
            }
        }

        assert_eq!(accepted, limit);
        store.close();
    }
}
