//! Background reclamation of expired windows.
//!
//! The reclaimer is a dedicated thread that wakes once per configured
//! interval, drains due expiry records in bounded batches and goes back to
//! sleep. Between batches the lock is handed over to waiting callers so a
//! large backlog never stalls `allow` for more than one batch.

use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use parking_lot::MutexGuard;
use tracing::{debug, info, trace};

use super::store::Shared;
use crate::config::StoreOptions;

const THREAD_NAME: &str = "ratestore-reclaimer";

/// Start the reclaimer thread for `shared`.
pub(crate) fn spawn(shared: Arc<Shared>, options: StoreOptions) -> io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(THREAD_NAME.to_string())
        .spawn(move || run(&shared, options))
}

fn run(shared: &Shared, options: StoreOptions) {
    info!(interval = ?options.gc_interval, "Reclaimer started");

    let mut next_tick = Instant::now() + options.gc_interval;
    let mut state = shared.state.lock();

    loop {
        // Wait for the tick, re-waiting on spurious wakeups.
        while !state.is_closed() && Instant::now() < next_tick {
            shared.wakeup.wait_until(&mut state, next_tick);
        }
        if state.is_closed() {
            break;
        }

        let mut removed = 0;
        let mut stale = 0;
        let mut batches = 0;
        loop {
            let batch = state.sweep_batch(Instant::now(), options.gc_batch_size);
            removed += batch.removed;
            stale += batch.stale;
            batches += 1;

            if !batch.exhausted {
                break;
            }
            trace!(removed = batch.removed, stale = batch.stale, "Reclaimer batch exhausted");
            MutexGuard::bump(&mut state);
        }

        if removed > 0 || stale > 0 {
            debug!(
                removed = removed,
                stale = stale,
                batches = batches,
                "Reclaimed expired windows"
            );
        }

        // Fixed-rate ticks; missed ticks are skipped rather than replayed.
        next_tick += options.gc_interval;
        let now = Instant::now();
        if next_tick <= now {
            next_tick = now + options.gc_interval;
        }
    }

    info!("Reclaimer stopped");
}
