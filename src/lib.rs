//! Ratestore - in-process fixed-window rate limiting
//!
//! This crate tracks per-key call counts over fixed windows behind a single
//! lock. Expired windows are found through a min-heap of expiry records and
//! reclaimed by a background thread in bounded batches, so the hot path never
//! scans the table.

pub mod config;
pub mod error;
pub mod ratelimit;

pub use config::StoreOptions;
pub use error::{RateStoreError, Result};
pub use ratelimit::RateStore;
