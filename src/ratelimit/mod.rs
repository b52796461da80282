//! Fixed-window rate limiting state and its background reclamation.

mod expiry;
mod reclaimer;
mod store;
mod window;

pub use expiry::{ExpiryIndex, ExpiryRecord};
pub use store::RateStore;
pub use window::{WindowEntry, WindowUsage};
