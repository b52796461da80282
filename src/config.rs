//! Configuration management for the rate store.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{RateStoreError, Result};

/// Default interval between reclaimer sweeps.
pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(1);
/// Default number of expiry records drained per lock acquisition.
pub const DEFAULT_GC_BATCH_SIZE: usize = 100;
/// Longest accepted sweep interval; tick deadlines must fit in an `Instant`.
pub const MAX_GC_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Prefix for environment variable overrides, e.g. `RATESTORE_GC__INTERVAL_MS`.
const ENV_PREFIX: &str = "RATESTORE";

/// Runtime options for a [`RateStore`](crate::ratelimit::RateStore).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    /// How often the reclaimer wakes up
    pub gc_interval: Duration,
    /// Maximum expiry records handled per lock acquisition
    pub gc_batch_size: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            gc_interval: DEFAULT_GC_INTERVAL,
            gc_batch_size: DEFAULT_GC_BATCH_SIZE,
        }
    }
}

impl StoreOptions {
    /// Set the reclaimer wake-up interval.
    pub fn with_gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }

    /// Set the per-batch drain limit.
    pub fn with_gc_batch_size(mut self, batch_size: usize) -> Self {
        self.gc_batch_size = batch_size;
        self
    }

    /// Reject option values the reclaimer cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.gc_interval.is_zero() {
            return Err(RateStoreError::Config(
                "gc interval must be greater than zero".to_string(),
            ));
        }
        if self.gc_interval > MAX_GC_INTERVAL {
            return Err(RateStoreError::Config(format!(
                "gc interval must be at most {:?}",
                MAX_GC_INTERVAL
            )));
        }
        if self.gc_batch_size == 0 {
            return Err(RateStoreError::Config(
                "gc batch size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// File and environment loadable configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateStoreConfig {
    /// Reclaimer configuration
    #[serde(default)]
    pub gc: GcConfig,

    /// Logging configuration (used by the binary)
    #[serde(default)]
    pub log: LogConfig,
}

/// Reclaimer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcConfig {
    /// Sweep interval in milliseconds
    #[serde(default = "default_gc_interval_ms")]
    pub interval_ms: u64,

    /// Expiry records drained per lock acquisition
    #[serde(default = "default_gc_batch_size")]
    pub batch_size: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_gc_interval_ms(),
            batch_size: default_gc_batch_size(),
        }
    }
}

fn default_gc_interval_ms() -> u64 {
    DEFAULT_GC_INTERVAL.as_millis() as u64
}

fn default_gc_batch_size() -> usize {
    DEFAULT_GC_BATCH_SIZE
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default filter directive when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl RateStoreConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate store configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| RateStoreError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load configuration from an optional file, overlaid with
    /// `RATESTORE_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading rate store configuration");
            builder = builder.add_source(config::File::from(path));
        }

        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|cfg| cfg.try_deserialize())
            .map_err(|e| RateStoreError::Config(e.to_string()))
    }

    /// Convert into validated runtime options.
    pub fn store_options(&self) -> Result<StoreOptions> {
        let options = StoreOptions::default()
            .with_gc_interval(Duration::from_millis(self.gc.interval_ms))
            .with_gc_batch_size(self.gc.batch_size);
        options.validate()?;
        Ok(options)
    }
}
