use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ratestore::config::RateStoreConfig;
use ratestore::ratelimit::RateStore;

/// Drive calls for one key through a fixed-window rate store.
#[derive(Debug, Parser)]
#[command(name = "ratestore", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Key to rate limit
    #[arg(long, default_value = "demo")]
    key: String,

    /// Window length in milliseconds
    #[arg(long, default_value_t = 1000)]
    period_ms: u64,

    /// Calls admitted per window
    #[arg(long, default_value_t = 5)]
    limit: u64,

    /// Number of calls to issue
    #[arg(long, default_value_t = 20)]
    requests: u64,

    /// Delay between calls in milliseconds
    #[arg(long, default_value_t = 100)]
    pace_ms: u64,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = RateStoreConfig::load(args.config.as_deref())?;
    init_tracing(&config.log.level, args.json);

    info!("Starting ratestore");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let store = RateStore::new(config.store_options()?)?;

    let period = Duration::from_millis(args.period_ms);
    let mut pace = tokio::time::interval(Duration::from_millis(args.pace_ms.max(1)));
    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut admitted = 0u64;
    let mut rejected = 0u64;

    for request in 1..=args.requests {
        tokio::select! {
            _ = pace.tick() => {}
            interrupted = &mut ctrl_c => {
                interrupted?;
                info!(issued = request - 1, "Interrupted, stopping early");
                break;
            }
        }

        match store.allow(&args.key, period, args.limit) {
            Ok(()) => {
                admitted += 1;
                info!(request = request, key = %args.key, "Admitted");
            }
            Err(e) if e.is_rate_limited() => {
                rejected += 1;
                info!(request = request, key = %args.key, "Rejected: {}", e);
            }
            Err(e) => return Err(e.into()),
        }
    }

    info!(
        admitted = admitted,
        rejected = rejected,
        tracked_keys = store.len(),
        "Run finished"
    );

    store.close();
    Ok(())
}

/// Install the global subscriber; `RUST_LOG` overrides the configured level.
fn init_tracing(default_level: &str, json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
