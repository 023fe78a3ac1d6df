use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use limitkit::config::{BuiltLimiter, LimiterConfig};
use limitkit::error::{LimiterError, Result};
use limitkit::ratelimit::Limiter;
use limitkit::store::{MemoryStore, SharedCounterStore};

/// Drive a configured limiter with concurrent callers and report its decisions.
#[derive(Debug, Parser)]
#[command(name = "limitkit-bench", version)]
struct Args {
    /// Path to the limiter YAML definition
    #[arg(short, long)]
    config: PathBuf,

    /// Number of concurrent callers
    #[arg(long, default_value_t = 8)]
    callers: usize,

    /// How long to run, in milliseconds
    #[arg(long, default_value_t = 1000)]
    duration_ms: u64,

    /// How long an admitted caller holds an active slot, in milliseconds
    #[arg(long, default_value_t = 5)]
    hold_ms: u64,

    /// Pause between two calls of the same caller, in milliseconds
    #[arg(long, default_value_t = 1)]
    pace_ms: u64,

    /// Key passed to the limiter
    #[arg(long, default_value = "bench")]
    key: String,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

/// Decision counters shared by all callers.
#[derive(Debug, Default)]
struct Tally {
    admitted: AtomicU64,
    limited: AtomicU64,
    errors: AtomicU64,
}

impl Tally {
    fn record(&self, decision: &Result<bool>) {
        let counter = match decision {
            Ok(false) => &self.admitted,
            Ok(true) => &self.limited,
            Err(e) if e.implies_limited() => &self.limited,
            Err(_) => &self.errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);
    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("Starting limitkit bench");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = LimiterConfig::from_file(&args.config)?;
    info!(config = ?config, "Configuration loaded");

    let store: Arc<dyn SharedCounterStore> = Arc::new(MemoryStore::new());
    let limiter = Arc::new(config.build(store)?);

    let replenisher = match limiter.as_ref() {
        BuiltLimiter::Bucket(bucket) => Some(bucket.start()?),
        _ => None,
    };

    let tally = Arc::new(Tally::default());
    let stop = Arc::new(AtomicBool::new(false));
    let started = Instant::now();

    let callers: Vec<_> = (0..args.callers)
        .map(|id| {
            let caller = Caller {
                id,
                limiter: limiter.clone(),
                tally: tally.clone(),
                stop: stop.clone(),
                key: args.key.clone(),
                hold: Duration::from_millis(args.hold_ms),
                pace: Duration::from_millis(args.pace_ms),
            };
            tokio::spawn(caller.run())
        })
        .collect();

    info!(callers = args.callers, duration_ms = args.duration_ms, "Callers started");

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(args.duration_ms)) => {}
        _ = shutdown_signal() => {}
    }

    stop.store(true, Ordering::SeqCst);
    if let Some(handle) = replenisher {
        handle.stop().await?;
    }

    for result in futures::future::join_all(callers).await {
        if let Err(e) = result {
            warn!(error = %e, "Caller task failed");
        }
    }

    info!(
        admitted = tally.admitted.load(Ordering::Relaxed),
        limited = tally.limited.load(Ordering::Relaxed),
        errors = tally.errors.load(Ordering::Relaxed),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Bench finished"
    );

    Ok(())
}

/// One simulated client hammering the limiter.
struct Caller {
    id: usize,
    limiter: Arc<BuiltLimiter>,
    tally: Arc<Tally>,
    stop: Arc<AtomicBool>,
    key: String,
    hold: Duration,
    pace: Duration,
}

impl Caller {
    async fn run(self) {
        debug!(caller = self.id, "Caller started");

        while !self.stop.load(Ordering::SeqCst) {
            let decision = match self.limiter.as_ref() {
                BuiltLimiter::Active(limiter) => {
                    let decision = limiter.limit(&self.key).await;
                    // Every counted call is released, admitted or not
                    if let Ok(limited) = decision {
                        if !limited {
                            tokio::time::sleep(self.hold).await;
                        }
                        if let Err(e) = limiter.decr(&self.key).await {
                            warn!(caller = self.id, error = %e, "Failed to release active slot");
                        }
                    }
                    decision
                }
                BuiltLimiter::Bucket(bucket) => {
                    match bucket.block_limit(&self.key, Duration::from_millis(100)).await {
                        Err(LimiterError::Closed) => break,
                        decision => decision,
                    }
                }
                BuiltLimiter::Window(limiter) => limiter.limit(&self.key).await,
            };

            self.tally.record(&decision);
            tokio::time::sleep(self.pace).await;
        }

        debug!(caller = self.id, "Caller stopped");
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping callers");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping callers");
        }
    }
}
