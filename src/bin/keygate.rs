//! keygate CLI — drive a simulated workload through the dispatcher.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use keygate::config::Config;
use keygate::engine::Dispatcher;
use keygate::error::BoxError;
use keygate::processor::{FailureObserver, Processor};
use keygate::telemetry::{TelemetryConfig, init_telemetry};
use tracing::info;

#[derive(Parser)]
#[command(name = "keygate", about = "Keyed mutual-exclusion dispatcher")]
struct Cli {
    /// TOML config file (environment variables are used when omitted)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a simulated workload and report whether equal keys ever overlapped
    Demo {
        /// Number of distinct keys
        #[arg(long, default_value_t = 4)]
        keys: usize,
        /// Total number of submissions, spread round-robin over the keys
        #[arg(long, default_value_t = 64)]
        submissions: usize,
        /// Simulated processing time per key, in milliseconds
        #[arg(long, default_value_t = 10)]
        work_ms: u64,
        /// Fail every Nth processor call (0 = never)
        #[arg(long, default_value_t = 0)]
        fail_every: u64,
    },
    /// Print the effective configuration
    Config,
}

/// Processor that sleeps, fails on request, and counts reentrant calls.
struct SimulatedProcessor {
    in_progress: Mutex<HashSet<String>>,
    overlaps: AtomicUsize,
    calls: AtomicU64,
    work: Duration,
    fail_every: u64,
}

impl Processor<String> for SimulatedProcessor {
    async fn process(&self, key: &String) -> Result<(), BoxError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let entered = self
            .in_progress
            .lock()
            .map_err(|_| "in-progress set poisoned")?
            .insert(key.clone());
        if !entered {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
            return Err(format!("reentered while processing {key}").into());
        }

        tokio::time::sleep(self.work).await;

        self.in_progress
            .lock()
            .map_err(|_| "in-progress set poisoned")?
            .remove(key);

        if self.fail_every > 0 && call % self.fail_every == 0 {
            return Err(format!("simulated failure on call {call}").into());
        }
        Ok(())
    }
}

#[derive(Default)]
struct CountingObserver {
    failures: AtomicUsize,
}

impl FailureObserver<String> for CountingObserver {
    fn manage(&self, _key: &String) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };

    match cli.command {
        Command::Config => {
            println!("log_level:     {}", config.log_level);
            println!(
                "otel_endpoint: {}",
                config.otel_endpoint.as_deref().unwrap_or("-")
            );
            println!("service_name:  {}", config.service_name);
            Ok(())
        }
        Command::Demo {
            keys,
            submissions,
            work_ms,
            fail_every,
        } => {
            let _guard = init_telemetry(TelemetryConfig::from(&config))?;
            cmd_demo(keys, submissions, work_ms, fail_every).await
        }
    }
}

async fn cmd_demo(
    keys: usize,
    submissions: usize,
    work_ms: u64,
    fail_every: u64,
) -> anyhow::Result<()> {
    if keys == 0 {
        anyhow::bail!("--keys must be at least 1");
    }

    let processor = Arc::new(SimulatedProcessor {
        in_progress: Mutex::new(HashSet::new()),
        overlaps: AtomicUsize::new(0),
        calls: AtomicU64::new(0),
        work: Duration::from_millis(work_ms),
        fail_every,
    });
    let observer = Arc::new(CountingObserver::default());

    let dispatcher = Dispatcher::builder(Arc::clone(&processor))
        .failure_observer(Arc::clone(&observer))
        .build()?;

    info!(keys, submissions, work_ms, fail_every, "starting demo workload");
    let start = Instant::now();

    let handles: Vec<_> = (0..submissions)
        .map(|i| dispatcher.handle(format!("key-{:03}", i % keys)))
        .collect();

    let mut processed = 0usize;
    let mut failed = 0usize;
    for handle in handles {
        if handle.outcome().await?.is_processed() {
            processed += 1;
        } else {
            failed += 1;
        }
    }

    let elapsed = start.elapsed();
    let overlaps = processor.overlaps.load(Ordering::SeqCst);

    println!("{:<14}  {:>8}", "METRIC", "VALUE");
    println!("{}", "-".repeat(24));
    println!("{:<14}  {:>8}", "submissions", submissions);
    println!("{:<14}  {:>8}", "keys", keys);
    println!("{:<14}  {:>8}", "processed", processed);
    println!("{:<14}  {:>8}", "failed", failed);
    println!(
        "{:<14}  {:>8}",
        "observed",
        observer.failures.load(Ordering::SeqCst)
    );
    println!("{:<14}  {:>8}", "overlaps", overlaps);
    println!("{:<14}  {:>6}ms", "elapsed", elapsed.as_millis());

    if overlaps > 0 {
        anyhow::bail!("{overlaps} overlapping calls for equal keys");
    }
    Ok(())
}
