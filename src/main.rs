/*!
 * Gatehouse CLI
 *
 * `gatehouse check` validates a gateway configuration file.
 * `gatehouse simulate` drives a synthetic flaky backend through the pools,
 * breakers and rate limiter built from that file.
 */

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use gatehouse::{
    error::{EXIT_PARTIAL, EXIT_SUCCESS},
    logging,
    resilience::{CallContext, ResilienceError, ResourceFactory},
    GatewayConfig, GatewayError, GatewayResilience,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::info;

/// Distinct rate-limit keys the simulation spreads requests over
const SIMULATED_TENANTS: usize = 4;

#[derive(Parser)]
#[command(name = "gatehouse")]
#[command(version, about = "Resilience layer for AI orchestration gateways", long_about = None)]
struct Cli {
    /// Enable verbose logging (overrides the configured level)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and validate a configuration file
    Check {
        /// Path to the gateway TOML configuration
        config: PathBuf,

        /// Print the resolved configuration as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run synthetic traffic against a simulated flaky dependency
    Simulate(SimulateArgs),
}

#[derive(Args)]
struct SimulateArgs {
    /// Path to the gateway TOML configuration
    #[arg(short, long)]
    config: PathBuf,

    /// Total number of requests to send
    #[arg(long, default_value = "200")]
    requests: usize,

    /// Requests in flight at once
    #[arg(long, default_value = "16")]
    concurrency: usize,

    /// Probability that a backend call fails (0.0 - 1.0)
    #[arg(long, default_value = "0.2")]
    failure_rate: f64,

    /// Dependency (pool) to exercise; defaults to the first configured one
    #[arg(long)]
    dependency: Option<String>,
}

fn main() {
    let code = match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            e.downcast_ref::<GatewayError>()
                .map_or(EXIT_PARTIAL, GatewayError::exit_code)
        }
    };
    std::process::exit(code);
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Check { config, json } => check(&config, json),
        Commands::Simulate(args) => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to start async runtime")?;
            runtime.block_on(simulate(args, cli.verbose))
        }
    }
}

fn check(path: &Path, json: bool) -> anyhow::Result<()> {
    let config = GatewayConfig::from_file(path)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    println!("Configuration OK: {}", path.display());
    println!(
        "  rate limit: {} tokens burst, {} tokens/s refill",
        config.rate_limit.capacity, config.rate_limit.refill_per_second
    );
    if config.pools.is_empty() {
        println!("  no pools configured");
    }
    for (name, pool) in &config.pools {
        let retry = pool.retry_policy();
        println!(
            "  pool {}: size {}, acquire timeout {}ms, health check {:?}",
            name, pool.size, pool.acquire_timeout_ms, pool.health_check
        );
        println!(
            "    breaker: opens after {} failures, probes after {}ms",
            pool.breaker_threshold, pool.breaker_reset_timeout_ms
        );
        println!(
            "    retry: {} attempts, backoff {:?} x{} (max {:?})",
            retry.max_attempts, retry.base_delay, retry.multiplier, retry.max_delay
        );
    }
    Ok(())
}

/// Client handle for the simulated model backend
#[derive(Debug, Clone)]
struct SimulatedClient {
    id: u64,
}

impl SimulatedClient {
    async fn complete(&self, failure_rate: f64) -> Result<String, ResilienceError> {
        tokio::time::sleep(Duration::from_millis(rand::random_range(1..=20))).await;

        if rand::random_bool(failure_rate) {
            if rand::random_bool(0.2) {
                return Err(ResilienceError::Connection(format!(
                    "client {} lost its connection",
                    self.id
                )));
            }
            return Err(ResilienceError::Transient("backend overloaded".to_string()));
        }
        Ok(format!("completion from client {}", self.id))
    }
}

#[derive(Default)]
struct SimulatedFactory {
    next_id: AtomicU64,
}

#[async_trait::async_trait]
impl ResourceFactory<SimulatedClient> for SimulatedFactory {
    async fn create(&self) -> Result<SimulatedClient, ResilienceError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(SimulatedClient { id })
    }
}

async fn simulate(args: SimulateArgs, verbose: bool) -> anyhow::Result<()> {
    if !(0.0..=1.0).contains(&args.failure_rate) {
        anyhow::bail!("--failure-rate must be between 0.0 and 1.0");
    }
    if args.concurrency == 0 {
        anyhow::bail!("--concurrency must be at least 1");
    }

    let config = GatewayConfig::from_file(&args.config)?;
    logging::init_logging(&config.logging, verbose)?;

    let gateway = Arc::new(GatewayResilience::from_config(config)?);
    let dependency = match args.dependency {
        Some(name) => name,
        None => gateway
            .dependencies()
            .next()
            .map(str::to_string)
            .context("configuration defines no pools to simulate")?,
    };
    let pool = gateway
        .build_pool::<SimulatedClient>(&dependency, Arc::new(SimulatedFactory::default()))
        .await?;

    info!(
        dependency = %dependency,
        requests = args.requests,
        concurrency = args.concurrency,
        failure_rate = args.failure_rate,
        "starting simulation"
    );

    let in_flight = Arc::new(Semaphore::new(args.concurrency));
    let failure_rate = args.failure_rate;
    let mut tasks = JoinSet::new();

    for i in 0..args.requests {
        let permit = Arc::clone(&in_flight).acquire_owned().await?;
        let gateway = Arc::clone(&gateway);
        let pool = pool.clone();

        tasks.spawn(async move {
            let _permit = permit;
            let ctx = CallContext::with_timeout(Duration::from_secs(5));
            let tenant = format!("tenant-{}", i % SIMULATED_TENANTS);
            gateway
                .call(&ctx, &tenant, &pool, |client: SimulatedClient| async move {
                    client.complete(failure_rate).await
                })
                .await
        });
    }

    let mut outcomes: BTreeMap<&'static str, usize> = BTreeMap::new();
    while let Some(joined) = tasks.join_next().await {
        let label = match joined.context("simulated request panicked")? {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        *outcomes.entry(label).or_insert(0) += 1;
    }

    let stats = pool.stats();
    pool.close();

    println!("Simulation of '{}' finished", dependency);
    for (label, count) in &outcomes {
        println!("  {:<20} {}", label, count);
    }
    println!(
        "  pool: {} created, {} destroyed, breaker {}",
        stats.created,
        stats.destroyed,
        pool.breaker().state()
    );
    println!();
    print!("{}", gateway.metrics_text()?);

    Ok(())
}
