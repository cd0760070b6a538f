// Dispatch Throttle CLI - Main Entry Point
//
// throttlectl drives the per-agent throttle engine from the command line:
// - simulated multi-agent delivery runs
// - effective configuration dump
// - optional admin/metrics HTTP endpoint

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use dispatch_throttle::config::Config;
use dispatch_throttle::server;
use dispatch_throttle::throttle::{Metadata, Throttle, ThrottleError, ThrottleRegistry};
use serde_json::json;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::EnvFilter;

/// throttlectl: per-agent rate-limited dispatch
#[derive(Parser, Debug)]
#[command(name = "throttlectl")]
#[command(author = "Dispatch Throttle Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Pace outbound deliveries per agent against rate-limited APIs", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run simulated deliveries for several agents and print their status
    Simulate {
        /// Number of agents
        #[arg(long, default_value_t = 3)]
        agents: usize,

        /// Messages per agent
        #[arg(long, default_value_t = 5)]
        messages: usize,

        /// Minimum interval between sends of one agent
        #[arg(long, default_value_t = 100)]
        interval_ms: u64,

        /// Probability that a single attempt fails (0.0 - 1.0)
        #[arg(long, default_value_t = 0.0)]
        fail_rate: f64,

        /// Delay between attempts (defaults to the configured value)
        #[arg(long)]
        retry_delay_ms: Option<u64>,

        /// Queue messages or send them directly
        #[arg(long, value_enum, default_value_t = Mode::Enqueue)]
        mode: Mode,

        /// Serve the admin endpoint on this port until Ctrl-C
        #[arg(long)]
        admin_port: Option<u16>,
    },
    /// Print the effective configuration as TOML
    Config,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    Enqueue,
    Send,
}

type Delivery = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Outcome counts of one simulated agent
#[derive(Debug, Default)]
struct AgentTally {
    delivered: usize,
    failed: usize,
    rejected: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };

    init_tracing(&config, args.verbose)?;

    match args.command {
        Some(Commands::Simulate {
            agents,
            messages,
            interval_ms,
            fail_rate,
            retry_delay_ms,
            mode,
            admin_port,
        }) => {
            anyhow::ensure!(
                (0.0..=1.0).contains(&fail_rate),
                "--fail-rate must be between 0.0 and 1.0, got {}",
                fail_rate
            );
            let mut config = config;
            config.throttle.min_interval_ms = interval_ms;
            if let Some(delay) = retry_delay_ms {
                config.throttle.retry_delay_ms = delay;
            }
            config.validate()?;
            simulate(&config, agents, messages, fail_rate, mode, admin_port).await?;
        }
        Some(Commands::Config) => {
            let text =
                toml::to_string_pretty(&config).context("Failed to serialize configuration")?;
            println!("{}", text);
        }
        None => {
            info!("No command specified. Use \"throttlectl --help\" for usage.");
        }
    }

    Ok(())
}

/// Initialize tracing from the logging configuration
///
/// Logs go to stderr so stdout stays machine-readable.
fn init_tracing(config: &Config, verbose: bool) -> Result<()> {
    let level = if verbose {
        Level::DEBUG
    } else {
        config.log_level()?
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match config.logging.format.to_lowercase().as_str() {
        "json" => builder.json().init(),
        "pretty" => builder.pretty().init(),
        _ => builder.compact().init(),
    }
    Ok(())
}

/// Drive simulated deliveries through a registry
async fn simulate(
    config: &Config,
    agents: usize,
    messages: usize,
    fail_rate: f64,
    mode: Mode,
    admin_port: Option<u16>,
) -> Result<()> {
    let registry = ThrottleRegistry::from_config(config);

    if let Some(port) = admin_port {
        let registry = registry.clone();
        tokio::spawn(async move {
            if let Err(e) = server::start_admin_server(registry, port).await {
                warn!("Admin server stopped: {:#}", e);
            }
        });
    }

    info!(
        "Simulating {} agents x {} messages ({:?} mode, interval {} ms, fail rate {})",
        agents, messages, mode, config.throttle.min_interval_ms, fail_rate
    );

    let mut set = JoinSet::new();
    for n in 0..agents {
        let agent_id = format!("agent-{}", n + 1);
        let throttle = registry.get(&agent_id, None).await?;
        set.spawn(run_agent(throttle, messages, fail_rate, mode));
    }

    while let Some(joined) = set.join_next().await {
        let (agent_id, tally) = joined.context("Simulated agent panicked")?;
        info!(
            "Agent {} finished: {} delivered, {} failed, {} rejected",
            agent_id, tally.delivered, tally.failed, tally.rejected
        );
    }

    let overview = registry.overview().await;
    println!(
        "{}",
        serde_json::to_string_pretty(&overview).context("Failed to serialize status")?
    );

    if let Some(port) = admin_port {
        info!("Admin endpoint on port {}; press Ctrl-C to exit", port);
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
    }

    registry.shutdown().await;
    Ok(())
}

async fn run_agent(
    throttle: Throttle,
    messages: usize,
    fail_rate: f64,
    mode: Mode,
) -> (String, AgentTally) {
    let mut tally = AgentTally::default();

    match mode {
        Mode::Send => {
            for _ in 0..messages {
                match throttle.send(simulated_delivery(fail_rate)).await {
                    Ok(()) => tally.delivered += 1,
                    Err(e) => {
                        debug!("Agent {} send failed: {}", throttle.agent_id(), e);
                        tally.failed += 1;
                    }
                }
            }
        }
        Mode::Enqueue => {
            let mut completions = Vec::with_capacity(messages);
            for seq in 0..messages {
                let mut metadata = Metadata::new();
                metadata.insert("seq".to_string(), json!(seq));
                match throttle.enqueue(simulated_delivery(fail_rate), metadata) {
                    Ok(completion) => completions.push(completion),
                    Err(ThrottleError::QueueFull { capacity, .. }) => {
                        warn!(
                            "Agent {} queue full ({} items), dropping message {}",
                            throttle.agent_id(),
                            capacity,
                            seq
                        );
                        tally.rejected += 1;
                    }
                    Err(e) => {
                        warn!("Agent {} enqueue failed: {}", throttle.agent_id(), e);
                        tally.rejected += 1;
                    }
                }
            }
            for completion in completions {
                match completion.await {
                    Ok(()) => tally.delivered += 1,
                    Err(e) => {
                        debug!("Agent {} delivery failed: {}", throttle.agent_id(), e);
                        tally.failed += 1;
                    }
                }
            }
        }
    }

    (throttle.agent_id().to_string(), tally)
}

/// A delivery with random latency that fails with probability `fail_rate`
///
/// Every attempt rolls again, so retries can recover.
fn simulated_delivery(fail_rate: f64) -> impl FnMut() -> Delivery + Send + 'static {
    move || -> Delivery {
        let fail = fastrand::f64() < fail_rate;
        let latency = Duration::from_millis(fastrand::u64(1..=10));
        Box::pin(async move {
            tokio::time::sleep(latency).await;
            if fail {
                anyhow::bail!("simulated delivery failure");
            }
            Ok(())
        })
    }
}
