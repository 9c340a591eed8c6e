use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use bucketgate::config::{GateConfig, ENV_PREFIX};
use bucketgate::ratelimit::{LimiterSettings, RateLimiter};
use bucketgate::simulate::{self, FakeServer};

/// Client-side rate limit enforcement toolkit.
#[derive(Debug, Parser)]
#[command(name = "bucketgate", version, about)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load and validate a configuration file
    CheckConfig {
        /// Path to the configuration file
        path: String,
    },
    /// Drive concurrent requests through the limiter against a fake endpoint
    Simulate {
        /// Path to a configuration file
        #[arg(long)]
        config: Option<String>,
        /// Comma separated bucket keys
        #[arg(long, value_delimiter = ',')]
        keys: Option<Vec<String>>,
        /// Total requests to send
        #[arg(long)]
        requests: Option<usize>,
        /// Concurrent senders
        #[arg(long)]
        concurrency: Option<usize>,
        /// Requests the fake endpoint allows per key and window
        #[arg(long)]
        quota: Option<i64>,
        /// Fake endpoint window in milliseconds
        #[arg(long)]
        window_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::CheckConfig { path } => check_config(&path),
        Command::Simulate {
            config,
            keys,
            requests,
            concurrency,
            quota,
            window_ms,
        } => {
            let mut config = GateConfig::load(config.as_deref(), ENV_PREFIX)?;
            let simulation = &mut config.simulation;
            if let Some(keys) = keys {
                simulation.keys = keys;
            }
            if let Some(requests) = requests {
                simulation.requests = requests;
            }
            if let Some(concurrency) = concurrency {
                simulation.concurrency = concurrency;
            }
            if let Some(quota) = quota {
                simulation.server_quota = quota;
            }
            if let Some(window_ms) = window_ms {
                simulation.window_ms = window_ms;
            }
            config.validate()?;
            run_simulation(config).await
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }
}

fn check_config(path: &str) -> anyhow::Result<()> {
    let config = GateConfig::load(Some(path), ENV_PREFIX)?;
    info!(
        path,
        custom_rate_limits = config.limiter.custom_rate_limits.len(),
        "Configuration is valid"
    );
    println!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}

async fn run_simulation(config: GateConfig) -> anyhow::Result<()> {
    let limiter = Arc::new(RateLimiter::with_settings(LimiterSettings::from(
        &config.limiter,
    )));
    info!(
        custom_rate_limits = limiter.custom_rate_limits().len(),
        "Rate limiter initialized"
    );

    let server = Arc::new(FakeServer::new(
        config.simulation.server_quota,
        Duration::from_millis(config.simulation.window_ms),
    ));

    tokio::spawn(simulate::log_events(limiter.subscribe()));

    tokio::select! {
        report = simulate::run(limiter, server, &config.simulation) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        _ = shutdown_signal() => {
            info!("Simulation interrupted");
        }
    }

    Ok(())
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
            info!("Received Ctrl+C, stopping");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping");
        }
    }
}
