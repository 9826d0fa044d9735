use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use global_limiter::config::ConfigOverrides;
use global_limiter::store::WindowEntry;
use global_limiter::{GlobalLimiter, LimiterConfig};

/// Inspect and use a Redis-backed global rate limiter.
#[derive(Debug, Parser)]
#[command(name = "global-limiter", version, about)]
struct Cli {
    /// Configuration file layered over the default locations
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Redis connection URL
    #[arg(long, global = true)]
    redis_url: Option<String>,

    /// Name of the limited resource
    #[arg(long, global = true)]
    key: Option<String>,

    /// Maximum permits per time period
    #[arg(long, global = true)]
    max_rate: Option<u64>,

    /// Sliding window length in seconds
    #[arg(long, global = true)]
    time_period: Option<f64>,

    /// Store key namespace
    #[arg(long, global = true)]
    prefix: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Block until permits are granted
    Acquire {
        #[arg(long, default_value_t = 1)]
        amount: u64,

        /// Give up after this many seconds
        #[arg(long, value_parser = parse_timeout)]
        timeout: Option<Duration>,
    },
    /// Show the entries currently stored for the limiter
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Remove entries that have left the window
    Leak,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let overrides = ConfigOverrides {
        redis_url: cli.redis_url.clone(),
        key: cli.key.clone(),
        max_rate: cli.max_rate,
        time_period_secs: cli.time_period,
        prefix: cli.prefix.clone(),
    };
    let config = LimiterConfig::load(cli.config.as_deref(), &overrides)
        .context("failed to load limiter configuration")?;
    info!(
        key = %config.identity()?.store_key(),
        redis_url = %config.redis_url,
        "Configuration loaded"
    );

    let limiter = GlobalLimiter::connect(&config).await?;

    match cli.command {
        Command::Acquire { amount, timeout } => {
            limiter
                .acquire_until(amount, timeout, shutdown_signal())
                .await?;
            info!(amount = amount, "Permits acquired");
            println!("acquired {}", amount);
        }
        Command::Status { json } => print_status(&limiter, json).await?,
        Command::Leak => {
            let removed = limiter.leak().await?;
            println!("removed {}", removed);
        }
    }

    Ok(())
}

fn parse_timeout(value: &str) -> Result<Duration, String> {
    let secs: f64 = value
        .parse()
        .map_err(|e| format!("invalid number of seconds: {}", e))?;
    Duration::try_from_secs_f64(secs)
        .map_err(|_| format!("timeout must be a non-negative number of seconds, got {}", value))
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn print_status(limiter: &GlobalLimiter, json: bool) -> anyhow::Result<()> {
    let count = limiter.count().await?;
    let newest = limiter.peek(0).await?;
    let oldest = match count {
        0 => None,
        n => limiter.peek(n as usize - 1).await?,
    };
    let identity = limiter.core().identity();

    if json {
        let status = serde_json::json!({
            "store_key": identity.store_key(),
            "max_rate": identity.max_rate(),
            "time_period_secs": identity.time_period().as_secs_f64(),
            "count": count,
            "oldest": oldest.as_ref().map(entry_json),
            "newest": newest.as_ref().map(entry_json),
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("key:     {}", identity.store_key());
        println!("entries: {} / {}", count, identity.max_rate());
        if let Some(entry) = &oldest {
            println!("oldest:  {} ({})", format_timestamp(entry.timestamp_millis), entry.member);
        }
        if let Some(entry) = &newest {
            println!("newest:  {} ({})", format_timestamp(entry.timestamp_millis), entry.member);
        }
    }

    Ok(())
}

fn entry_json(entry: &WindowEntry) -> serde_json::Value {
    serde_json::json!({
        "member": entry.member,
        "timestamp_millis": entry.timestamp_millis,
        "timestamp": format_timestamp(entry.timestamp_millis),
    })
}

fn format_timestamp(millis: u64) -> String {
    chrono::DateTime::from_timestamp_millis(millis as i64)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| millis.to_string())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, abandoning wait");
        }
        _ = terminate => {
            info!("Received SIGTERM, abandoning wait");
        }
    }
}
