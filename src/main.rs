use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use floodgate::config::FloodgateConfig;
use floodgate::ratelimit::RateLimiter;

/// Replay a burst of requests for one key and print each decision.
#[derive(Debug, Parser)]
#[command(name = "floodgate", version, about)]
struct Args {
    /// YAML configuration file; defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Rate key to check
    #[arg(short, long, default_value = "demo")]
    key: String,

    /// Number of requests to replay
    #[arg(short = 'n', long, default_value_t = 10)]
    requests: u32,

    /// Pause between requests, in milliseconds
    #[arg(long, default_value_t = 0)]
    interval_ms: u64,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }

    info!("Starting Floodgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = match &args.config {
        Some(path) => FloodgateConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => FloodgateConfig::default(),
    };
    info!(
        algorithm = ?config.limiter.algorithm,
        store = ?config.store,
        "Configuration loaded"
    );

    let limiter = RateLimiter::builder(config.limiter.clone())
        .key_resolver(|key: &String| key.clone())
        .store_config(config.store.clone())
        .build()
        .await
        .context("building rate limiter")?;

    tokio::select! {
        result = replay(&limiter, &args) => result?,
        _ = shutdown_signal() => {
            info!("Received shutdown signal, stopping replay");
        }
    }

    limiter.shutdown().await?;
    info!("Floodgate stopped");
    Ok(())
}

async fn replay(limiter: &RateLimiter<String>, args: &Args) -> anyhow::Result<()> {
    let mut admitted = 0u32;
    for i in 0..args.requests {
        if i > 0 && args.interval_ms > 0 {
            tokio::time::sleep(Duration::from_millis(args.interval_ms)).await;
        }
        let admission = limiter.check(&args.key).await?;
        if admission.decision.admitted {
            admitted += 1;
        }
        println!("{}", serde_json::to_string(&admission.decision)?);
    }

    info!(
        key = %args.key,
        requests = args.requests,
        admitted,
        rejected = args.requests - admitted,
        "Replay finished"
    );
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
