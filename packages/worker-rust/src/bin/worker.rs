//! Worker process entry point.
//!
//! Owns only process setup -- logging, argument parsing, the shutdown
//! signal. The stock binary runs the passthrough transform; real
//! deployments embed [`pixelmill_worker::Worker`] with their own.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use pixelmill_core::traits::PassthroughTransform;
use pixelmill_worker::{Worker, WorkerConfig};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

/// Pixelmill worker node.
#[derive(Parser, Debug)]
#[command(name = "pixelmill-worker", version, about)]
struct Args {
    /// Coordinator's worker ingress address.
    #[arg(long, env = "PIXELMILL_COORDINATOR", default_value = "127.0.0.1:7401")]
    coordinator: String,

    /// Delay between reconnect attempts, in milliseconds.
    #[arg(long, env = "PIXELMILL_RECONNECT_DELAY_MS", default_value_t = 5000)]
    reconnect_delay_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let worker = Worker::new(
        WorkerConfig {
            coordinator_addr: args.coordinator,
            reconnect_delay: Duration::from_millis(args.reconnect_delay_ms),
        },
        Arc::new(PassthroughTransform),
    );

    let (stop, shutdown) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
        let _ = stop.send(true);
    });

    worker.run(shutdown).await
}
