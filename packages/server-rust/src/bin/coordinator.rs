//! Coordinator process entry point.
//!
//! Owns only process setup -- logging, argument parsing, the shutdown
//! signal. Everything else lives in the library.

use clap::Parser;
use pixelmill_server::{Coordinator, CoordinatorConfig};
use tracing_subscriber::EnvFilter;

/// Pixelmill coordinator: fans image jobs out to a pool of workers.
#[derive(Parser, Debug)]
#[command(name = "pixelmill-coordinator", version, about)]
struct Args {
    /// Address both TCP listeners and the UDP socket bind to.
    #[arg(long, env = "PIXELMILL_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Worker ingress port.
    #[arg(long, env = "PIXELMILL_WORKER_PORT", default_value_t = 7401)]
    worker_port: u16,

    /// Client ingress port.
    #[arg(long, env = "PIXELMILL_CLIENT_PORT", default_value_t = 7402)]
    client_port: u16,

    /// UDP port progress datagrams are addressed to on each client's host.
    #[arg(long, env = "PIXELMILL_PROGRESS_PORT", default_value_t = 7403)]
    progress_port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = CoordinatorConfig {
        host: args.host,
        worker_port: args.worker_port,
        client_port: args.client_port,
        client_progress_port: args.progress_port,
        ..CoordinatorConfig::default()
    };

    let mut coordinator = Coordinator::new(config);
    coordinator.start().await?;

    coordinator
        .serve(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
}
