//! Vigil Server
//!
//! Real-time video anomaly detection service: WebRTC frame ingestion, the
//! detect/track/classify pipeline, per-user alert WebSockets and anomaly
//! persistence.

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vigil_server::config::ServerConfig;
use vigil_server::lifecycle;

#[derive(Parser, Debug)]
#[command(name = "vigil-server")]
#[command(about = "Real-time video anomaly detection service")]
#[command(version)]
struct Args {
    /// Bind host, overrides SERVER_HOST
    #[arg(long)]
    host: Option<String>,

    /// Bind port, overrides SERVER_PORT
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting vigil");

    let mut config = ServerConfig::from_env();
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    lifecycle::run(config).await
}
