//! Hub server entry point.

use clap::Parser;
use framehub::{HubState, MemoryBackend, Settings};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "framehub",
    about = "Append-only streaming hub for binary frame sequences"
)]
struct Args {
    /// Address to bind the HTTP server to.
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Frame time-to-live in seconds.
    #[arg(long)]
    ttl: Option<u64>,

    /// Maximum append payload size in bytes.
    #[arg(long)]
    max_payload_size: Option<usize>,
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut settings = Settings::from_env();
    if let Some(bind) = args.bind {
        settings = settings.bind(bind);
    }
    if let Some(ttl) = args.ttl {
        settings = settings.ttl(Duration::from_secs(ttl));
    }
    if let Some(size) = args.max_payload_size {
        settings = settings.max_payload_size(size);
    }

    let state = HubState::new(Arc::new(MemoryBackend::new()), Arc::new(settings));
    framehub::serve(state, shutdown_signal()).await
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(%err, "failed to install shutdown handler");
    }
}
