#![forbid(unsafe_code)]

use std::net::SocketAddr;

use anyhow::Result;
use astrobeam_relay::{RelayState, DEFAULT_MAX_MESSAGE_BYTES};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "astrobeam-relay")]
#[command(about = "AstroBeam signaling relay - pairs peers by session code")]
struct Args {
    /// TCP listen address for WebSocket signaling
    #[arg(long, env = "ASTROBEAM_RELAY_LISTEN", default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Largest accepted WebSocket message, in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_MESSAGE_BYTES)]
    max_message_bytes: usize,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, default_value = "info")]
    log_level: String,
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {}", err);
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    astrobeam_common::init_tracing_with_default(&args.log_level);

    if args.max_message_bytes == 0 {
        anyhow::bail!("--max-message-bytes must be non-zero");
    }

    let listener = TcpListener::bind(args.listen).await?;
    info!("signaling relay listening on ws://{}", listener.local_addr()?);

    astrobeam_relay::serve(
        listener,
        RelayState::new(args.max_message_bytes),
        shutdown_signal(),
    )
    .await
}
