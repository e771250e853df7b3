//! AstroBeam command line: share a file under a zodiac code, or fetch one.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use astrobeam_client::{
    start_receive, start_send, ConnectionStatus, SignalingClient, TransferConfig, TransferHandle,
    TransferOutcome, DEFAULT_ICE_SERVERS,
};
use astrobeam_common::file_transfer::save_received;
use astrobeam_common::helpers::format_bytes;
use astrobeam_common::identity::generate;
use astrobeam_common::CHUNK_SIZE;
use clap::{Parser, Subcommand};
use tracing::debug;

#[derive(Parser, Debug)]
#[command(name = "astrobeam")]
#[command(about = "Send files directly between two machines")]
struct Args {
    /// Signaling relay WebSocket URL
    #[arg(
        long,
        global = true,
        env = "ASTROBEAM_RELAY_URL",
        default_value = "ws://127.0.0.1:8080"
    )]
    relay: String,

    /// STUN server URL (repeatable, defaults to public Google STUN)
    #[arg(long = "ice-server", global = true, value_name = "URL")]
    ice_servers: Vec<String>,

    /// How often relayed signaling is checked
    #[arg(long, global = true, default_value_t = 1000)]
    poll_interval_ms: u64,

    /// Print the transfer history record as JSON when done
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Offer a file and print the code to share
    Send {
        /// File to send
        file: PathBuf,
    },

    /// Fetch a file using a code from the sender
    Receive {
        /// Session code, e.g. leo-a4b8
        code: String,

        /// Directory the file is written to
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },

    /// Draw a session code without starting a transfer
    Code,

    /// Show version information
    Version,
}

impl Args {
    fn transfer_config(&self) -> Result<TransferConfig> {
        if self.poll_interval_ms == 0 {
            bail!("--poll-interval-ms must be greater than zero");
        }
        let ice_servers = if self.ice_servers.is_empty() {
            DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect()
        } else {
            self.ice_servers.clone()
        };
        Ok(TransferConfig {
            ice_servers,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            chunk_size: CHUNK_SIZE,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    astrobeam_common::init_tracing_with_default("warn");

    let args = Args::parse();

    match &args.command {
        Command::Send { file } => send(&args, file).await,
        Command::Receive { code, output } => receive(&args, code, output).await,
        Command::Code => {
            let identity = generate();
            println!("{} {}", identity.sign.symbol, identity.session_id);
            println!("{}", identity.sign.random_horoscope());
            Ok(())
        }
        Command::Version => {
            println!("astrobeam {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn connect(args: &Args) -> Result<Arc<SignalingClient>> {
    let client = SignalingClient::connect(&args.relay)
        .await
        .with_context(|| format!("could not reach relay at {}", args.relay))?;
    Ok(Arc::new(client))
}

async fn send(args: &Args, file: &Path) -> Result<()> {
    let config = args.transfer_config()?;
    debug!("transfer config: {:?}", config);
    let signaling = connect(args).await?;

    let (identity, handle) = start_send(signaling.clone(), &config, file)
        .await
        .with_context(|| format!("could not start sending {}", file.display()))?;

    println!("Code:      {} {}", identity.sign.symbol, identity.session_id);
    println!("Sign:      {}", identity.sign.name);
    println!("Horoscope: {}", identity.sign.random_horoscope());
    println!("Waiting for the receiver...");

    let outcome = follow(handle).await?;
    signaling.close();
    finish(args, &outcome)?;
    println!("Sent {}", file.display());
    Ok(())
}

async fn receive(args: &Args, code: &str, output: &Path) -> Result<()> {
    let config = args.transfer_config()?;
    let signaling = connect(args).await?;

    let handle = start_receive(signaling.clone(), &config, code)
        .await
        .with_context(|| format!("could not join session {code}"))?;
    println!("Joined {}, waiting for the sender...", code.trim());

    let mut outcome = follow(handle).await?;
    signaling.close();
    finish(args, &outcome)?;

    let file = outcome
        .received
        .take()
        .context("transfer completed without a file")?;
    let path = save_received(output, &file.metadata, &file.data)
        .with_context(|| format!("could not save into {}", output.display()))?;
    println!(
        "Saved {} ({})",
        path.display(),
        format_bytes(file.metadata.size)
    );
    Ok(())
}

/// Print status changes until the transfer ends. Ctrl-C closes it.
async fn follow(mut handle: TransferHandle) -> Result<TransferOutcome> {
    let mut updates = handle.subscribe();
    let printer = tokio::spawn(async move {
        let mut last_status = ConnectionStatus::Idle;
        let mut last_percent = -1i64;
        while updates.changed().await.is_ok() {
            let snapshot = updates.borrow_and_update().clone();
            if snapshot.status != last_status {
                if last_status == ConnectionStatus::Transferring {
                    eprintln!();
                }
                eprintln!("{:?}", snapshot.status);
                last_status = snapshot.status;
            }
            let percent = snapshot.progress.floor() as i64;
            if snapshot.status == ConnectionStatus::Transferring && percent != last_percent {
                if let Some(metadata) = &snapshot.metadata {
                    eprint!(
                        "\r{:>3}%  {} of {}",
                        percent,
                        metadata.name,
                        format_bytes(metadata.size)
                    );
                }
                last_percent = percent;
            }
        }
    });

    let outcome = tokio::select! {
        outcome = handle.join() => outcome?,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Closing...");
            handle.close();
            handle.join().await?
        }
    };
    printer.abort();
    Ok(outcome)
}

fn finish(args: &Args, outcome: &TransferOutcome) -> Result<()> {
    if args.json {
        if let Some(record) = &outcome.record {
            println!("{}", serde_json::to_string(record)?);
        }
    }
    match outcome.snapshot.status {
        ConnectionStatus::Completed => Ok(()),
        ConnectionStatus::Failed => bail!(
            "transfer failed: {}",
            outcome
                .snapshot
                .error
                .as_deref()
                .unwrap_or("unknown error")
        ),
        status => bail!("transfer ended before completing ({status:?})"),
    }
}
