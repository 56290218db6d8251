use std::path::PathBuf;

use clap::Parser;
use fastchat_core::{DEFAULT_BIND_ADDRESS, default_history_path};
use fastchat_relay::{Relay, RelayConfig};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "fastchat-relay")]
struct RelayArgs {
    #[arg(long, default_value = DEFAULT_BIND_ADDRESS)]
    bind_address: String,
    /// History file; defaults to fastchat.json in the system temp dir.
    #[arg(long)]
    history_path: Option<PathBuf>,
    /// Keep history in memory only.
    #[arg(long, conflicts_with = "history_path")]
    memory_only: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = RelayArgs::parse();
    let history_path = if args.memory_only {
        None
    } else {
        Some(args.history_path.unwrap_or_else(default_history_path))
    };

    let relay = Relay::new(RelayConfig {
        bind_address: args.bind_address,
        history_path,
        ..RelayConfig::default()
    });

    match relay.start().await {
        Ok(address) => info!("relay ready, connect clients to ws://{address}"),
        Err(err) => {
            error!("{err}");
            std::process::exit(1);
        }
    }

    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c, running until killed: {err}");
        std::future::pending::<()>().await;
    }

    info!("relay stopping");
    relay.stop().await;
}
