//! sheetpilotd, the sheetpilot background service.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sheetpilot_broker::{BridgeConfig, BridgeDriverFactory};
use sheetpilot_daemon::{serve, DaemonConfig};

#[derive(Parser)]
#[command(name = "sheetpilotd")]
#[command(author, version, about = "sheetpilot session daemon")]
struct Args {
    /// Unix socket to listen on (default: $SHEETPILOT_SOCKET or a per-user path)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Close sessions idle longer than this many seconds
    #[arg(long)]
    idle_timeout_secs: Option<u64>,

    /// How often the idle sweep runs, in seconds
    #[arg(long)]
    sweep_interval_secs: Option<u64>,

    /// Default per-operation timeout in seconds (unbounded when omitted)
    #[arg(long)]
    op_timeout_secs: Option<u64>,

    /// Path to the automation bridge executable
    #[arg(long)]
    bridge_exe: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = DaemonConfig::from_env();
    if let Some(socket) = args.socket {
        config.socket_path = socket;
    }
    if let Some(secs) = args.idle_timeout_secs {
        config.idle_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = args.sweep_interval_secs {
        config.sweep_interval = Duration::from_secs(secs);
    }
    if let Some(secs) = args.op_timeout_secs {
        config.default_op_timeout = Some(Duration::from_secs(secs));
    }

    let factory = Arc::new(BridgeDriverFactory::new(BridgeConfig {
        bridge_exe: args.bridge_exe,
    }));

    let socket = config.socket_path.clone();
    serve(config, factory)
        .await
        .with_context(|| format!("daemon failed on socket {}", socket.display()))
}
