use anyhow::Result;
use clap::Parser;
use node::{Config, Node};
use std::path::PathBuf;
use tracing::*;

#[derive(Debug, Parser)]
#[command(
    name = "mochi",
    version,
    about = "Mochi federated application server",
    after_help = "For one-off log verbosity override, start with the environment variable \
        RUST_LOG set to \u{201c}debug\u{201d} or \u{201c}messaging=debug,info\u{201d}."
)]
struct Opts {
    /// Path to the INI configuration file (default /etc/mochi.conf).
    #[arg(long, env = "MOCHI_CONFIG")]
    config: Option<PathBuf>,

    /// Override directories.data from the configuration.
    #[arg(long, env = "MOCHI_DATA")]
    data_dir: Option<PathBuf>,

    /// Override p2p.port from the configuration.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() {
    util::setup_logger();
    if let Err(err) = run().await {
        error!("{:#}", err);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let opts = Opts::parse();
    let mut config = Config::load(opts.config.as_deref())?;
    if let Some(data_dir) = opts.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(port) = opts.port {
        config.port = port;
    }

    let node = Node::start(config).await?;

    wait_for_shutdown_signal().await?;
    info!("shutting down");
    node.shutdown().await;
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;
    Ok(())
}
