use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use courier_server::config::CourierConfig;
use courier_server::server;

#[derive(Debug, Parser)]
#[command(name = "courier-server", version, about = "One-to-one messaging relay")]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(long, short)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = CourierConfig::load(args.config.as_deref())?;

    info!(version = env!("CARGO_PKG_VERSION"), "courier server starting");
    server::start(config).await
}
