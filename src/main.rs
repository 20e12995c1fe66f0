//! emberlink - TCP front end for a real-time multiplayer game server
//!
//! Loads the server configuration, installs the lobby handlers and serves
//! until Ctrl-C.

mod config;
mod lobby;

use anyhow::{Context, Result};
use clap::Parser;
use config::{ServerConfig, DEFAULT_CONFIG_PATH};
use emberlink_core::ServerMode;
use emberlink_server::Server;
use lobby::{LobbyModule, SessionLog};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Game server network front end", long_about = None)]
struct Args {
    /// Server configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// Listen address, overriding the config file
    #[arg(long)]
    bind: Option<SocketAddr>,
    /// Server mode (auth or game), overriding the config file
    #[arg(long)]
    mode: Option<ServerMode>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let loaded = ServerConfig::read(&args.config);
    let mut config = loaded.as_ref().cloned().unwrap_or_default();

    // RUST_LOG wins over the configured default directive.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_filter)),
        )
        .init();

    info!("Starting emberlink v{}", env!("CARGO_PKG_VERSION"));
    if let Err(err) = &loaded {
        warn!("{err:#}. Using defaults");
    }
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if let Some(mode) = args.mode {
        config.mode = mode;
    }

    let mut builder = Server::builder(config.to_net_config()).with_hooks(Arc::new(SessionLog));
    builder
        .install(&LobbyModule)
        .context("Failed to register lobby packets")?;
    let server = builder.build().context("Failed to build packet registry")?;

    let listener = Server::bind(config.bind).await?;
    let accept = {
        let server = server.clone();
        tokio::spawn(async move { server.run(listener).await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Ctrl-C received");
    server.shutdown();
    accept.await.context("Accept loop panicked")??;
    Ok(())
}
