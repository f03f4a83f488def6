//! H.323 gatekeeper daemon

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use h323_gatekeeper_core::{
    GatekeeperConfig, GatekeeperEvent, GatekeeperServer, LoggingConfig, parse_log_level, setup_logging,
};
use h323_ras_core::AuthenticatorChain;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "h323-gatekeeper")]
#[command(about = "H.323 RAS gatekeeper")]
pub struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Unicast RAS listener, overrides the configuration file
    #[arg(short, long)]
    pub bind: Option<SocketAddr>,

    /// Gatekeeper identifier, overrides the configuration file
    #[arg(short, long)]
    pub identifier: Option<String>,

    /// Enable the multicast discovery listener
    #[arg(long)]
    pub discovery: bool,

    /// Log level
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Log as JSON
    #[arg(long)]
    pub json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut logging = LoggingConfig::new(parse_log_level(&args.log_level)?, "h323-gatekeeper");
    if args.json {
        logging = logging.with_json();
    }
    setup_logging(logging)?;

    let mut config = match &args.config {
        Some(path) => GatekeeperConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => GatekeeperConfig::default(),
    };
    if let Some(bind) = args.bind {
        config = config.with_ras_address(bind);
    }
    if let Some(identifier) = args.identifier {
        config.identifier = identifier;
    }
    if args.discovery {
        config.discovery.enabled = true;
    }

    let server = GatekeeperServer::start(config, AuthenticatorChain::new())
        .await
        .context("starting gatekeeper")?;
    info!("Gatekeeper {} ready on {}", server.config().identifier, server.local_addr());

    let mut events = server.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(GatekeeperEvent::EndpointRegistered { endpoint_identifier, aliases, .. }) => {
                    info!("Registered {} as {:?}", endpoint_identifier, aliases);
                }
                Ok(GatekeeperEvent::EndpointUnregistered { endpoint_identifier, cause }) => {
                    info!("Unregistered {}: {:?}", endpoint_identifier, cause);
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Event listener lagged, {} events missed", missed);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    info!("Interrupted, shutting down");
    server.shutdown().await?;
    Ok(())
}
