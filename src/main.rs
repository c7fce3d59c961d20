//! Firewall helper - Entry point.
//!
//! Loads configuration, restores the saved blocklist and serves the GUI client
//! on the loopback command socket until interrupted.

use std::borrow::Cow;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use firewall_helper::auth::CodeSignAuthenticator;
use firewall_helper::blocklist::BlocklistStore;
use firewall_helper::config::Config;
use firewall_helper::process::SystemRunner;
use firewall_helper::server::CommandServer;

const DEFAULT_CONFIG_PATH: &str = "/etc/firewall-helper/config.toml";

fn load_config() -> Result<Config> {
    let config_path = std::env::var("CONFIG_PATH")
        .map(Cow::Owned)
        .unwrap_or(Cow::Borrowed(DEFAULT_CONFIG_PATH));
    let path = Path::new(config_path.as_ref());

    if path.exists() {
        info!(?path, "loading configuration");
        Config::load(path).context("Failed to load configuration")
    } else {
        warn!(?path, "no configuration file, using defaults");
        Ok(Config::default())
    }
}

async fn run() -> Result<()> {
    let config = load_config()?;

    // Initialize metrics (must be done early, before any metrics are recorded)
    firewall_helper::metrics::init(&config.metrics).context("Failed to initialize metrics")?;

    let blocklist =
        BlocklistStore::open(&config.blocklist.path).context("Failed to load blocklist")?;
    info!(items = blocklist.len(), path = ?blocklist.path(), "blocklist ready");

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;

    let runner = Arc::new(SystemRunner);
    let auth = CodeSignAuthenticator::new(
        Arc::clone(&runner),
        config.auth.clone(),
        config.timeouts.command(),
    );
    let mut server = CommandServer::new(config, auth, runner);

    info!("Starting firewall helper...");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Ctrl-C received, shutting down..."),
        () = server.run(listener) => error!("command server stopped unexpectedly"),
    }

    server.shutdown().await;
    if let Err(err) = blocklist.save() {
        error!("Failed to save blocklist: {err}");
    }

    info!("Shutdown complete.");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    run().await
}
