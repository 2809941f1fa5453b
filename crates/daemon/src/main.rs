//! `vmboxd`: guest control daemon entry point.

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vmbox_daemon::server::Daemon;

/// Port the hypervisor forwards into the guest unless overridden.
const DEFAULT_PORT: u16 = 8080;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let port = match std::env::var("VMD_PORT") {
        Ok(raw) => raw
            .parse::<u16>()
            .with_context(|| format!("VMD_PORT is not a port number: {raw:?}"))?,
        Err(_) => DEFAULT_PORT,
    };

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("bind 0.0.0.0:{port}"))?;
    info!(port, "vmboxd listening");

    Daemon::new().serve(listener).await
}
