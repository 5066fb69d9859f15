//! nodescore_probe: serves /ping and /speedtest for the nodescore collector.

use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_PORT: u16 = 8080;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::args().any(|a| a == "-h" || a == "--help") {
        println!("Usage: nodescore_probe [--port PORT|-p PORT]");
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let port = nodescore_probe::parse_port(std::env::args(), DEFAULT_PORT);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(
        "probe endpoints at http://{}/ping and /speedtest ({} byte payload)",
        listener.local_addr()?,
        nodescore_probe::payload().len()
    );
    axum::serve(listener, nodescore_probe::router()).await?;
    Ok(())
}
