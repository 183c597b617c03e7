// Room signaling server
// Hands out room codes and relays offers, answers and candidates between two peers
//
// Usage: cargo run --bin signaling-server [BIND_ADDR]

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;

use racelink::config;
use racelink::signaling_server::{serve, ServerState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let server_config = config::load_config()
        .map(|config| config.server)
        .unwrap_or_default();
    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| server_config.bind_addr.clone());

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("🚀 Room TTL {}s", server_config.room_ttl_secs);

    serve(listener, ServerState::new(server_config.room_ttl())).await?;
    Ok(())
}
