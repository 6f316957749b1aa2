//! Chat relay - Entry Point
//!
//! Loads configuration, starts the MessageRouter actor and accepts
//! WebSocket connections until Ctrl-C.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use chat_relay::{handle_connection, MemoryHistoryStore, MemoryIdentityStore, MessageRouter, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=chat_relay=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chat_relay=info")),
        )
        .init();

    let config = ServerConfig::from_env()?;
    info!(
        "Configuration: ack timeout {:?}, duplicate login {:?}, default room '{}'",
        config.ack_timeout, config.duplicate_login, config.default_room
    );

    let listener = TcpListener::bind(&config.addr).await?;
    info!("WebSocket chat relay listening on {}", config.addr);

    let (router, cmd_tx) = MessageRouter::new(
        config,
        Arc::new(MemoryHistoryStore::new()),
        Arc::new(MemoryIdentityStore::new()),
    );
    tokio::spawn(router.run());

    info!("MessageRouter actor started");

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    info!("New connection from {}", addr);
                    let cmd_tx = cmd_tx.clone();

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, cmd_tx).await {
                            error!("Connection handler error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
        }
    }

    Ok(())
}
