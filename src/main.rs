//! channel-echo: a TCP channel server with a loopback self-test
//!
//! The server:
//! - Assigns every accepted connection an increasing channel id
//! - Runs connect/close hooks for each channel
//! - Decodes length-prefixed text messages and routes each to a handler
//!
//! On startup it connects to itself, sends a few framed messages, closes
//! the connection and shuts down. Pass `--no-client` to serve until Ctrl-C.

mod channel;
mod client;
mod codec;
mod config;
mod error;
mod hooks;
mod router;
mod server;

use codec::VariableLengthCodec;
use config::Config;
use hooks::LoggingHooks;
use router::EchoRouter;
use server::Server;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        max_connections = config.max_connections,
        max_frame_size = config.max_frame_size,
        self_test = config.client.enabled,
        "Starting channel-echo server"
    );

    let server = Server::builder(config.clone())
        .hooks(LoggingHooks)
        .router(EchoRouter::default())
        .build()
        .bind()?;

    if config.client.enabled {
        let target = client::loopback_target(server.local_addr());
        let codec = VariableLengthCodec::with_max_frame_size(config.max_frame_size);

        match client::run_self_test(target, &config.client, codec).await {
            Ok(sent) => info!(sent, "Self-test finished"),
            Err(e) => error!(error = %e, "Self-test failed"),
        }
    } else {
        tokio::signal::ctrl_c().await?;
    }

    server.shutdown().await;
    Ok(())
}
