//! corbel - GIOP/IIOP broker
//!
//! A TCP broker speaking the GIOP wire protocol, serving object requests
//! through a pluggable adapter.

use bytes::Bytes;
use corbel_server::{CallContext, Config, MapAdapter, Servant, ServantReply, Server};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Built-in diagnostic servant registered under the key "echo". Returns the
/// request payload unchanged; useful for probing a deployment with any GIOP
/// client before real servants are wired in.
struct EchoServant;

impl Servant for EchoServant {
    fn invoke(&self, _operation: &str, payload: Bytes, _ctx: &CallContext) -> ServantReply {
        ServantReply::Normal(payload)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if CORBEL_CONFIG is set, then env overrides)
    let config = match Config::load() {
        Ok(c) => {
            if let Ok(path) = std::env::var("CORBEL_CONFIG") {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // If a config file was explicitly specified, fail on error
            if std::env::var("CORBEL_CONFIG").is_ok() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            // Otherwise fall back to defaults
            tracing::info!("Using default configuration");
            Config::default()
        }
    };

    tracing::info!("Starting corbel broker");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Max connections: {}", config.network.max_connections);
    tracing::info!("  Workers: {}", config.transport.worker_count);

    let adapter = MapAdapter::new();
    adapter.register(&b"echo"[..], Arc::new(EchoServant));

    let handle = Server::new(config, Arc::new(adapter)).start().await?;
    tracing::info!("Broker listening on {}", handle.local_addr());

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    handle.shutdown().await;

    Ok(())
}
