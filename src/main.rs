use std::net::SocketAddr;
use std::sync::Arc;

use imagegate::config::GatewayConfig;
use imagegate::storage::MemoryObjectStore;
use imagegate::{router, GatewayHooks};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing for observability
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "imagegate=debug".into()),
        )
        .init();

    tracing::info!("Starting imagegate server");

    let config = match std::env::var("IMAGEGATE_CONFIG") {
        Ok(path) => {
            let raw = std::fs::read_to_string(&path)?;
            GatewayConfig::from_json_str(&raw).map_err(std::io::Error::other)?
        }
        Err(_) => {
            let mut config = GatewayConfig::default();
            config.storage.r2.enabled = true;
            config.validate()?;
            config
        }
    };

    // Without platform hooks the gateway runs against the in-process
    // reference store and passthrough transformer.
    let hooks = GatewayHooks {
        object_store: Some(Arc::new(MemoryObjectStore::new())),
        ..GatewayHooks::default()
    };

    let app = router(config, hooks);

    // Read port from environment or default to 8080
    let port = std::env::var("PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse::<u16>()
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Server listening on {}", addr);
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app).await?;
    Ok(())
}
