//! Main entry point for the collaboration server.
//!
//! Serves the WebSocket sync endpoint and the document HTTP API using the
//! Axum web framework. Configuration comes from `COLLAB_*` environment
//! variables, log filtering from `RUST_LOG`.

use collab_ot::server::{AppState, ServerConfig, create_router};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServerConfig::from_env();
    let addr = config.bind_addr;
    info!(?config, "starting collaboration server");

    let app = create_router(AppState::new(config));

    info!("Server listening on http://{}", addr);
    info!("Available endpoints:");
    info!("  GET  /health          - Health check");
    info!("  GET  /documents/:id   - Document snapshot");
    info!("  PUT  /documents/:id   - Seed a document");
    info!("  GET  /ws/:id          - WebSocket sync");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
