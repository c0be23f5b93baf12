use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use zbridge::api::{self, AppState};
use zbridge::registry::ThingRegistry;
use zbridge::{adapter, config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,zbridge=debug")),
        )
        .init();

    tracing::info!("Starting zbridge v{}", env!("CARGO_PKG_VERSION"));

    let config_path = config::config_path();
    let config = config::load(Path::new(&config_path))?;

    let registry = Arc::new(ThingRegistry::new(4096));

    // One adapter per upstream bridge
    let handles: Vec<_> = config
        .adapters
        .iter()
        .map(|adapter_config| adapter::start(&config, adapter_config, registry.clone()))
        .collect();
    if handles.is_empty() {
        tracing::warn!("No adapters configured, serving the HTTP API only");
    }

    let app_state = Arc::new(AppState::new(registry, handles));
    let app = api::router(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
