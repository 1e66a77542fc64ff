mod configuration;
mod error;
mod routes;
mod state;

use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use warble::agent::Agent;
use warble::capabilities::Toolbox;
use warble::providers::factory;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warble=info,warble_server=info")),
        )
        .init();

    // Load configuration
    let settings = configuration::Settings::new()?;

    let provider_type = settings.provider.provider_type();
    let provider = factory::get_provider(settings.provider.into_config())?;
    let store = settings.store.build()?;
    let toolbox = Toolbox::from_config(&settings.tools)?;

    let agent = Agent::new(provider, store, toolbox)
        .with_enabled(settings.tools.enabled.clone())
        .with_config(settings.agent);
    let state = state::AppState::new(agent);

    // Create router with CORS support
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = routes::configure(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(settings.server.socket_addr()?).await?;
    tracing::info!(provider = %provider_type, "listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
}
