use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use veriface_models::ModelRegistry;

mod config;
mod server;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("verifaced starting");

    let config = config::Config::from_env();

    let registry = match ModelRegistry::load(
        &config.card_model_path(),
        &config.face_model_path(),
        &config.embedding_model_path(),
    ) {
        Ok(registry) => Some(Arc::new(registry)),
        Err(err) => {
            tracing::warn!(error = %err, "model loading failed; serving in unavailable mode");
            None
        }
    };

    let state = server::AppState {
        registry,
        session_config: config.session.clone(),
    };

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "verifaced ready");

    axum::serve(listener, server::router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("verifaced shutting down");
        })
        .await?;

    Ok(())
}
