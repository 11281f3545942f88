//! qapilot - HTTP Server Entry Point
//!
//! Starts the HTTP server that exposes the orchestrator API.

use qapilot::{api, config::Config};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "qapilot=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    info!(
        "Loaded configuration: workspace={}, store={:?}, model={}",
        config.workspace_path.display(),
        config.execution_store,
        config.default_model
    );
    if config.api_key.is_none() {
        info!("OPENROUTER_API_KEY not set; agents that call the AI will fail fast");
    }

    api::serve(config).await?;

    Ok(())
}
