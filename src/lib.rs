// Model Gateway - OpenAI-compatible front for agent branch models

pub mod api;
pub mod aws;
pub mod config;
pub mod error;
pub mod openai;
pub mod providers;
pub mod registry;
pub mod resolver;
pub mod store;
pub mod translator;

use anyhow::{Context, Result};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::registry::ModelRegistry;

pub async fn run() -> Result<()> {
    let (app_config, config_path) = config::load_config()?;

    // RUST_LOG wins over the config's debug flag
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if app_config.debug {
            EnvFilter::new("model_gateway=debug,tower_http=debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();

    tracing::info!("Loaded config from {:?}", config_path);

    let registry = match app_config.models_path() {
        Some(path) => ModelRegistry::load(&path)?,
        None => ModelRegistry::builtin(),
    };
    tracing::info!("Model registry ready ({} models)", registry.models().len());

    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(app_config.connect_timeout_secs))
        .build()
        .context("Failed to build HTTP client")?;

    let store = store::from_config(&app_config.store, http.clone());
    let state = api::AppState::new(app_config, registry, store, http);

    api::start_server(state, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
        }
        tracing::info!("Shutdown signal received");
    })
    .await
}
