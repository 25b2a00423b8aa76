// HTTP API server module

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::State,
    http::{header, Method, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

mod handlers;
pub mod streaming;

use crate::aws::AwsCredentialsProvider;
use crate::config::AppConfig;
use crate::error::GatewayError;
use crate::providers::ProviderFactory;
use crate::registry::ModelRegistry;
use crate::resolver::ModelResolver;
use crate::store::ConfigStore;

/// Shared server state, built once at startup
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub registry: Arc<ModelRegistry>,
    pub resolver: Arc<ModelResolver>,
    pub providers: Arc<ProviderFactory>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        registry: ModelRegistry,
        store: Arc<dyn ConfigStore>,
        http: reqwest::Client,
    ) -> Self {
        let registry = Arc::new(registry);
        let aws = Arc::new(AwsCredentialsProvider::from_env(http.clone(), config.is_remote));
        let providers = ProviderFactory::new(http, registry.clone(), config.providers.clone(), aws);
        Self::from_parts(config, registry, store, providers)
    }

    pub fn from_parts(
        config: AppConfig,
        registry: Arc<ModelRegistry>,
        store: Arc<dyn ConfigStore>,
        providers: ProviderFactory,
    ) -> Self {
        Self {
            config: Arc::new(config),
            resolver: Arc::new(ModelResolver::new(registry.clone(), store)),
            registry,
            providers: Arc::new(providers),
        }
    }
}

/// API key authentication middleware
async fn auth_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    // No keys configured means authentication is disabled
    if state.config.api_keys.is_empty() {
        return next.run(request).await;
    }

    let provided_key = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .map(|h| h.strip_prefix("Bearer ").unwrap_or(h).trim());

    match provided_key {
        Some(key) if state.config.api_keys.iter().any(|k| k == key) => next.run(request).await,
        _ => {
            tracing::warn!("Rejected request to {} with invalid API key", request.uri().path());
            GatewayError::Auth {
                status: StatusCode::UNAUTHORIZED,
                message: "Invalid API key".to_string(),
            }
            .into_response()
        }
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    let protected_routes = Router::new()
        .route("/v1/models", get(handlers::list_models))
        .route("/v1/models/*id", get(handlers::get_model))
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/embeddings", post(handlers::embeddings))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    let public_routes = Router::new().route("/", get(handlers::root));

    Router::new()
        .merge(protected_routes)
        .merge(public_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve until `shutdown` resolves
pub async fn start_server<F>(state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    tracing::info!("Model gateway listening on http://{}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error")?;

    tracing::info!("Model gateway stopped");
    Ok(())
}
