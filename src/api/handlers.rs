// API request handlers

use axum::{
    body::Bytes,
    extract::{Path, State},
    response::{IntoResponse, Response},
    Json,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use super::streaming::text_stream;
use super::AppState;
use crate::error::{GatewayError, Result};
use crate::openai::{
    ChatCompletionRequest, EmbeddingRequest, EmbeddingResponse, ModelInfo, ModelsResponse,
};
use crate::registry::{Modality, SupportedModel};
use crate::translator::{self, ChatOutcome};

/// Root endpoint
pub async fn root() -> Json<Value> {
    Json(json!({
        "message": "Model Gateway API",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": [
            "GET /v1/models",
            "GET /v1/models/{id}",
            "POST /v1/chat/completions",
            "POST /v1/embeddings"
        ]
    }))
}

/// Decode a JSON body; malformed or mistyped bodies are validation errors
fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T> {
    serde_json::from_slice(body)
        .map_err(|e| GatewayError::validation(format!("Invalid request body: {}", e)))
}

fn model_info(model: &SupportedModel) -> ModelInfo {
    ModelInfo {
        id: model.name.clone(),
        object: "model".to_string(),
        created: model.created,
        owned_by: model.owned_by.clone(),
    }
}

/// List supported models
pub async fn list_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        object: "list".to_string(),
        data: state.registry.models().iter().map(model_info).collect(),
    })
}

/// Describe one registry entry; ids may contain `/`
pub async fn get_model(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ModelInfo>> {
    let id = id.trim_start_matches('/');
    state
        .registry
        .lookup(id)
        .map(|model| Json(model_info(model)))
        .ok_or_else(|| GatewayError::ModelNotFound {
            message: format!("The model '{}' does not exist", id),
            code: "not_found",
        })
}

/// Chat completions (OpenAI compatible)
pub async fn chat_completions(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response> {
    let request: ChatCompletionRequest = parse_body(&body)?;
    request.validate()?;
    let params = translator::to_chat_params(&request)?;

    let resolved = state.resolver.resolve(&request.model, Modality::Chat).await?;
    tracing::info!(
        "Chat request for {} -> {} via {} (stream: {})",
        request.model,
        resolved.model_type,
        resolved.provider_name,
        request.stream
    );

    let model = state.providers.chat_model(&resolved).await?;
    let outcome =
        translator::chat_completion(model.as_ref(), &request.model, &params, request.stream).await?;

    Ok(match outcome {
        ChatOutcome::Completion(response) => Json(response).into_response(),
        ChatOutcome::Stream(tokens) => text_stream(tokens),
    })
}

/// Embeddings (OpenAI compatible)
pub async fn embeddings(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<EmbeddingResponse>> {
    let request: EmbeddingRequest = parse_body(&body)?;
    request.validate()?;

    let resolved = state
        .resolver
        .resolve(&request.model, Modality::Embedding)
        .await?;
    tracing::info!(
        "Embedding request for {} -> {} via {}",
        request.model,
        resolved.model_type,
        resolved.provider_name
    );

    let model = state.providers.embedding_model(&resolved).await?;
    let response = translator::embedding(model.as_ref(), &request.model, &request.input).await?;
    Ok(Json(response))
}
