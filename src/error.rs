// Gateway error taxonomy and OpenAI-compatible error envelopes

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

use crate::providers::ProviderName;
use crate::registry::Modality;
use crate::store::StoreError;

pub type Result<T, E = GatewayError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Identity verification failed before reaching a handler
    #[error("{message}")]
    Auth { status: StatusCode, message: String },

    #[error("{message}")]
    BadRequest { message: String, code: &'static str },

    /// Request body failed schema validation
    #[error("{0}")]
    Validation(String),

    #[error("{message}")]
    ModelNotFound { message: String, code: &'static str },

    #[error("Model '{model}' is a {actual} model, not a {requested} model")]
    ModelMismatch {
        model: String,
        actual: Modality,
        requested: Modality,
    },

    /// The registry names a provider for a model but holds no usable id for it
    #[error("Model '{model}' is not configured for provider '{provider}'")]
    MisconfiguredModel { model: String, provider: ProviderName },

    #[error("No credentials configured for provider '{0}'")]
    MissingCredentials(ProviderName),

    /// Raw HTTP failure surfaced by an upstream provider
    #[error("Upstream error ({status}): {body}")]
    Upstream { status: StatusCode, body: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        GatewayError::Internal(anyhow::Error::new(e).context("upstream request failed"))
    }
}

impl GatewayError {
    pub fn bad_request(message: impl Into<String>, code: &'static str) -> Self {
        GatewayError::BadRequest {
            message: message.into(),
            code,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        GatewayError::Validation(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        GatewayError::Internal(anyhow::anyhow!(message.into()))
    }

    /// Consume a non-success upstream response into an `Upstream` error
    pub async fn from_upstream(response: reqwest::Response) -> Self {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        GatewayError::Upstream { status, body }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Auth { status, .. } => *status,
            GatewayError::BadRequest { .. } | GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::ModelNotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::ModelMismatch { .. } => StatusCode::BAD_REQUEST,
            GatewayError::Upstream { status, .. } => *status,
            GatewayError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            GatewayError::Store(StoreError::Conflict(_)) => StatusCode::CONFLICT,
            GatewayError::MisconfiguredModel { .. }
            | GatewayError::MissingCredentials(_)
            | GatewayError::Store(_)
            | GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

fn oai_error(status: StatusCode, message: String, kind: &str, code: Option<&str>) -> Response {
    let mut error = json!({
        "message": message,
        "type": kind,
    });
    if let Some(code) = code {
        error["code"] = json!(code);
    }
    (status, Json(json!({ "error": error }))).into_response()
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            GatewayError::Auth { message, .. } => {
                let code = if status == StatusCode::UNAUTHORIZED {
                    "invalid_api_key"
                } else {
                    "invalid_request"
                };
                oai_error(status, message, "invalid_request_error", Some(code))
            }
            GatewayError::BadRequest { message, code } => {
                oai_error(status, message, "invalid_request_error", Some(code))
            }
            GatewayError::Validation(message) => {
                oai_error(status, message, "invalid_request_error", Some("validation_error"))
            }
            GatewayError::ModelNotFound { message, code } => {
                oai_error(status, message, "invalid_request_error", Some(code))
            }
            e @ GatewayError::ModelMismatch { .. } => {
                oai_error(status, e.to_string(), "invalid_request_error", Some("model_mismatch"))
            }
            GatewayError::Upstream { status, body } => {
                if status.is_server_error() {
                    tracing::error!("Upstream provider failed with {}: {}", status, body);
                }
                if let Ok(parsed) = serde_json::from_str::<Value>(&body) {
                    return (status, Json(parsed)).into_response();
                }
                let message = if body.is_empty() {
                    format!("Upstream error ({})", status.as_u16())
                } else {
                    body
                };
                let kind = if status.is_server_error() {
                    "server_error"
                } else {
                    "invalid_request_error"
                };
                oai_error(status, message, kind, None)
            }
            GatewayError::Store(StoreError::NotFound(what)) => oai_error(
                status,
                format!("Resource not found: {}", what),
                "invalid_request_error",
                Some("not_found"),
            ),
            GatewayError::Store(StoreError::Conflict(what)) => oai_error(
                status,
                format!("Conflict: {}", what),
                "invalid_request_error",
                Some("conflict"),
            ),
            e @ GatewayError::MisconfiguredModel { .. } => {
                tracing::error!("Model registry inconsistency: {}", e);
                oai_error(status, e.to_string(), "server_error", Some("model_misconfigured"))
            }
            e @ GatewayError::MissingCredentials(_) => {
                tracing::error!("{}", e);
                oai_error(status, e.to_string(), "server_error", Some("internal"))
            }
            GatewayError::Store(e) => {
                tracing::error!("Store error: {}", e);
                oai_error(status, e.to_string(), "server_error", Some("internal"))
            }
            GatewayError::Internal(e) => {
                tracing::error!("Internal error: {:#}", e);
                oai_error(status, format!("{:#}", e), "server_error", Some("internal"))
            }
        }
    }
}
