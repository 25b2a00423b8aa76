// Voyage AI embeddings

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{ApiKeyProviderConfig, EmbeddingModel, Embeddings};
use crate::error::{GatewayError, Result};

const VOYAGE_BASE_URL: &str = "https://api.voyageai.com";

pub struct VoyageEmbeddingModel {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model_id: String,
}

#[derive(Debug, Deserialize)]
struct VoyageResponse {
    data: Vec<VoyageEmbedding>,
    #[serde(default)]
    usage: Option<VoyageUsage>,
}

#[derive(Debug, Deserialize)]
struct VoyageEmbedding {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

#[derive(Debug, Deserialize)]
struct VoyageUsage {
    total_tokens: Option<u64>,
}

impl VoyageEmbeddingModel {
    pub fn new(http: reqwest::Client, config: ApiKeyProviderConfig, model_id: String) -> Self {
        let base_url = config
            .base_url
            .unwrap_or_else(|| VOYAGE_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        Self {
            http,
            api_key: config.api_key,
            base_url,
            model_id,
        }
    }
}

#[async_trait]
impl EmbeddingModel for VoyageEmbeddingModel {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn embed_many(&self, values: &[String]) -> Result<Embeddings> {
        let url = format!("{}/v1/embeddings", self.base_url);
        tracing::debug!("Voyage embedding request: {} inputs to {}", values.len(), self.model_id);

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "input": values,
                "model": self.model_id,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(GatewayError::from_upstream(response).await);
        }

        let mut body: VoyageResponse = response.json().await?;
        if body.data.len() != values.len() {
            return Err(GatewayError::internal(format!(
                "Voyage returned {} embeddings for {} inputs",
                body.data.len(),
                values.len()
            )));
        }
        body.data.sort_by_key(|e| e.index);

        Ok(Embeddings {
            vectors: body.data.into_iter().map(|e| e.embedding).collect(),
            tokens: body.usage.and_then(|u| u.total_tokens),
        })
    }
}
