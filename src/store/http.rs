// Remote store backed by the platform's configuration API

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use super::{BranchModelConfig, ConfigStore, StoreError};
use crate::providers::{ProviderConfig, ProviderName};

pub struct HttpStore {
    http: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BranchResponse {
    #[serde(default)]
    models: Vec<BranchModelConfig>,
}

impl HttpStore {
    pub fn new(http: reqwest::Client, base_url: String, api_token: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        what: &str,
    ) -> Result<T, StoreError> {
        let mut request = self.http.get(url);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| StoreError::Backend(format!("request for {} failed: {}", what, e)))?;

        match response.status() {
            status if status.is_success() => response
                .json::<T>()
                .await
                .map_err(|e| StoreError::Backend(format!("invalid {} response: {}", what, e))),
            StatusCode::NOT_FOUND => Err(StoreError::NotFound(what.to_string())),
            StatusCode::CONFLICT => Err(StoreError::Conflict(what.to_string())),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(StoreError::Backend(format!("{} returned {}: {}", what, status, body)))
            }
        }
    }
}

#[async_trait]
impl ConfigStore for HttpStore {
    async fn get_branch_models(
        &self,
        agent_slug: &str,
        branch_slug: &str,
    ) -> Result<Vec<BranchModelConfig>, StoreError> {
        let url = format!(
            "{}/v1/agents/{}/branches/{}",
            self.base_url,
            urlencoding::encode(agent_slug),
            urlencoding::encode(branch_slug)
        );
        let branch: BranchResponse = self
            .get_json(&url, &format!("branch {}/{}", agent_slug, branch_slug))
            .await?;
        Ok(branch.models)
    }

    async fn get_provider_config(&self, name: ProviderName) -> Result<ProviderConfig, StoreError> {
        let url = format!("{}/v1/providers/{}?unredacted=true", self.base_url, name);
        let config: ProviderConfig = self.get_json(&url, &format!("provider {}", name)).await?;
        if config.name() != name {
            return Err(StoreError::Backend(format!(
                "requested provider {} but store returned {}",
                name,
                config.name()
            )));
        }
        Ok(config)
    }
}
