// Configuration store: branch model lists and custom provider credentials

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::providers::{ProviderConfig, ProviderName};

pub mod http;
pub mod memory;

pub use http::HttpStore;
pub use memory::MemoryStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    Conflict(String),

    #[error("store backend failed: {0}")]
    Backend(String),
}

/// A model the branch owner has enabled, addressed by alias
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchModelConfig {
    pub alias: String,
    /// Registry model name
    #[serde(rename = "type")]
    pub model_type: String,
    /// Use the owner's stored credentials instead of the gateway defaults
    #[serde(default, alias = "custom-provider")]
    pub custom_provider: bool,
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get_branch_models(
        &self,
        agent_slug: &str,
        branch_slug: &str,
    ) -> Result<Vec<BranchModelConfig>, StoreError>;

    /// Unredacted credentials; never hand the result to a client
    async fn get_provider_config(&self, name: ProviderName) -> Result<ProviderConfig, StoreError>;
}

/// Pick the store backend: the remote store API when configured, else the static config
pub fn from_config(config: &crate::config::StoreConfig, http: reqwest::Client) -> Arc<dyn ConfigStore> {
    match &config.api_base_url {
        Some(base_url) if !base_url.trim().is_empty() => {
            tracing::info!("Using remote config store at {}", base_url);
            Arc::new(HttpStore::new(http, base_url.clone(), config.api_token.clone()))
        }
        _ => {
            tracing::info!(
                "Using static config store ({} branches, {} providers)",
                config.branches.len(),
                config.providers.len()
            );
            Arc::new(MemoryStore::from_config(config))
        }
    }
}
