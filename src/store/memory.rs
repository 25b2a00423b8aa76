// Static in-process store, populated from the config file

use async_trait::async_trait;
use std::collections::HashMap;

use super::{BranchModelConfig, ConfigStore, StoreError};
use crate::config::StoreConfig;
use crate::providers::{ProviderConfig, ProviderName};

#[derive(Debug, Default)]
pub struct MemoryStore {
    branches: HashMap<(String, String), Vec<BranchModelConfig>>,
    providers: HashMap<ProviderName, ProviderConfig>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        let mut store = Self::new();
        for branch in &config.branches {
            store = store.with_branch(&branch.agent, &branch.branch, branch.models.clone());
        }
        for provider in &config.providers {
            if store.providers.contains_key(&provider.name()) {
                tracing::warn!("Duplicate provider config for {}, keeping the last one", provider.name());
            }
            store = store.with_provider(provider.clone());
        }
        store
    }

    pub fn with_branch(mut self, agent: &str, branch: &str, models: Vec<BranchModelConfig>) -> Self {
        self.branches
            .insert((agent.to_string(), branch.to_string()), models);
        self
    }

    pub fn with_provider(mut self, config: ProviderConfig) -> Self {
        self.providers.insert(config.name(), config);
        self
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn get_branch_models(
        &self,
        agent_slug: &str,
        branch_slug: &str,
    ) -> Result<Vec<BranchModelConfig>, StoreError> {
        self.branches
            .get(&(agent_slug.to_string(), branch_slug.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("branch {}/{}", agent_slug, branch_slug)))
    }

    async fn get_provider_config(&self, name: ProviderName) -> Result<ProviderConfig, StoreError> {
        self.providers
            .get(&name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("provider {}", name)))
    }
}
