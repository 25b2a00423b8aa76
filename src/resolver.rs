// Model resolver module
// Maps `agent/branch/alias` references to the provider that will serve them

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{GatewayError, Result};
use crate::providers::{ProviderConfig, ProviderName};
use crate::registry::{Modality, ModelRegistry};
use crate::store::ConfigStore;

/// A parsed `agentSlug/branchSlug/modelAlias` reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelReference {
    pub agent_slug: String,
    pub branch_slug: String,
    pub model_alias: String,
}

impl FromStr for ModelReference {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        let segments: Vec<&str> = s.split('/').collect();
        match segments.as_slice() {
            [agent, branch, alias] if !agent.is_empty() && !branch.is_empty() && !alias.is_empty() => {
                Ok(Self {
                    agent_slug: agent.to_string(),
                    branch_slug: branch.to_string(),
                    model_alias: alias.to_string(),
                })
            }
            _ => Err(GatewayError::bad_request(
                format!(
                    "Invalid model format: '{}'. Expected 'agentSlug/branchSlug/modelAlias'",
                    s
                ),
                "invalid_model",
            )),
        }
    }
}

impl fmt::Display for ModelReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.agent_slug, self.branch_slug, self.model_alias)
    }
}

/// Result of model resolution
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedProvider {
    pub provider_name: ProviderName,
    /// Branch-owner credentials; `None` means the gateway defaults apply
    pub provider_config: Option<ProviderConfig>,
    /// Registry model name
    pub model_type: String,
}

pub struct ModelResolver {
    registry: Arc<ModelRegistry>,
    store: Arc<dyn ConfigStore>,
}

impl ModelResolver {
    pub fn new(registry: Arc<ModelRegistry>, store: Arc<dyn ConfigStore>) -> Self {
        Self { registry, store }
    }

    /// Resolve a model reference for the given modality.
    ///
    /// Reads only; resolving the same reference twice against unchanged
    /// configuration yields the same provider.
    pub async fn resolve(&self, reference: &str, modality: Modality) -> Result<ResolvedProvider> {
        let reference: ModelReference = reference.parse()?;

        let branch_models = self
            .store
            .get_branch_models(&reference.agent_slug, &reference.branch_slug)
            .await?;
        let entry = branch_models
            .iter()
            .find(|m| m.alias == reference.model_alias)
            .ok_or_else(|| GatewayError::ModelNotFound {
                message: format!(
                    "Model alias '{}' not found in branch '{}/{}'",
                    reference.model_alias, reference.agent_slug, reference.branch_slug
                ),
                code: "not_found",
            })?;

        let model = self.registry.lookup(&entry.model_type).ok_or_else(|| {
            GatewayError::ModelNotFound {
                message: format!("Model type '{}' is not supported", entry.model_type),
                code: "model_unsupported",
            }
        })?;

        if model.modality != modality {
            return Err(GatewayError::ModelMismatch {
                model: model.name.clone(),
                actual: model.modality,
                requested: modality,
            });
        }

        let provider_name = model.primary_provider().ok_or_else(|| GatewayError::internal(
            format!("model '{}' has no providers", model.name),
        ))?;

        let provider_config = if entry.custom_provider {
            let config = self.store.get_provider_config(provider_name).await?;
            if config.name() != provider_name {
                return Err(GatewayError::MisconfiguredModel {
                    model: model.name.clone(),
                    provider: provider_name,
                });
            }
            Some(config)
        } else {
            None
        };

        tracing::debug!(
            "Resolved {} to {} via {}{}",
            reference,
            model.name,
            provider_name,
            if provider_config.is_some() { " (custom credentials)" } else { "" }
        );

        Ok(ResolvedProvider {
            provider_name,
            provider_config,
            model_type: model.name.clone(),
        })
    }
}
