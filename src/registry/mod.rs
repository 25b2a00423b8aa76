// Model registry module
// Immutable table of supported models, their modality and capable providers

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use crate::error::GatewayError;
use crate::providers::ProviderName;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Chat,
    Embedding,
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Modality::Chat => f.write_str("chat"),
            Modality::Embedding => f.write_str("embedding"),
        }
    }
}

/// A provider capable of serving a model, with the provider-specific model id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderModel {
    pub provider: ProviderName,
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupportedModel {
    pub name: String,
    pub modality: Modality,
    #[serde(default)]
    pub created: i64,
    #[serde(default = "default_owner")]
    pub owned_by: String,
    /// Ordered by preference
    pub providers: Vec<ProviderModel>,
}

fn default_owner() -> String {
    "gateway".to_string()
}

impl SupportedModel {
    /// The provider used to serve this model.
    ///
    /// Always the first entry; there is no ranking between capable providers.
    pub fn primary_provider(&self) -> Option<ProviderName> {
        self.providers.first().map(|p| p.provider)
    }

    /// Look up the provider-specific model id
    pub fn model_id_for(&self, provider: ProviderName) -> Result<&str, GatewayError> {
        self.providers
            .iter()
            .find(|p| p.provider == provider)
            .map(|p| p.id.as_str())
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| GatewayError::MisconfiguredModel {
                model: self.name.clone(),
                provider,
            })
    }
}

/// Built-in models
/// Format: (name, modality, created, owned_by, [(provider, provider_model_id)])
static BUILTIN_MODELS: &[(&str, Modality, i64, &str, &[(ProviderName, &str)])] = &[
    // Chat models
    (
        "llama-3.1-8b-instant",
        Modality::Chat,
        1721692800,
        "meta",
        &[(ProviderName::Groq, "llama-3.1-8b-instant")],
    ),
    (
        "openai/gpt-oss-120b",
        Modality::Chat,
        1754352000,
        "openai",
        &[
            (ProviderName::Bedrock, "openai.gpt-oss-120b-1:0"),
            (ProviderName::Groq, "openai/gpt-oss-120b"),
        ],
    ),
    (
        "openai/gpt-oss-20b",
        Modality::Chat,
        1754352000,
        "openai",
        &[
            (ProviderName::Bedrock, "openai.gpt-oss-20b-1:0"),
            (ProviderName::Groq, "openai/gpt-oss-20b"),
        ],
    ),
    (
        "google/gemini-2.5-flash-preview-09-2025",
        Modality::Chat,
        1758672000,
        "google",
        &[(ProviderName::Vertex, "gemini-2.5-flash-preview-09-2025")],
    ),
    (
        "google/gemini-2.5-flash-lite-preview-09-2025",
        Modality::Chat,
        1758672000,
        "google",
        &[(ProviderName::Vertex, "gemini-2.5-flash-lite-preview-09-2025")],
    ),
    // Embedding models
    (
        "voyage-3-large",
        Modality::Embedding,
        1736208000,
        "voyage",
        &[(ProviderName::Voyage, "voyage-3-large")],
    ),
    (
        "cohere/embed-v4.0",
        Modality::Embedding,
        1744156800,
        "cohere",
        &[(ProviderName::Bedrock, "cohere.embed-v4:0")],
    ),
    (
        "google/text-embedding-005",
        Modality::Embedding,
        1731628800,
        "google",
        &[(ProviderName::Vertex, "text-embedding-005")],
    ),
];

/// Process-wide model table, loaded once at startup and shared by reference
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: Vec<SupportedModel>,
}

impl ModelRegistry {
    pub fn builtin() -> Self {
        let models = BUILTIN_MODELS
            .iter()
            .map(|(name, modality, created, owned_by, providers)| SupportedModel {
                name: name.to_string(),
                modality: *modality,
                created: *created,
                owned_by: owned_by.to_string(),
                providers: providers
                    .iter()
                    .map(|(provider, id)| ProviderModel {
                        provider: *provider,
                        id: id.to_string(),
                    })
                    .collect(),
            })
            .collect();
        let mut registry = Self { models };
        registry.models.sort_by(|a, b| a.name.cmp(&b.name));
        registry
    }

    pub fn from_models(mut models: Vec<SupportedModel>) -> Result<Self> {
        let mut seen = HashSet::new();
        for model in &models {
            if model.name.trim().is_empty() {
                bail!("model entry with empty name");
            }
            if !seen.insert(model.name.clone()) {
                bail!("duplicate model '{}'", model.name);
            }
            if model.providers.is_empty() {
                bail!("model '{}' has no providers", model.name);
            }
        }
        models.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Self { models })
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let models: Vec<SupportedModel> =
            serde_json::from_str(content).context("invalid supported models JSON")?;
        Self::from_models(models)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read models file {:?}", path))?;
        let registry = Self::from_json(&content)?;
        tracing::info!("Loaded {} models from {:?}", registry.models.len(), path);
        Ok(registry)
    }

    pub fn lookup(&self, name: &str) -> Option<&SupportedModel> {
        self.models
            .binary_search_by(|m| m.name.as_str().cmp(name))
            .ok()
            .map(|idx| &self.models[idx])
    }

    /// All model names in sorted order
    pub fn all_names(&self) -> Vec<&str> {
        self.models.iter().map(|m| m.name.as_str()).collect()
    }

    pub fn models(&self) -> &[SupportedModel] {
        &self.models
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_lookup() {
        let registry = ModelRegistry::builtin();
        let model = registry.lookup("voyage-3-large").unwrap();
        assert_eq!(model.modality, Modality::Embedding);
        assert_eq!(model.primary_provider(), Some(ProviderName::Voyage));

        let model = registry.lookup("llama-3.1-8b-instant").unwrap();
        assert_eq!(model.modality, Modality::Chat);

        assert!(registry.lookup("gpt-4o").is_none());
    }

    #[test]
    fn test_all_names_sorted() {
        let registry = ModelRegistry::builtin();
        let names = registry.all_names();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        assert_eq!(names.len(), BUILTIN_MODELS.len());
    }

    #[test]
    fn test_primary_provider_is_first_in_list() {
        let registry = ModelRegistry::builtin();
        let model = registry.lookup("openai/gpt-oss-120b").unwrap();
        assert_eq!(model.primary_provider(), Some(ProviderName::Bedrock));
        assert_eq!(
            model.model_id_for(ProviderName::Groq).unwrap(),
            "openai/gpt-oss-120b"
        );
    }

    #[test]
    fn test_model_id_for_absent_provider_is_misconfigured() {
        let registry = ModelRegistry::builtin();
        let model = registry.lookup("voyage-3-large").unwrap();
        let err = model.model_id_for(ProviderName::Groq).unwrap_err();
        assert!(matches!(err, GatewayError::MisconfiguredModel { .. }));
    }

    #[test]
    fn test_from_json() {
        let registry = ModelRegistry::from_json(
            r#"[
                {"name": "b-model", "modality": "chat", "providers": [{"provider": "groq", "id": "b"}]},
                {"name": "a-model", "modality": "embedding", "owned_by": "acme",
                 "providers": [{"provider": "voyage", "id": "a"}, {"provider": "bedrock"}]}
            ]"#,
        )
        .unwrap();
        assert_eq!(registry.all_names(), vec!["a-model", "b-model"]);
        let a = registry.lookup("a-model").unwrap();
        assert_eq!(a.owned_by, "acme");
        assert!(a.model_id_for(ProviderName::Bedrock).is_err());
        assert_eq!(registry.lookup("b-model").unwrap().owned_by, "gateway");
    }

    #[test]
    fn test_from_json_rejects_duplicates_and_empty_providers() {
        let dup = r#"[
            {"name": "m", "modality": "chat", "providers": [{"provider": "groq", "id": "m"}]},
            {"name": "m", "modality": "chat", "providers": [{"provider": "groq", "id": "m"}]}
        ]"#;
        assert!(ModelRegistry::from_json(dup).is_err());

        let empty = r#"[{"name": "m", "modality": "chat", "providers": []}]"#;
        assert!(ModelRegistry::from_json(empty).is_err());
    }
}
