// Configuration module for the model gateway

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::providers::{
    ApiKeyProviderConfig, AwsProviderConfig, GoogleProviderConfig, ProviderConfig, ProviderDefaults,
};
use crate::store::BranchModelConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AppConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Client API keys; empty disables authentication
    #[serde(default)]
    pub api_keys: Vec<String>,

    #[serde(default)]
    pub debug: bool,

    /// Deployed in a container with a task role (enables the AWS metadata credential source)
    #[serde(default)]
    pub is_remote: bool,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// JSON file replacing the built-in model registry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub models_file: Option<String>,

    #[serde(default)]
    pub providers: ProviderDefaults,

    #[serde(default)]
    pub store: StoreConfig,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3002
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_keys: Vec::new(),
            debug: false,
            is_remote: false,
            connect_timeout_secs: default_connect_timeout(),
            models_file: None,
            providers: ProviderDefaults::default(),
            store: StoreConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StoreConfig {
    /// Base URL of the configuration API; when unset the inline entries below are used
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,
    #[serde(default)]
    pub branches: Vec<BranchEntry>,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BranchEntry {
    pub agent: String,
    pub branch: String,
    #[serde(default)]
    pub models: Vec<BranchModelConfig>,
}

impl AppConfig {
    /// Overlay settings taken from the environment
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(port) = var("GATEWAY_PORT").and_then(|p| p.parse().ok()) {
            self.port = port;
        }
        if let Some(remote) = var("IS_REMOTE") {
            self.is_remote = matches!(remote.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }

        if let Some(api_key) = var("GROQ_API_KEY") {
            let base_url = self.providers.groq.take().and_then(|c| c.base_url);
            self.providers.groq = Some(ApiKeyProviderConfig { api_key, base_url });
        }
        if let Some(api_key) = var("VOYAGE_API_KEY") {
            let base_url = self.providers.voyage.take().and_then(|c| c.base_url);
            self.providers.voyage = Some(ApiKeyProviderConfig { api_key, base_url });
        }

        if let Some(region) = var("BEDROCK_REGION") {
            let bedrock = self.providers.bedrock.get_or_insert_with(|| AwsProviderConfig {
                region: region.clone(),
                bedrock_role_arn: None,
                access_key_id: None,
                secret_access_key: None,
                session_token: None,
                base_url: None,
            });
            bedrock.region = region;
        }
        if let (Some(role_arn), Some(bedrock)) = (var("BEDROCK_ROLE_ARN"), self.providers.bedrock.as_mut()) {
            bedrock.bedrock_role_arn = Some(role_arn);
        }

        let vertex = (
            var("VERTEX_SERVICE_ACCOUNT_EMAIL"),
            var("VERTEX_AUDIENCE"),
            var("VERTEX_LOCATION"),
            var("VERTEX_PROJECT"),
        );
        if let (Some(service_account_email), Some(audience), Some(location), Some(project)) = vertex {
            let base_url = self.providers.vertex.take().and_then(|c| c.base_url);
            self.providers.vertex = Some(GoogleProviderConfig {
                service_account_email,
                audience,
                location,
                project,
                base_url,
            });
        }
    }

    pub fn models_path(&self) -> Option<PathBuf> {
        self.models_file.as_deref().map(expand_home)
    }
}

/// `$GATEWAY_CONFIG`, else `<config dir>/model-gateway/config.yaml`
pub fn config_path() -> Result<PathBuf> {
    if let Some(path) = std::env::var_os("GATEWAY_CONFIG").filter(|p| !p.is_empty()) {
        return Ok(PathBuf::from(path));
    }
    let config_dir = dirs::config_dir().ok_or_else(|| anyhow!("Failed to get config dir"))?;
    Ok(config_dir.join("model-gateway").join("config.yaml"))
}

/// Read the config file, writing the defaults first when it does not exist
pub fn load_or_create(path: &Path) -> Result<AppConfig> {
    if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {:?}", path))?;
        return serde_yaml::from_str(&content).with_context(|| format!("Invalid config {:?}", path));
    }

    let default_config = AppConfig::default();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serde_yaml::to_string(&default_config)?;
    std::fs::write(path, content)?;
    Ok(default_config)
}

/// Load the process configuration once at startup
pub fn load_config() -> Result<(AppConfig, PathBuf)> {
    let path = config_path()?;
    let mut config = load_or_create(&path)?;
    config.apply_env_overrides(|key| std::env::var(key).ok());
    Ok((config, path))
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config: AppConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.port, 3002);
        assert!(config.api_keys.is_empty());
    }

    #[test]
    fn test_parse_yaml() {
        let config: AppConfig = serde_yaml::from_str(
            r#"
port: 8080
api-keys: ["sk-local"]
debug: true
providers:
  groq:
    api-key: gsk-default
  bedrock:
    region: us-west-2
    bedrock-role-arn: arn:aws:iam::123456789012:role/GatewayBedrock
store:
  branches:
    - agent: acme
      branch: main
      models:
        - alias: fast
          type: llama-3.1-8b-instant
        - alias: mine
          type: voyage-3-large
          custom-provider: true
  providers:
    - name: voyage
      config:
        api-key: pa-owner
"#,
        )
        .unwrap();

        assert_eq!(config.port, 8080);
        assert_eq!(config.providers.groq.as_ref().unwrap().api_key, "gsk-default");
        assert_eq!(
            config.providers.bedrock.as_ref().unwrap().bedrock_role_arn.as_deref(),
            Some("arn:aws:iam::123456789012:role/GatewayBedrock")
        );
        assert_eq!(config.store.branches[0].models.len(), 2);
        assert!(config.store.branches[0].models[1].custom_provider);
        assert_eq!(config.store.providers[0].name(), crate::providers::ProviderName::Voyage);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = AppConfig::default();
        config.apply_env_overrides(env(&[
            ("GATEWAY_PORT", "9000"),
            ("IS_REMOTE", "true"),
            ("GROQ_API_KEY", "gsk-env"),
            ("BEDROCK_REGION", "eu-central-1"),
            ("BEDROCK_ROLE_ARN", "arn:aws:iam::123456789012:role/GatewayBedrock"),
            ("VERTEX_PROJECT", "proj"),
            ("VERTEX_LOCATION", "us-central1"),
        ]));

        assert_eq!(config.port, 9000);
        assert!(config.is_remote);
        assert_eq!(config.providers.groq.unwrap().api_key, "gsk-env");
        let bedrock = config.providers.bedrock.unwrap();
        assert_eq!(bedrock.region, "eu-central-1");
        assert_eq!(
            bedrock.bedrock_role_arn.as_deref(),
            Some("arn:aws:iam::123456789012:role/GatewayBedrock")
        );
        // Incomplete Vertex settings are ignored
        assert!(config.providers.vertex.is_none());
    }

    #[test]
    fn test_load_or_create_writes_defaults() {
        let dir = std::env::temp_dir().join(format!("model-gateway-test-{}", uuid::Uuid::new_v4()));
        let path = dir.join("config.yaml");

        let created = load_or_create(&path).unwrap();
        assert!(path.exists());
        let reloaded = load_or_create(&path).unwrap();
        assert_eq!(created, reloaded);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
