// Provider adapters: upstream credentials, clients and the model seams used by the translator

use async_trait::async_trait;
use base64::Engine;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use crate::aws::sts::RoleAssumer;
use crate::aws::{AwsCredentials, AwsCredentialsProvider};
use crate::error::{GatewayError, Result};
use crate::registry::ModelRegistry;
use crate::resolver::ResolvedProvider;

pub mod bedrock;
pub mod google_auth;
pub mod groq;
pub mod sse;
pub mod vertex;
pub mod voyage;

use google_auth::GoogleTokenSource;

const MASK: &str = "***";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderName {
    Groq,
    Voyage,
    Bedrock,
    Vertex,
}

impl ProviderName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderName::Groq => "groq",
            ProviderName::Voyage => "voyage",
            ProviderName::Bedrock => "bedrock",
            ProviderName::Vertex => "vertex",
        }
    }
}

impl fmt::Display for ProviderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Credentials for providers authenticated by a single API key (Groq, Voyage)
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyProviderConfig {
    #[serde(alias = "api-key")]
    pub api_key: String,
    #[serde(default, rename = "baseURL", alias = "base-url", alias = "baseUrl", skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl ApiKeyProviderConfig {
    pub fn redacted(&self) -> Self {
        Self {
            api_key: MASK.to_string(),
            base_url: self.base_url.clone(),
        }
    }
}

impl fmt::Debug for ApiKeyProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKeyProviderConfig")
            .field("api_key", &MASK)
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// AWS access for Bedrock: a role to assume, static keys, or both (the keys
/// then sign the AssumeRole call). The gateway's own defaults may leave every
/// credential unset to use the process-level credential chain.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwsProviderConfig {
    pub region: String,
    #[serde(default, alias = "bedrock-role-arn", skip_serializing_if = "Option::is_none")]
    pub bedrock_role_arn: Option<String>,
    #[serde(default, alias = "access-key-id", skip_serializing_if = "Option::is_none")]
    pub access_key_id: Option<String>,
    #[serde(default, alias = "secret-access-key", skip_serializing_if = "Option::is_none")]
    pub secret_access_key: Option<String>,
    #[serde(default, alias = "session-token", skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    #[serde(default, rename = "baseURL", alias = "base-url", alias = "baseUrl", skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl AwsProviderConfig {
    pub fn redacted(&self) -> Self {
        Self {
            secret_access_key: self.secret_access_key.as_ref().map(|_| MASK.to_string()),
            session_token: self.session_token.as_ref().map(|_| MASK.to_string()),
            ..self.clone()
        }
    }

    pub fn role_arn(&self) -> Option<&str> {
        self.bedrock_role_arn.as_deref().filter(|arn| !arn.is_empty())
    }

    /// Explicit credentials, when both key halves are configured
    pub fn static_credentials(&self) -> Option<AwsCredentials> {
        match (&self.access_key_id, &self.secret_access_key) {
            (Some(id), Some(secret)) if !id.is_empty() && !secret.is_empty() => Some(AwsCredentials {
                access_key_id: id.clone(),
                secret_access_key: secret.clone(),
                session_token: self.session_token.clone(),
                expiration: None,
            }),
            _ => None,
        }
    }
}

impl fmt::Debug for AwsProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redacted = self.redacted();
        f.debug_struct("AwsProviderConfig")
            .field("region", &redacted.region)
            .field("bedrock_role_arn", &redacted.bedrock_role_arn)
            .field("access_key_id", &redacted.access_key_id)
            .field("secret_access_key", &redacted.secret_access_key)
            .field("session_token", &redacted.session_token)
            .field("base_url", &redacted.base_url)
            .finish()
    }
}

/// Vertex AI reached through workload identity federation from AWS
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleProviderConfig {
    #[serde(alias = "service-account-email")]
    pub service_account_email: String,
    pub audience: String,
    pub location: String,
    pub project: String,
    #[serde(default, rename = "baseURL", alias = "base-url", alias = "baseUrl", skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

/// Provider credentials, tagged by provider name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "config", rename_all = "lowercase")]
pub enum ProviderConfig {
    Groq(ApiKeyProviderConfig),
    Voyage(ApiKeyProviderConfig),
    Bedrock(AwsProviderConfig),
    Vertex(GoogleProviderConfig),
}

impl ProviderConfig {
    pub fn name(&self) -> ProviderName {
        match self {
            ProviderConfig::Groq(_) => ProviderName::Groq,
            ProviderConfig::Voyage(_) => ProviderName::Voyage,
            ProviderConfig::Bedrock(_) => ProviderName::Bedrock,
            ProviderConfig::Vertex(_) => ProviderName::Vertex,
        }
    }

    /// Copy with every sensitive field masked, for any read that leaves the process
    pub fn redacted(&self) -> Self {
        match self {
            ProviderConfig::Groq(c) => ProviderConfig::Groq(c.redacted()),
            ProviderConfig::Voyage(c) => ProviderConfig::Voyage(c.redacted()),
            ProviderConfig::Bedrock(c) => ProviderConfig::Bedrock(c.redacted()),
            ProviderConfig::Vertex(c) => ProviderConfig::Vertex(c.clone()),
        }
    }
}

/// Process-level default credentials, one slot per provider
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProviderDefaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groq: Option<ApiKeyProviderConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voyage: Option<ApiKeyProviderConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bedrock: Option<AwsProviderConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vertex: Option<GoogleProviderConfig>,
}

impl ProviderDefaults {
    pub fn get(&self, name: ProviderName) -> Option<ProviderConfig> {
        match name {
            ProviderName::Groq => self.groq.clone().map(ProviderConfig::Groq),
            ProviderName::Voyage => self.voyage.clone().map(ProviderConfig::Voyage),
            ProviderName::Bedrock => self.bedrock.clone().map(ProviderConfig::Bedrock),
            ProviderName::Vertex => self.vertex.clone().map(ProviderConfig::Vertex),
        }
    }
}

// Provider-neutral message representation

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContentPart {
    Text(String),
    Image { url: String },
}

/// A function call requested by an assistant turn
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: Option<String>,
    /// JSON schema of the arguments
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolChoice {
    None,
    Auto,
    Required,
    Function(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelMessage {
    pub role: Role,
    pub content: Vec<ContentPart>,
    pub name: Option<String>,
    pub tool_call_id: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    /// Function a tool result answers, resolved from the earlier call
    pub tool_name: Option<String>,
}

impl ModelMessage {
    pub fn new(role: Role, content: Vec<ContentPart>) -> Self {
        Self {
            role,
            content,
            name: None,
            tool_call_id: None,
            tool_calls: Vec::new(),
            tool_name: None,
        }
    }

    /// Concatenated text parts, images dropped
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text(text) => Some(text.as_str()),
                ContentPart::Image { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatParams {
    pub messages: Vec<ModelMessage>,
    pub temperature: f32,
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: Option<ToolChoice>,
}

impl ChatParams {
    pub fn new(messages: Vec<ModelMessage>, temperature: f32) -> Self {
        Self {
            messages,
            temperature,
            tools: Vec::new(),
            tool_choice: None,
        }
    }

    /// Tools to offer upstream; `tool_choice: none` withholds them entirely
    pub fn offered_tools(&self) -> &[ToolDefinition] {
        match self.tool_choice {
            Some(ToolChoice::None) => &[],
            _ => &self.tools,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FinishReason {
    #[default]
    Stop,
    Length,
    ContentFilter,
    ToolCalls,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ContentFilter => "content_filter",
            FinishReason::ToolCalls => "tool_calls",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Generation {
    pub text: String,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: FinishReason,
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Embeddings {
    /// One vector per input, in input order
    pub vectors: Vec<Vec<f32>>,
    pub tokens: Option<u64>,
}

pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// A chat-capable upstream model bound to its credentials and model id
#[async_trait]
pub trait ChatModel: Send + Sync {
    fn model_id(&self) -> &str;

    async fn generate(&self, params: &ChatParams) -> Result<Generation>;

    /// Starts the upstream call; the returned stream yields text deltas
    async fn stream(&self, params: &ChatParams) -> Result<TokenStream>;
}

/// An embedding-capable upstream model bound to its credentials and model id
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    fn model_id(&self) -> &str;

    async fn embed_many(&self, values: &[String]) -> Result<Embeddings>;

    async fn embed(&self, value: &str) -> Result<Embeddings> {
        self.embed_many(&[value.to_string()]).await
    }
}

/// Builds upstream clients for resolved providers
pub struct ProviderFactory {
    http: reqwest::Client,
    registry: Arc<ModelRegistry>,
    defaults: ProviderDefaults,
    aws: Arc<AwsCredentialsProvider>,
    roles: RoleAssumer,
    google: GoogleTokenSource,
}

impl ProviderFactory {
    pub fn new(
        http: reqwest::Client,
        registry: Arc<ModelRegistry>,
        defaults: ProviderDefaults,
        aws: Arc<AwsCredentialsProvider>,
    ) -> Self {
        let roles = RoleAssumer::new(http.clone());
        let google = GoogleTokenSource::new(http.clone());
        Self {
            http,
            registry,
            defaults,
            aws,
            roles,
            google,
        }
    }

    pub fn with_role_assumer(mut self, roles: RoleAssumer) -> Self {
        self.roles = roles;
        self
    }

    pub fn with_google_token_source(mut self, google: GoogleTokenSource) -> Self {
        self.google = google;
        self
    }

    pub async fn chat_model(&self, resolved: &ResolvedProvider) -> Result<Box<dyn ChatModel>> {
        let config = self.resolve_config(resolved)?;
        let model_id = self.resolve_model_id(resolved)?;
        tracing::debug!(
            "Creating chat client for {} via {} ({})",
            resolved.model_type,
            resolved.provider_name,
            model_id
        );

        match config {
            ProviderConfig::Groq(cfg) => Ok(Box::new(groq::GroqChatModel::new(
                self.http.clone(),
                cfg,
                model_id,
            ))),
            ProviderConfig::Bedrock(cfg) => {
                let client = self.bedrock_client(&cfg, resolved.provider_config.is_some()).await?;
                let model_id = client.resolve_model_id(&model_id).await?;
                Ok(Box::new(bedrock::BedrockChatModel::new(client, model_id)))
            }
            ProviderConfig::Vertex(cfg) => {
                let client = self.vertex_client(&cfg).await?;
                Ok(Box::new(vertex::VertexChatModel::new(client, model_id)))
            }
            ProviderConfig::Voyage(_) => Err(self.unsupported(resolved)),
        }
    }

    pub async fn embedding_model(
        &self,
        resolved: &ResolvedProvider,
    ) -> Result<Box<dyn EmbeddingModel>> {
        let config = self.resolve_config(resolved)?;
        let model_id = self.resolve_model_id(resolved)?;
        tracing::debug!(
            "Creating embedding client for {} via {} ({})",
            resolved.model_type,
            resolved.provider_name,
            model_id
        );

        match config {
            ProviderConfig::Voyage(cfg) => Ok(Box::new(voyage::VoyageEmbeddingModel::new(
                self.http.clone(),
                cfg,
                model_id,
            ))),
            ProviderConfig::Bedrock(cfg) => {
                let client = self.bedrock_client(&cfg, resolved.provider_config.is_some()).await?;
                let model_id = client.resolve_model_id(&model_id).await?;
                Ok(Box::new(bedrock::BedrockEmbeddingModel::new(client, model_id)))
            }
            ProviderConfig::Vertex(cfg) => {
                let client = self.vertex_client(&cfg).await?;
                Ok(Box::new(vertex::VertexEmbeddingModel::new(client, model_id)))
            }
            ProviderConfig::Groq(_) => Err(self.unsupported(resolved)),
        }
    }

    /// Custom branch credentials win; otherwise the process-level defaults
    fn resolve_config(&self, resolved: &ResolvedProvider) -> Result<ProviderConfig> {
        let config = match &resolved.provider_config {
            Some(config) => config.clone(),
            None => self
                .defaults
                .get(resolved.provider_name)
                .ok_or(GatewayError::MissingCredentials(resolved.provider_name))?,
        };
        if config.name() != resolved.provider_name {
            return Err(GatewayError::internal(format!(
                "custom provider config for '{}' is a '{}' config",
                resolved.provider_name,
                config.name()
            )));
        }
        Ok(config)
    }

    fn resolve_model_id(&self, resolved: &ResolvedProvider) -> Result<String> {
        let model = self.registry.lookup(&resolved.model_type).ok_or_else(|| {
            GatewayError::MisconfiguredModel {
                model: resolved.model_type.clone(),
                provider: resolved.provider_name,
            }
        })?;
        Ok(model.model_id_for(resolved.provider_name)?.to_string())
    }

    async fn bedrock_client(&self, cfg: &AwsProviderConfig, custom: bool) -> Result<bedrock::BedrockClient> {
        let credentials = self.bedrock_credentials(cfg, custom).await?;
        Ok(bedrock::BedrockClient::new(self.http.clone(), cfg, credentials))
    }

    /// A role is assumed with the static keys when present, else with the
    /// process identity. Only the gateway's own defaults may use the process
    /// identity for Bedrock calls directly.
    async fn bedrock_credentials(&self, cfg: &AwsProviderConfig, custom: bool) -> Result<AwsCredentials> {
        if let Some(role_arn) = cfg.role_arn() {
            let source = match cfg.static_credentials() {
                Some(credentials) => credentials,
                None => self.aws.credentials().await?,
            };
            return self.roles.assume_role(&source, role_arn, &cfg.region).await;
        }
        if let Some(credentials) = cfg.static_credentials() {
            return Ok(credentials);
        }
        if custom {
            return Err(GatewayError::MissingCredentials(ProviderName::Bedrock));
        }
        self.aws.credentials().await
    }

    async fn vertex_client(&self, cfg: &GoogleProviderConfig) -> Result<vertex::VertexClient> {
        let token = self.google.access_token(cfg, &self.aws).await?;
        Ok(vertex::VertexClient::new(self.http.clone(), cfg, token))
    }

    fn unsupported(&self, resolved: &ResolvedProvider) -> GatewayError {
        GatewayError::MisconfiguredModel {
            model: resolved.model_type.clone(),
            provider: resolved.provider_name,
        }
    }
}

/// Split a `data:<mime>;base64,<payload>` URL into mime type and payload.
pub(crate) fn parse_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let mime = meta.strip_suffix(";base64")?;
    if mime.is_empty() || data.is_empty() {
        return None;
    }
    base64::engine::general_purpose::STANDARD.decode(data).ok()?;
    Some((mime.to_string(), data.to_string()))
}

/// Tool results are passed on as JSON when they parse as JSON, else as text
pub(crate) fn tool_output(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

/// Collapse consecutive turns with the same role into one turn, for upstreams
/// that require user/assistant alternation
pub(crate) fn merge_turns(turns: Vec<(&'static str, Vec<Value>)>, content_key: &str) -> Vec<Value> {
    let mut merged: Vec<(&'static str, Vec<Value>)> = Vec::new();
    for (role, parts) in turns {
        if parts.is_empty() {
            continue;
        }
        match merged.last_mut() {
            Some((last_role, last_parts)) if *last_role == role => last_parts.extend(parts),
            _ => merged.push((role, parts)),
        }
    }
    merged
        .into_iter()
        .map(|(role, parts)| json!({ "role": role, content_key: parts }))
        .collect()
}
