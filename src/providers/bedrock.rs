// Amazon Bedrock: Converse / ConverseStream chat and Cohere embeddings over InvokeModel

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{
    merge_turns, parse_data_url, tool_output, AwsProviderConfig, ChatModel, ChatParams,
    ContentPart, EmbeddingModel, Embeddings, FinishReason, Generation, ModelMessage, Role,
    TokenStream, ToolCall, ToolChoice, Usage,
};
use crate::aws::event_stream::{Decoder, Message};
use crate::aws::sigv4::{self, SigningRequest};
use crate::aws::AwsCredentials;
use crate::error::{GatewayError, Result};

const SERVICE: &str = "bedrock";
const EVENT_STREAM_CONTENT_TYPE: &str = "application/vnd.amazon.eventstream";
const INPUT_TOKEN_COUNT_HEADER: &str = "x-amzn-bedrock-input-token-count";
const PROFILE_PAGE_SIZE: u32 = 1000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InferenceProfilePage {
    #[serde(default)]
    inference_profile_summaries: Vec<InferenceProfileSummary>,
    #[serde(default)]
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InferenceProfileSummary {
    #[serde(default)]
    inference_profile_arn: Option<String>,
}

/// Signed transport to the Bedrock runtime and control-plane endpoints
pub struct BedrockClient {
    http: reqwest::Client,
    credentials: AwsCredentials,
    region: String,
    runtime_url: String,
    control_url: String,
}

impl BedrockClient {
    /// A configured base URL serves both the runtime and control-plane calls
    pub fn new(http: reqwest::Client, config: &AwsProviderConfig, credentials: AwsCredentials) -> Self {
        let endpoint = |default: String| {
            config
                .base_url
                .clone()
                .unwrap_or(default)
                .trim_end_matches('/')
                .to_string()
        };
        Self {
            http,
            credentials,
            region: config.region.clone(),
            runtime_url: endpoint(format!("https://bedrock-runtime.{}.amazonaws.com", config.region)),
            control_url: endpoint(format!("https://bedrock.{}.amazonaws.com", config.region)),
        }
    }

    /// ARN of the first inference profile that names `model_id`, else `model_id` itself
    pub async fn resolve_model_id(&self, model_id: &str) -> Result<String> {
        if model_id.starts_with("arn:") {
            return Ok(model_id.to_string());
        }

        let mut next_token: Option<String> = None;
        loop {
            let mut url = format!("{}/inference-profiles?maxResults={}", self.control_url, PROFILE_PAGE_SIZE);
            if let Some(token) = &next_token {
                url.push_str("&nextToken=");
                url.push_str(&urlencoding::encode(token));
            }
            let response = self.send(Method::GET, &url, "application/json", None).await?;
            let page: InferenceProfilePage = response.json().await?;

            let found = page
                .inference_profile_summaries
                .into_iter()
                .filter_map(|p| p.inference_profile_arn)
                .find(|arn| arn.contains(model_id));
            if let Some(arn) = found {
                tracing::debug!("Using inference profile {} for {}", arn, model_id);
                return Ok(arn);
            }
            match page.next_token {
                Some(token) if !token.is_empty() => next_token = Some(token),
                _ => return Ok(model_id.to_string()),
            }
        }
    }

    async fn invoke(&self, model_id: &str, action: &str, body: &Value, accept: &str) -> Result<reqwest::Response> {
        let url = format!("{}/model/{}/{}", self.runtime_url, urlencoding::encode(model_id), action);
        self.send(Method::POST, &url, accept, Some(body)).await
    }

    async fn send(&self, method: Method, url: &str, accept: &str, body: Option<&Value>) -> Result<reqwest::Response> {
        let url = reqwest::Url::parse(url)
            .map_err(|e| GatewayError::internal(format!("invalid Bedrock URL {}: {}", url, e)))?;
        let host = sigv4::host_header(&url).ok_or_else(|| GatewayError::internal("Bedrock URL has no host"))?;
        let payload = body
            .map(serde_json::to_vec)
            .transpose()
            .map_err(anyhow::Error::from)?;

        let mut headers = vec![("accept", accept), ("host", host.as_str())];
        if payload.is_some() {
            headers.push(("content-type", "application/json"));
        }
        let signed = sigv4::sign(
            &SigningRequest {
                method: method.as_str(),
                url: &url,
                headers: &headers,
                body: payload.as_deref().unwrap_or_default(),
            },
            &self.credentials,
            &self.region,
            SERVICE,
            Utc::now(),
        );

        let mut request = self.http.request(method, url).header("accept", accept);
        for (name, value) in signed {
            request = request.header(name, value);
        }
        if let Some(payload) = payload {
            request = request.header("content-type", "application/json").body(payload);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(GatewayError::from_upstream(response).await);
        }
        Ok(response)
    }
}

pub struct BedrockChatModel {
    client: BedrockClient,
    model_id: String,
}

impl BedrockChatModel {
    pub fn new(client: BedrockClient, model_id: String) -> Self {
        Self { client, model_id }
    }
}

#[async_trait]
impl ChatModel for BedrockChatModel {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn generate(&self, params: &ChatParams) -> Result<Generation> {
        let body = build_converse_request(params)?;
        tracing::debug!("Bedrock converse request to {}", self.model_id);
        let response = self
            .client
            .invoke(&self.model_id, "converse", &body, "application/json")
            .await?;
        let body: Value = response.json().await?;
        Ok(parse_converse_response(&body))
    }

    async fn stream(&self, params: &ChatParams) -> Result<TokenStream> {
        let body = build_converse_request(params)?;
        tracing::debug!("Bedrock converse-stream request to {}", self.model_id);
        let response = self
            .client
            .invoke(&self.model_id, "converse-stream", &body, EVENT_STREAM_CONTENT_TYPE)
            .await?;
        let mut bytes = Box::pin(response.bytes_stream());

        let tokens = async_stream::stream! {
            let mut decoder = Decoder::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(b) => b,
                    Err(e) => {
                        yield Err(GatewayError::from(e));
                        return;
                    }
                };
                let messages = match decoder.feed(&chunk) {
                    Ok(m) => m,
                    Err(e) => {
                        yield Err(GatewayError::Internal(e));
                        return;
                    }
                };
                for message in messages {
                    match stream_event(&message) {
                        Ok(StreamEvent::Text(text)) => yield Ok(text),
                        Ok(StreamEvent::Stop) => return,
                        Ok(StreamEvent::Other) => {}
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }
            }
            if decoder.pending() > 0 {
                yield Err(GatewayError::internal(format!(
                    "Bedrock stream ended inside a frame ({} bytes pending)",
                    decoder.pending()
                )));
            }
        };
        Ok(Box::pin(tokens))
    }
}

pub struct BedrockEmbeddingModel {
    client: BedrockClient,
    model_id: String,
}

impl BedrockEmbeddingModel {
    pub fn new(client: BedrockClient, model_id: String) -> Self {
        Self { client, model_id }
    }
}

#[async_trait]
impl EmbeddingModel for BedrockEmbeddingModel {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn embed_many(&self, values: &[String]) -> Result<Embeddings> {
        let body = json!({
            "texts": values,
            "input_type": "search_document",
            "embedding_types": ["float"],
        });
        tracing::debug!("Bedrock embedding request: {} inputs to {}", values.len(), self.model_id);

        let response = self
            .client
            .invoke(&self.model_id, "invoke", &body, "application/json")
            .await?;
        let tokens = response
            .headers()
            .get(INPUT_TOKEN_COUNT_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let body: Value = response.json().await?;

        let vectors = parse_embeddings(&body)?;
        if vectors.len() != values.len() {
            return Err(GatewayError::internal(format!(
                "Bedrock returned {} embeddings for {} inputs",
                vectors.len(),
                values.len()
            )));
        }
        Ok(Embeddings { vectors, tokens })
    }
}

fn build_converse_request(params: &ChatParams) -> Result<Value> {
    let mut system = Vec::new();
    let mut turns = Vec::new();
    for message in &params.messages {
        match message.role {
            Role::System => {
                let text = message.text();
                if !text.is_empty() {
                    system.push(json!({ "text": text }));
                }
            }
            Role::User => turns.push(("user", content_blocks(message)?)),
            // Tool results travel in the following user turn
            Role::Tool => turns.push(("user", vec![tool_result_block(message)])),
            Role::Assistant => {
                let mut blocks = content_blocks(message)?;
                blocks.extend(message.tool_calls.iter().map(|call| {
                    json!({ "toolUse": { "toolUseId": call.id, "name": call.name, "input": call.arguments } })
                }));
                turns.push(("assistant", blocks));
            }
        }
    }

    let messages = merge_turns(turns, "content");
    if messages.is_empty() {
        return Err(GatewayError::bad_request(
            "At least one user or assistant message is required",
            "invalid_messages",
        ));
    }

    let mut body = json!({
        "messages": messages,
        "inferenceConfig": { "temperature": params.temperature },
    });
    if !system.is_empty() {
        body["system"] = Value::Array(system);
    }
    if let Some(tool_config) = tool_config(params) {
        body["toolConfig"] = tool_config;
    }
    Ok(body)
}

/// Converse has no "none" choice; such requests go out without tools
fn tool_config(params: &ChatParams) -> Option<Value> {
    let tools = params.offered_tools();
    if tools.is_empty() {
        return None;
    }
    let specs: Vec<Value> = tools
        .iter()
        .map(|tool| {
            let mut spec = json!({ "name": tool.name, "inputSchema": { "json": tool.parameters } });
            if let Some(description) = tool.description.as_deref().filter(|d| !d.is_empty()) {
                spec["description"] = json!(description);
            }
            json!({ "toolSpec": spec })
        })
        .collect();

    let mut config = json!({ "tools": specs });
    match &params.tool_choice {
        Some(ToolChoice::Required) => config["toolChoice"] = json!({ "any": {} }),
        Some(ToolChoice::Function(name)) => config["toolChoice"] = json!({ "tool": { "name": name } }),
        Some(ToolChoice::Auto) => config["toolChoice"] = json!({ "auto": {} }),
        Some(ToolChoice::None) | None => {}
    }
    Some(config)
}

fn tool_result_block(message: &ModelMessage) -> Value {
    let content = match tool_output(&message.text()) {
        output @ Value::Object(_) => json!({ "json": output }),
        Value::String(text) => json!({ "text": text }),
        other => json!({ "text": other.to_string() }),
    };
    json!({
        "toolResult": {
            "toolUseId": message.tool_call_id.clone().unwrap_or_default(),
            "content": [content],
        }
    })
}

fn content_blocks(message: &ModelMessage) -> Result<Vec<Value>> {
    let mut blocks = Vec::new();
    for part in &message.content {
        match part {
            ContentPart::Text(text) if text.is_empty() => {}
            ContentPart::Text(text) => blocks.push(json!({ "text": text })),
            ContentPart::Image { url } => {
                let (mime, data) = parse_data_url(url).ok_or_else(|| {
                    GatewayError::bad_request(
                        "Bedrock models only accept images as base64 data URLs",
                        "unsupported_image",
                    )
                })?;
                let format = match mime.as_str() {
                    "image/png" => "png",
                    "image/jpeg" | "image/jpg" => "jpeg",
                    "image/gif" => "gif",
                    "image/webp" => "webp",
                    other => {
                        return Err(GatewayError::bad_request(
                            format!("Unsupported image type '{}'", other),
                            "unsupported_image",
                        ))
                    }
                };
                blocks.push(json!({
                    "image": { "format": format, "source": { "bytes": data } }
                }));
            }
        }
    }
    Ok(blocks)
}

fn parse_converse_response(body: &Value) -> Generation {
    let blocks = body
        .pointer("/output/message/content")
        .and_then(|c| c.as_array())
        .map(Vec::as_slice)
        .unwrap_or_default();

    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls = Vec::new();
    for block in blocks {
        if let Some(t) = block.get("text").and_then(|t| t.as_str()) {
            text.push_str(t);
        } else if let Some(r) = block
            .pointer("/reasoningContent/reasoningText/text")
            .and_then(|t| t.as_str())
        {
            reasoning.push_str(r);
        } else if let Some(tool_use) = block.get("toolUse") {
            let field = |key: &str| {
                tool_use
                    .get(key)
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string()
            };
            tool_calls.push(ToolCall {
                id: field("toolUseId"),
                name: field("name"),
                arguments: tool_use.get("input").cloned().unwrap_or_else(|| json!({})),
            });
        }
    }

    let finish_reason = match body.get("stopReason").and_then(|r| r.as_str()) {
        Some("max_tokens") => FinishReason::Length,
        Some("tool_use") => FinishReason::ToolCalls,
        Some("guardrail_intervened") | Some("content_filtered") => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    };

    let usage = body.get("usage").map(|u| Usage {
        input_tokens: u.get("inputTokens").and_then(|v| v.as_u64()),
        output_tokens: u.get("outputTokens").and_then(|v| v.as_u64()),
        total_tokens: u.get("totalTokens").and_then(|v| v.as_u64()),
    });

    Generation {
        text,
        reasoning: Some(reasoning).filter(|r| !r.is_empty()),
        tool_calls,
        finish_reason,
        usage,
    }
}

enum StreamEvent {
    Text(String),
    Stop,
    Other,
}

fn stream_event(message: &Message) -> Result<StreamEvent> {
    if message.message_type() != "event" {
        let payload: Value = serde_json::from_slice(&message.payload).unwrap_or(Value::Null);
        let detail = payload
            .get("message")
            .or_else(|| payload.get("Message"))
            .and_then(|m| m.as_str())
            .unwrap_or("no details");
        return Err(GatewayError::internal(format!(
            "Bedrock stream {}: {}",
            message.exception_type().unwrap_or("error"),
            detail
        )));
    }

    match message.event_type() {
        Some("contentBlockDelta") => {
            let payload: Value = serde_json::from_slice(&message.payload)
                .map_err(|e| GatewayError::internal(format!("invalid Bedrock stream event: {}", e)))?;
            Ok(payload
                .get("delta")
                .and_then(|d| d.get("text"))
                .and_then(|t| t.as_str())
                .filter(|t| !t.is_empty())
                .map(|t| StreamEvent::Text(t.to_string()))
                .unwrap_or(StreamEvent::Other))
        }
        Some("messageStop") => Ok(StreamEvent::Stop),
        _ => Ok(StreamEvent::Other),
    }
}

/// Cohere embed v4 nests vectors by type; v3 returns them directly
fn parse_embeddings(body: &Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = body
        .get("embeddings")
        .ok_or_else(|| GatewayError::internal("Bedrock response has no embeddings"))?;
    let vectors = match embeddings {
        Value::Object(by_type) => by_type
            .get("float")
            .ok_or_else(|| GatewayError::internal("Bedrock response has no float embeddings"))?,
        other => other,
    };
    serde_json::from_value(vectors.clone())
        .map_err(|e| GatewayError::internal(format!("invalid Bedrock embeddings: {}", e)))
}
