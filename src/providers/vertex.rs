// Vertex AI client: Gemini chat and text embeddings on the regional aiplatform endpoint

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use uuid::Uuid;

use super::{
    merge_turns, parse_data_url, sse, tool_output, ChatModel, ChatParams, ContentPart,
    EmbeddingModel, Embeddings, FinishReason, Generation, GoogleProviderConfig, ModelMessage,
    Role, TokenStream, ToolCall, ToolChoice, Usage,
};
use crate::error::{GatewayError, Result};

#[derive(Debug, Clone)]
pub struct VertexClient {
    http: reqwest::Client,
    access_token: String,
    base_url: String,
    project: String,
    location: String,
}

impl VertexClient {
    pub fn new(http: reqwest::Client, config: &GoogleProviderConfig, access_token: String) -> Self {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| format!("https://{}-aiplatform.googleapis.com/v1", config.location))
            .trim_end_matches('/')
            .to_string();
        Self {
            http,
            access_token,
            base_url,
            project: config.project.clone(),
            location: config.location.clone(),
        }
    }

    fn model_url(&self, model_id: &str, method: &str) -> String {
        format!(
            "{}/projects/{}/locations/{}/publishers/google/models/{}:{}",
            self.base_url, self.project, self.location, model_id, method
        )
    }

    async fn post(&self, url: &str, payload: &Value, accept: &str) -> Result<reqwest::Response> {
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.access_token)
            .header("Accept", accept)
            .json(payload)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(GatewayError::from_upstream(response).await);
        }
        Ok(response)
    }
}

pub struct VertexChatModel {
    client: VertexClient,
    model_id: String,
}

impl VertexChatModel {
    pub fn new(client: VertexClient, model_id: String) -> Self {
        Self { client, model_id }
    }
}

#[async_trait]
impl ChatModel for VertexChatModel {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn generate(&self, params: &ChatParams) -> Result<Generation> {
        let payload = build_generate_request(params)?;
        let url = self.client.model_url(&self.model_id, "generateContent");
        tracing::debug!("Vertex generateContent request to {}", self.model_id);

        let response = self.client.post(&url, &payload, "application/json").await?;
        let body: Value = response.json().await?;
        Ok(parse_generate_response(&body))
    }

    async fn stream(&self, params: &ChatParams) -> Result<TokenStream> {
        let payload = build_generate_request(params)?;
        let url = format!(
            "{}?alt=sse",
            self.client.model_url(&self.model_id, "streamGenerateContent")
        );
        tracing::debug!("Vertex streamGenerateContent request to {}", self.model_id);

        let response = self.client.post(&url, &payload, "text/event-stream").await?;
        let lines = sse::data_lines(response.bytes_stream());

        let tokens = async_stream::stream! {
            futures::pin_mut!(lines);
            while let Some(line) = lines.next().await {
                let data = match line {
                    Ok(d) => d,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };
                let chunk: Value = match serde_json::from_str(&data) {
                    Ok(v) => v,
                    Err(e) => {
                        yield Err(GatewayError::internal(format!("invalid Vertex stream chunk: {}", e)));
                        return;
                    }
                };
                if let Some(error) = chunk.get("error") {
                    let message = error.get("message").and_then(|m| m.as_str()).unwrap_or("unknown error");
                    yield Err(GatewayError::internal(format!("Vertex stream failed: {}", message)));
                    return;
                }
                let text = candidate_text(&chunk);
                if !text.is_empty() {
                    yield Ok(text);
                }
            }
        };
        Ok(Box::pin(tokens))
    }
}

pub struct VertexEmbeddingModel {
    client: VertexClient,
    model_id: String,
}

impl VertexEmbeddingModel {
    pub fn new(client: VertexClient, model_id: String) -> Self {
        Self { client, model_id }
    }
}

#[async_trait]
impl EmbeddingModel for VertexEmbeddingModel {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn embed_many(&self, values: &[String]) -> Result<Embeddings> {
        let instances: Vec<Value> = values.iter().map(|v| json!({ "content": v })).collect();
        let url = self.client.model_url(&self.model_id, "predict");
        tracing::debug!("Vertex embedding request: {} inputs to {}", values.len(), self.model_id);

        let response = self
            .client
            .post(&url, &json!({ "instances": instances }), "application/json")
            .await?;
        let body: Value = response.json().await?;

        let predictions = body
            .get("predictions")
            .and_then(|p| p.as_array())
            .ok_or_else(|| GatewayError::internal("Vertex response has no predictions"))?;
        if predictions.len() != values.len() {
            return Err(GatewayError::internal(format!(
                "Vertex returned {} embeddings for {} inputs",
                predictions.len(),
                values.len()
            )));
        }

        let mut vectors = Vec::with_capacity(predictions.len());
        let mut tokens: Option<u64> = None;
        for prediction in predictions {
            let embeddings = prediction
                .get("embeddings")
                .ok_or_else(|| GatewayError::internal("Vertex prediction has no embeddings"))?;
            let values: Vec<f32> = embeddings
                .get("values")
                .cloned()
                .map(serde_json::from_value)
                .transpose()
                .map_err(|e| GatewayError::internal(format!("invalid Vertex embedding: {}", e)))?
                .unwrap_or_default();
            vectors.push(values);

            if let Some(count) = embeddings
                .get("statistics")
                .and_then(|s| s.get("token_count"))
                .and_then(|c| c.as_f64())
            {
                tokens = Some(tokens.unwrap_or(0) + count as u64);
            }
        }

        Ok(Embeddings { vectors, tokens })
    }
}

fn build_generate_request(params: &ChatParams) -> Result<Value> {
    let mut system_parts = Vec::new();
    let mut turns = Vec::new();
    for message in &params.messages {
        match message.role {
            Role::System => {
                let text = message.text();
                if !text.is_empty() {
                    system_parts.push(json!({ "text": text }));
                }
            }
            Role::User => turns.push(("user", message_parts(message)?)),
            Role::Tool => turns.push(("user", vec![function_response(message)])),
            Role::Assistant => {
                let mut parts = message_parts(message)?;
                parts.extend(message.tool_calls.iter().map(|call| {
                    json!({ "functionCall": { "name": call.name, "args": call.arguments } })
                }));
                turns.push(("model", parts));
            }
        }
    }

    let contents = merge_turns(turns, "parts");
    if contents.is_empty() {
        return Err(GatewayError::bad_request(
            "At least one user or assistant message is required",
            "invalid_messages",
        ));
    }

    let mut request = json!({
        "contents": contents,
        "generationConfig": { "temperature": params.temperature },
    });
    if !system_parts.is_empty() {
        request["systemInstruction"] = json!({ "parts": system_parts });
    }
    if !params.tools.is_empty() {
        let declarations: Vec<Value> = params
            .tools
            .iter()
            .map(|tool| {
                let mut declaration = json!({ "name": tool.name, "parameters": tool.parameters });
                if let Some(description) = &tool.description {
                    declaration["description"] = json!(description);
                }
                declaration
            })
            .collect();
        request["tools"] = json!([{ "functionDeclarations": declarations }]);
    }
    if let Some(choice) = &params.tool_choice {
        request["toolConfig"] = json!({
            "functionCallingConfig": match choice {
                ToolChoice::None => json!({ "mode": "NONE" }),
                ToolChoice::Auto => json!({ "mode": "AUTO" }),
                ToolChoice::Required => json!({ "mode": "ANY" }),
                ToolChoice::Function(name) => json!({ "mode": "ANY", "allowedFunctionNames": [name] }),
            }
        });
    }
    Ok(request)
}

/// Gemini requires an object response; other tool outputs are wrapped
fn function_response(message: &ModelMessage) -> Value {
    let response = match tool_output(&message.text()) {
        output @ Value::Object(_) => output,
        other => json!({ "content": other }),
    };
    json!({
        "functionResponse": {
            "name": message.tool_name.clone().unwrap_or_default(),
            "response": response,
        }
    })
}

fn message_parts(message: &ModelMessage) -> Result<Vec<Value>> {
    let mut parts = Vec::new();
    for part in &message.content {
        match part {
            ContentPart::Text(text) if text.is_empty() => {}
            ContentPart::Text(text) => parts.push(json!({ "text": text })),
            ContentPart::Image { url } => {
                if let Some((mime, data)) = parse_data_url(url) {
                    parts.push(json!({ "inlineData": { "mimeType": mime, "data": data } }));
                } else if url.starts_with("data:") {
                    return Err(GatewayError::bad_request(
                        "Image data URLs must be base64 encoded",
                        "unsupported_image",
                    ));
                } else {
                    parts.push(json!({
                        "fileData": { "mimeType": mime_for_url(url), "fileUri": url }
                    }));
                }
            }
        }
    }
    Ok(parts)
}

fn mime_for_url(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let ext = path
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "heif" => "image/heif",
        _ => "image/jpeg",
    }
}

fn candidate_parts(root: &Value) -> &[Value] {
    root.pointer("/candidates/0/content/parts")
        .and_then(|p| p.as_array())
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn is_thought(part: &Value) -> bool {
    part.get("thought").and_then(|t| t.as_bool()).unwrap_or(false)
}

/// Text of the first candidate, thought parts skipped
fn candidate_text(root: &Value) -> String {
    candidate_parts(root)
        .iter()
        .filter(|p| !is_thought(p))
        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
        .collect()
}

fn parse_generate_response(root: &Value) -> Generation {
    let parts = candidate_parts(root);
    let reasoning: String = parts
        .iter()
        .filter(|p| is_thought(p))
        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
        .collect();
    // Gemini does not id its calls
    let tool_calls: Vec<ToolCall> = parts
        .iter()
        .filter_map(|p| p.get("functionCall"))
        .map(|call| ToolCall {
            id: format!("call_{}", Uuid::new_v4().simple()),
            name: call
                .get("name")
                .and_then(|n| n.as_str())
                .unwrap_or_default()
                .to_string(),
            arguments: call.get("args").cloned().unwrap_or_else(|| json!({})),
        })
        .collect();

    let finish_reason = if !tool_calls.is_empty() {
        FinishReason::ToolCalls
    } else {
        match root.pointer("/candidates/0/finishReason").and_then(|r| r.as_str()) {
            Some("MAX_TOKENS") => FinishReason::Length,
            Some("SAFETY") | Some("RECITATION") | Some("BLOCKLIST") | Some("PROHIBITED_CONTENT")
            | Some("SPII") | Some("IMAGE_SAFETY") => FinishReason::ContentFilter,
            _ => FinishReason::Stop,
        }
    };

    let usage = root.get("usageMetadata").map(|u| Usage {
        input_tokens: u.get("promptTokenCount").and_then(|v| v.as_u64()),
        output_tokens: u.get("candidatesTokenCount").and_then(|v| v.as_u64()),
        total_tokens: u.get("totalTokenCount").and_then(|v| v.as_u64()),
    });
    Generation {
        text: candidate_text(root),
        reasoning: Some(reasoning).filter(|r| !r.is_empty()),
        tool_calls,
        finish_reason,
        usage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> VertexClient {
        VertexClient::new(
            reqwest::Client::new(),
            &GoogleProviderConfig {
                service_account_email: "gateway@proj.iam.gserviceaccount.com".to_string(),
                audience: "//iam.googleapis.com/projects/1/locations/global/workloadIdentityPools/p/providers/aws".to_string(),
                location: "us-central1".to_string(),
                project: "proj".to_string(),
                base_url: Some(format!("{}/v1", server.uri())),
            },
            "ya29.token".to_string(),
        )
    }

    fn user(text: &str) -> ModelMessage {
        ModelMessage::new(Role::User, vec![ContentPart::Text(text.to_string())])
    }

    #[test]
    fn test_generate_request_shape() {
        let params = ChatParams::new(
            vec![
                ModelMessage { role: Role::System, ..user("be brief") },
                ModelMessage {
                    content: vec![
                        ContentPart::Text("describe".to_string()),
                        ContentPart::Image { url: "data:image/png;base64,AAAA".to_string() },
                        ContentPart::Image { url: "gs://bucket/cat.JPG?x=1".to_string() },
                    ],
                    ..user("")
                },
                ModelMessage { role: Role::Assistant, ..user("a cat") },
            ],
            0.0,
        );
        let request = build_generate_request(&params).unwrap();
        assert_eq!(request["systemInstruction"], json!({"parts": [{"text": "be brief"}]}));
        assert_eq!(request["contents"][0]["role"], "user");
        assert_eq!(request["contents"][0]["parts"][1]["inlineData"]["mimeType"], "image/png");
        assert_eq!(request["contents"][0]["parts"][2]["fileData"]["mimeType"], "image/jpeg");
        assert_eq!(request["contents"][1]["role"], "model");
    }

    #[test]
    fn test_candidate_text_skips_thoughts() {
        let root = json!({"candidates": [{"content": {"parts": [
            {"text": "thinking...", "thought": true},
            {"text": "answer"}
        ]}}]});
        assert_eq!(candidate_text(&root), "answer");
        assert_eq!(parse_generate_response(&root).reasoning.as_deref(), Some("thinking..."));
    }

    #[test]
    fn test_function_calling_round_trip() {
        let mut params = ChatParams::new(
            vec![
                user("weather in Paris?"),
                ModelMessage {
                    tool_calls: vec![ToolCall {
                        id: "call_1".to_string(),
                        name: "get_weather".to_string(),
                        arguments: json!({"city": "Paris"}),
                    }],
                    ..ModelMessage::new(Role::Assistant, vec![])
                },
                ModelMessage {
                    tool_call_id: Some("call_1".to_string()),
                    tool_name: Some("get_weather".to_string()),
                    ..ModelMessage { role: Role::Tool, ..user("21") }
                },
            ],
            1.0,
        );
        params.tools = vec![crate::providers::ToolDefinition {
            name: "get_weather".to_string(),
            description: None,
            parameters: json!({"type": "object"}),
        }];
        params.tool_choice = Some(ToolChoice::Function("get_weather".to_string()));

        let request = build_generate_request(&params).unwrap();
        assert_eq!(
            request["contents"][1],
            json!({"role": "model", "parts": [{"functionCall": {"name": "get_weather", "args": {"city": "Paris"}}}]})
        );
        assert_eq!(
            request["contents"][2],
            json!({"role": "user", "parts": [{"functionResponse": {"name": "get_weather", "response": {"content": 21}}}]})
        );
        assert_eq!(request["tools"][0]["functionDeclarations"][0]["name"], "get_weather");
        assert_eq!(
            request["toolConfig"],
            json!({"functionCallingConfig": {"mode": "ANY", "allowedFunctionNames": ["get_weather"]}})
        );

        let generation = parse_generate_response(&json!({"candidates": [{
            "content": {"parts": [{"functionCall": {"name": "get_weather", "args": {"city": "Rome"}}}]},
            "finishReason": "STOP"
        }]}));
        assert_eq!(generation.finish_reason, FinishReason::ToolCalls);
        assert!(generation.tool_calls[0].id.starts_with("call_"));
        assert_eq!(generation.tool_calls[0].arguments, json!({"city": "Rome"}));

        let blocked = parse_generate_response(&json!({"candidates": [{"finishReason": "SAFETY"}]}));
        assert_eq!(blocked.finish_reason, FinishReason::ContentFilter);
    }

    #[tokio::test]
    async fn test_generate() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/projects/proj/locations/us-central1/publishers/google/models/gemini-2.5-flash:generateContent"))
            .and(header("authorization", "Bearer ya29.token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{"content": {"role": "model", "parts": [{"text": "world"}]}, "finishReason": "STOP"}],
                "usageMetadata": {"promptTokenCount": 2, "candidatesTokenCount": 1, "totalTokenCount": 3}
            })))
            .mount(&server)
            .await;

        let model = VertexChatModel::new(client(&server), "gemini-2.5-flash".to_string());
        let generation = model
            .generate(&ChatParams::new(vec![user("hello")], 1.0))
            .await
            .unwrap();
        assert_eq!(generation.text, "world");
        assert_eq!(generation.usage.unwrap().output_tokens, Some(1));
    }

    #[tokio::test]
    async fn test_stream() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"wor\"}]}}]}\r\n\r\n",
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"ld\"}]},\"finishReason\":\"STOP\"}]}\r\n\r\n",
        );
        Mock::given(method("POST"))
            .and(path("/v1/projects/proj/locations/us-central1/publishers/google/models/gemini-2.5-flash:streamGenerateContent"))
            .and(query_param("alt", "sse"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let model = VertexChatModel::new(client(&server), "gemini-2.5-flash".to_string());
        let stream = model
            .stream(&ChatParams::new(vec![user("hello")], 1.0))
            .await
            .unwrap();
        let tokens: Vec<String> = stream.map(|t| t.unwrap()).collect().await;
        assert_eq!(tokens, vec!["wor", "ld"]);
    }

    #[tokio::test]
    async fn test_embed_many() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/projects/proj/locations/us-central1/publishers/google/models/text-embedding-005:predict"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "predictions": [
                    {"embeddings": {"values": [0.1, 0.2], "statistics": {"token_count": 2, "truncated": false}}},
                    {"embeddings": {"values": [0.3, 0.4], "statistics": {"token_count": 3, "truncated": false}}}
                ]
            })))
            .mount(&server)
            .await;

        let model = VertexEmbeddingModel::new(client(&server), "text-embedding-005".to_string());
        let embeddings = model
            .embed_many(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(embeddings.vectors, vec![vec![0.1, 0.2], vec![0.3, 0.4]]);
        assert_eq!(embeddings.tokens, Some(5));
    }

    #[tokio::test]
    async fn test_upstream_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "error": {"code": 403, "message": "Permission denied", "status": "PERMISSION_DENIED"}
            })))
            .mount(&server)
            .await;

        let model = VertexChatModel::new(client(&server), "gemini-2.5-flash".to_string());
        let err = model
            .generate(&ChatParams::new(vec![user("hello")], 1.0))
            .await
            .unwrap_err();
        assert_eq!(err.status().as_u16(), 403);
    }
}
