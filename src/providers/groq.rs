// Groq chat completions (OpenAI-compatible upstream)

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};

use super::{
    sse, ApiKeyProviderConfig, ChatModel, ChatParams, ContentPart, FinishReason, Generation,
    ModelMessage, TokenStream, ToolCall, ToolChoice, Usage,
};
use crate::error::{GatewayError, Result};

const GROQ_BASE_URL: &str = "https://api.groq.com";

pub struct GroqChatModel {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model_id: String,
}

impl GroqChatModel {
    pub fn new(http: reqwest::Client, config: ApiKeyProviderConfig, model_id: String) -> Self {
        let base_url = config
            .base_url
            .unwrap_or_else(|| GROQ_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        Self {
            http,
            api_key: config.api_key,
            base_url,
            model_id,
        }
    }

    async fn send(&self, params: &ChatParams, stream: bool) -> Result<reqwest::Response> {
        let url = format!("{}/openai/v1/chat/completions", self.base_url);
        let body = build_request(&self.model_id, params, stream);
        tracing::debug!("Groq request to {} (stream={})", self.model_id, stream);

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("Accept", if stream { "text/event-stream" } else { "application/json" })
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(GatewayError::from_upstream(response).await);
        }
        Ok(response)
    }
}

#[async_trait]
impl ChatModel for GroqChatModel {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn generate(&self, params: &ChatParams) -> Result<Generation> {
        let response = self.send(params, false).await?;
        let body: Value = response.json().await?;
        parse_completion(&body)
    }

    async fn stream(&self, params: &ChatParams) -> Result<TokenStream> {
        let response = self.send(params, true).await?;
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
                match parse_chunk(&data) {
                    Ok(Some(text)) => yield Ok(text),
                    Ok(None) => {}
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        };
        Ok(Box::pin(tokens))
    }
}

fn build_request(model_id: &str, params: &ChatParams, stream: bool) -> Value {
    let messages: Vec<Value> = params.messages.iter().map(message_to_openai).collect();
    let mut request = json!({
        "model": model_id,
        "messages": messages,
        "temperature": params.temperature,
        "stream": stream,
    });
    if !params.tools.is_empty() {
        let tools: Vec<Value> = params
            .tools
            .iter()
            .map(|tool| {
                let mut function = json!({ "name": tool.name, "parameters": tool.parameters });
                if let Some(description) = &tool.description {
                    function["description"] = json!(description);
                }
                json!({ "type": "function", "function": function })
            })
            .collect();
        request["tools"] = Value::Array(tools);
    }
    if let Some(choice) = &params.tool_choice {
        request["tool_choice"] = match choice {
            ToolChoice::None => json!("none"),
            ToolChoice::Auto => json!("auto"),
            ToolChoice::Required => json!("required"),
            ToolChoice::Function(name) => json!({ "type": "function", "function": { "name": name } }),
        };
    }
    request
}

fn message_to_openai(message: &ModelMessage) -> Value {
    let content = match message.content.as_slice() {
        [] if !message.tool_calls.is_empty() => Value::Null,
        [ContentPart::Text(text)] => json!(text),
        parts => Value::Array(
            parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text(text) => json!({"type": "text", "text": text}),
                    ContentPart::Image { url } => json!({"type": "image_url", "image_url": {"url": url}}),
                })
                .collect(),
        ),
    };

    let mut out = json!({
        "role": message.role.as_str(),
        "content": content,
    });
    if let Some(name) = &message.name {
        out["name"] = json!(name);
    }
    if let Some(id) = &message.tool_call_id {
        out["tool_call_id"] = json!(id);
    }
    if !message.tool_calls.is_empty() {
        let calls: Vec<Value> = message
            .tool_calls
            .iter()
            .map(|call| {
                json!({
                    "id": call.id,
                    "type": "function",
                    "function": { "name": call.name, "arguments": call.arguments.to_string() },
                })
            })
            .collect();
        out["tool_calls"] = Value::Array(calls);
    }
    out
}

fn parse_completion(body: &Value) -> Result<Generation> {
    let choice = body
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .ok_or_else(|| GatewayError::internal("Groq response has no choices"))?;
    let message = choice.get("message").cloned().unwrap_or(Value::Null);
    let text_field = |key: &str| {
        message
            .get(key)
            .and_then(|c| c.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
    };

    let tool_calls = message
        .get("tool_calls")
        .and_then(|c| c.as_array())
        .map(|calls| calls.iter().map(parse_tool_call).collect())
        .unwrap_or_default();

    let finish_reason = match choice.get("finish_reason").and_then(|r| r.as_str()) {
        Some("length") => FinishReason::Length,
        Some("tool_calls") | Some("function_call") => FinishReason::ToolCalls,
        Some("content_filter") => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    };

    let usage = body.get("usage").map(|u| Usage {
        input_tokens: u.get("prompt_tokens").and_then(|v| v.as_u64()),
        output_tokens: u.get("completion_tokens").and_then(|v| v.as_u64()),
        total_tokens: u.get("total_tokens").and_then(|v| v.as_u64()),
    });

    Ok(Generation {
        text: text_field("content").unwrap_or_default(),
        reasoning: text_field("reasoning"),
        tool_calls,
        finish_reason,
        usage,
    })
}

/// Arguments arrive as JSON text; text that does not parse is kept as a string
fn parse_tool_call(call: &Value) -> ToolCall {
    let function = call.get("function");
    let field = |value: Option<&Value>| value.and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let arguments = field(function.and_then(|f| f.get("arguments")));
    ToolCall {
        id: field(call.get("id")),
        name: field(function.and_then(|f| f.get("name"))),
        arguments: serde_json::from_str(&arguments).unwrap_or(Value::String(arguments)),
    }
}

/// Text delta carried by one stream chunk, if any
fn parse_chunk(data: &str) -> Result<Option<String>> {
    let chunk: Value = serde_json::from_str(data)
        .map_err(|e| GatewayError::internal(format!("invalid Groq stream chunk: {}", e)))?;

    if let Some(error) = chunk.get("error") {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown error");
        return Err(GatewayError::internal(format!("Groq stream failed: {}", message)));
    }

    Ok(chunk
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("content"))
        .and_then(|c| c.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string()))
}
