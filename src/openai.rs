// OpenAI-compatible request and response bodies

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{GatewayError, Result};
use crate::providers::Role;

pub const DEFAULT_TEMPERATURE: f32 = 1.0;

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub tools: Option<Vec<Tool>>,
    #[serde(default)]
    pub tool_choice: Option<ToolChoiceParam>,
}

impl ChatCompletionRequest {
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(GatewayError::validation("model must not be empty"));
        }
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(GatewayError::validation(format!(
                    "temperature must be between 0 and 2, got {}",
                    t
                )));
            }
        }
        for (i, message) in self.messages.iter().enumerate() {
            match message.role {
                Role::Tool if message.tool_call_id.is_none() => {
                    return Err(GatewayError::validation(format!(
                        "messages[{}].tool_call_id is required for tool messages",
                        i
                    )));
                }
                // Only an assistant turn that calls tools may omit its content
                Role::Assistant if message.content.is_none() && message.tool_calls.is_none() => {
                    return Err(GatewayError::validation(format!(
                        "messages[{}].content is required",
                        i
                    )));
                }
                Role::System | Role::User | Role::Tool if message.content.is_none() => {
                    return Err(GatewayError::validation(format!(
                        "messages[{}].content is required",
                        i
                    )));
                }
                _ => {}
            }
        }
        if let Some(tools) = &self.tools {
            if let Some(tool) = tools.iter().find(|t| t.function.name.trim().is_empty()) {
                return Err(GatewayError::validation(format!(
                    "tool of type '{}' has no function name",
                    tool.kind
                )));
            }
        }
        if let Some(ToolChoiceParam::Function(choice)) = &self.tool_choice {
            let declared = self
                .tools
                .iter()
                .flatten()
                .any(|t| t.function.name == choice.function.name);
            if !declared {
                return Err(GatewayError::validation(format!(
                    "tool_choice names undeclared function '{}'",
                    choice.function.name
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    /// Null only on assistant turns that carry `tool_calls`
    #[serde(default)]
    pub content: Option<MessageContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

/// A function call requested by the assistant; `arguments` is JSON text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_type")]
    pub kind: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    #[serde(rename = "type", default = "function_type")]
    pub kind: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON schema of the arguments
    #[serde(default = "empty_schema")]
    pub parameters: Value,
}

/// `"none" | "auto" | "required"` or a named function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolChoiceParam {
    Mode(ToolChoiceMode),
    Function(NamedToolChoice),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoiceMode {
    None,
    Auto,
    Required,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedToolChoice {
    #[serde(rename = "type", default = "function_type")]
    pub kind: String,
    pub function: FunctionName,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionName {
    pub name: String,
}

fn function_type() -> String {
    "function".to_string()
}

fn empty_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<CompletionUsage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatChoice {
    pub index: u32,
    pub message: AssistantMessage,
    pub finish_reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub role: Role,
    /// Null when the turn only calls tools
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingRequest {
    pub model: String,
    pub input: EmbeddingInput,
}

impl EmbeddingRequest {
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(GatewayError::validation("model must not be empty"));
        }
        match &self.input {
            EmbeddingInput::Single(s) if s.is_empty() => {
                Err(GatewayError::validation("input must not be empty"))
            }
            EmbeddingInput::Batch(v) if v.is_empty() => {
                Err(GatewayError::validation("input must contain at least one string"))
            }
            _ => Ok(()),
        }
    }
}

/// A single string or a batch of strings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EmbeddingInput {
    Single(String),
    Batch(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    pub object: String,
    pub data: Vec<EmbeddingData>,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<EmbeddingUsage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingData {
    pub object: String,
    pub embedding: Vec<f32>,
    pub index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingUsage {
    pub prompt_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsResponse {
    pub object: String,
    pub data: Vec<ModelInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chat_request_content_forms() {
        let request: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "acme/main/fast",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": [
                    {"type": "text", "text": "what is this"},
                    {"type": "image_url", "image_url": {"url": "https://example.com/cat.png"}}
                ]},
                {"role": "tool", "content": "42", "tool_call_id": "call_1"}
            ]
        }))
        .unwrap();
        assert!(!request.stream);
        assert_eq!(request.temperature, None);
        assert_eq!(request.messages[0].content, Some(MessageContent::Text("be brief".to_string())));
        match &request.messages[1].content {
            Some(MessageContent::Parts(parts)) => assert_eq!(parts.len(), 2),
            other => panic!("unexpected content {:?}", other),
        }
        assert_eq!(request.messages[2].tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn test_tool_conversation_round_trips_through_request() {
        let request: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "acme/main/fast",
            "messages": [
                {"role": "user", "content": "weather in Paris?"},
                {"role": "assistant", "content": null, "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": {"name": "get_weather", "arguments": "{\"city\":\"Paris\"}"}
                }]},
                {"role": "tool", "content": "{\"temp\":21}", "tool_call_id": "call_1"}
            ],
            "tools": [{"type": "function", "function": {
                "name": "get_weather",
                "parameters": {"type": "object", "properties": {"city": {"type": "string"}}}
            }}],
            "tool_choice": "auto"
        }))
        .unwrap();
        request.validate().unwrap();

        assert_eq!(request.messages[1].content, None);
        let calls = request.messages[1].tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.name, "get_weather");
        assert_eq!(request.tool_choice, Some(ToolChoiceParam::Mode(ToolChoiceMode::Auto)));
        assert_eq!(request.tools.as_ref().unwrap()[0].function.description, None);
    }

    #[test]
    fn test_named_tool_choice() {
        let request: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "acme/main/fast",
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [{"type": "function", "function": {"name": "lookup"}}],
            "tool_choice": {"type": "function", "function": {"name": "lookup"}}
        }))
        .unwrap();
        request.validate().unwrap();
        assert_eq!(
            request.tools.as_ref().unwrap()[0].function.parameters,
            json!({"type": "object", "properties": {}})
        );

        let mut undeclared = request.clone();
        undeclared.tools = None;
        assert!(undeclared.validate().is_err());

        assert!(serde_json::from_value::<ToolChoiceParam>(json!("sometimes")).is_err());
    }

    #[test]
    fn test_null_content_needs_tool_calls() {
        let request: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "acme/main/fast",
            "messages": [{"role": "assistant", "content": null}]
        }))
        .unwrap();
        assert!(request.validate().is_err());

        let request: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "acme/main/fast",
            "messages": [{"role": "tool", "content": "42"}]
        }))
        .unwrap();
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_assistant_message_serializes_null_content() {
        let message = AssistantMessage {
            role: Role::Assistant,
            content: None,
            tool_calls: Some(vec![ToolCall {
                id: "call_1".to_string(),
                kind: "function".to_string(),
                function: FunctionCall { name: "f".to_string(), arguments: "{}".to_string() },
            }]),
            reasoning_content: None,
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["content"], Value::Null);
        assert_eq!(value["tool_calls"][0]["type"], "function");
        assert!(value.get("reasoning_content").is_none());
    }

    #[test]
    fn test_chat_request_rejects_unknown_role() {
        let result = serde_json::from_value::<ChatCompletionRequest>(json!({
            "model": "acme/main/fast",
            "messages": [{"role": "developer", "content": "hi"}]
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_temperature_range() {
        let mut request: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "acme/main/fast",
            "messages": [{"role": "user", "content": "hi"}],
            "temperature": 2.5
        }))
        .unwrap();
        assert!(request.validate().is_err());
        request.temperature = Some(0.0);
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_embedding_input_forms() {
        let single: EmbeddingRequest =
            serde_json::from_value(json!({"model": "a/b/c", "input": "hello"})).unwrap();
        assert_eq!(single.input, EmbeddingInput::Single("hello".to_string()));

        let batch: EmbeddingRequest =
            serde_json::from_value(json!({"model": "a/b/c", "input": ["a", "b"]})).unwrap();
        assert_eq!(batch.input, EmbeddingInput::Batch(vec!["a".to_string(), "b".to_string()]));

        assert!(serde_json::from_value::<EmbeddingRequest>(json!({"model": "a/b/c", "input": 42})).is_err());

        let empty: EmbeddingRequest =
            serde_json::from_value(json!({"model": "a/b/c", "input": []})).unwrap();
        assert!(empty.validate().is_err());
    }
}
