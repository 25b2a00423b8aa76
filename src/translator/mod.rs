// Translation between OpenAI-compatible bodies and the provider-neutral model calls

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{GatewayError, Result};
use crate::openai::{
    AssistantMessage, ChatChoice, ChatCompletionRequest, ChatCompletionResponse, ChatMessage,
    CompletionUsage, ContentPart as WireContentPart, EmbeddingData, EmbeddingInput,
    EmbeddingResponse, EmbeddingUsage, FunctionCall, MessageContent, ToolCall as WireToolCall,
    ToolChoiceMode, ToolChoiceParam, DEFAULT_TEMPERATURE,
};
use crate::providers::{
    ChatModel, ChatParams, ContentPart, EmbeddingModel, ModelMessage, Role, TokenStream, ToolCall,
    ToolChoice, ToolDefinition,
};

/// Outcome of a chat completion call
pub enum ChatOutcome {
    Completion(ChatCompletionResponse),
    /// Text deltas; the upstream call has already been accepted
    Stream(TokenStream),
}

/// Messages, sampling and tool settings of a chat request
pub fn to_chat_params(request: &ChatCompletionRequest) -> Result<ChatParams> {
    let messages = to_model_messages(&request.messages)?;
    let tools = request
        .tools
        .iter()
        .flatten()
        .map(|tool| ToolDefinition {
            name: tool.function.name.clone(),
            description: tool.function.description.clone(),
            parameters: tool.function.parameters.clone(),
        })
        .collect();
    let tool_choice = request.tool_choice.as_ref().map(|choice| match choice {
        ToolChoiceParam::Mode(ToolChoiceMode::None) => ToolChoice::None,
        ToolChoiceParam::Mode(ToolChoiceMode::Auto) => ToolChoice::Auto,
        ToolChoiceParam::Mode(ToolChoiceMode::Required) => ToolChoice::Required,
        ToolChoiceParam::Function(named) => ToolChoice::Function(named.function.name.clone()),
    });

    Ok(ChatParams {
        messages,
        temperature: request.temperature.unwrap_or(DEFAULT_TEMPERATURE),
        tools,
        tool_choice,
    })
}

/// Convert OpenAI-style messages into provider-neutral messages, preserving order.
///
/// Every tool message must answer a tool call made by an earlier assistant message.
pub fn to_model_messages(messages: &[ChatMessage]) -> Result<Vec<ModelMessage>> {
    if messages.is_empty() {
        return Err(GatewayError::bad_request(
            "messages must contain at least one message",
            "invalid_messages",
        ));
    }

    let mut converted = Vec::with_capacity(messages.len());
    for (i, message) in messages.iter().enumerate() {
        let content = match &message.content {
            None => Vec::new(),
            Some(MessageContent::Text(text)) => vec![ContentPart::Text(text.clone())],
            Some(MessageContent::Parts(parts)) if parts.is_empty() => {
                return Err(GatewayError::bad_request(
                    format!("messages[{}].content must not be an empty array", i),
                    "invalid_messages",
                ))
            }
            Some(MessageContent::Parts(parts)) => parts
                .iter()
                .map(|part| match part {
                    WireContentPart::Text { text } => ContentPart::Text(text.clone()),
                    WireContentPart::ImageUrl { image_url } => ContentPart::Image {
                        url: image_url.url.clone(),
                    },
                })
                .collect(),
        };

        let tool_calls = message
            .tool_calls
            .iter()
            .flatten()
            .map(|call| tool_call(i, call))
            .collect::<Result<Vec<_>>>()?;

        let tool_name = match (message.role, message.tool_call_id.as_deref()) {
            (Role::Tool, Some(id)) => {
                let call = answered_call(&messages[..i], id).ok_or_else(|| {
                    GatewayError::bad_request(
                        format!(
                            "messages[{}] answers tool call '{}', which no earlier assistant message made",
                            i, id
                        ),
                        "invalid_messages",
                    )
                })?;
                Some(call.function.name.clone())
            }
            _ => None,
        };

        converted.push(ModelMessage {
            role: message.role,
            content,
            name: message.name.clone(),
            tool_call_id: message.tool_call_id.clone(),
            tool_calls,
            tool_name,
        });
    }
    Ok(converted)
}

fn answered_call<'a>(earlier: &'a [ChatMessage], id: &str) -> Option<&'a WireToolCall> {
    earlier
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .flat_map(|m| m.tool_calls.iter().flatten())
        .find(|call| call.id == id)
}

fn tool_call(index: usize, call: &WireToolCall) -> Result<ToolCall> {
    let arguments = if call.function.arguments.trim().is_empty() {
        Value::Object(Default::default())
    } else {
        serde_json::from_str(&call.function.arguments).map_err(|e| {
            GatewayError::bad_request(
                format!(
                    "messages[{}]: arguments of tool call '{}' are not valid JSON: {}",
                    index, call.id, e
                ),
                "invalid_messages",
            )
        })?
    };
    Ok(ToolCall {
        id: call.id.clone(),
        name: call.function.name.clone(),
        arguments,
    })
}

fn wire_tool_call(call: &ToolCall) -> WireToolCall {
    let arguments = match &call.arguments {
        Value::String(raw) => raw.clone(),
        other => other.to_string(),
    };
    WireToolCall {
        id: call.id.clone(),
        kind: "function".to_string(),
        function: FunctionCall {
            name: call.name.clone(),
            arguments,
        },
    }
}

/// Run a chat completion and shape the result for the client.
///
/// `model_name` is echoed back verbatim in the response body.
pub async fn chat_completion(
    model: &dyn ChatModel,
    model_name: &str,
    params: &ChatParams,
    stream: bool,
) -> Result<ChatOutcome> {
    tracing::debug!(
        "Calling upstream model {} ({} messages, {} tools, stream: {})",
        model.model_id(),
        params.messages.len(),
        params.tools.len(),
        stream
    );

    if stream {
        let tokens = model.stream(params).await?;
        return Ok(ChatOutcome::Stream(tokens));
    }

    let generation = model.generate(params).await?;
    let usage = generation.usage.map(|u| {
        let prompt_tokens = u.input_tokens.unwrap_or(0);
        let completion_tokens = u.output_tokens.unwrap_or(0);
        CompletionUsage {
            prompt_tokens,
            completion_tokens,
            total_tokens: u.total_tokens.unwrap_or(prompt_tokens + completion_tokens),
        }
    });

    // Content is null on turns that call tools
    let (content, tool_calls) = if generation.tool_calls.is_empty() {
        (Some(generation.text), None)
    } else {
        (None, Some(generation.tool_calls.iter().map(wire_tool_call).collect()))
    };

    Ok(ChatOutcome::Completion(ChatCompletionResponse {
        id: format!("chatcmpl-{}", Uuid::new_v4()),
        object: "chat.completion".to_string(),
        created: Utc::now().timestamp(),
        model: model_name.to_string(),
        choices: vec![ChatChoice {
            index: 0,
            message: AssistantMessage {
                role: Role::Assistant,
                content,
                tool_calls,
                reasoning_content: generation.reasoning,
            },
            finish_reason: generation.finish_reason.as_str().to_string(),
        }],
        usage,
    }))
}

/// Embed a single string or a batch; results keep input order
pub async fn embedding(
    model: &dyn EmbeddingModel,
    model_name: &str,
    input: &EmbeddingInput,
) -> Result<EmbeddingResponse> {
    tracing::debug!("Calling upstream embedding model {}", model.model_id());
    let (embeddings, expected) = match input {
        EmbeddingInput::Single(value) => (model.embed(value).await?, 1),
        EmbeddingInput::Batch(values) => (model.embed_many(values).await?, values.len()),
    };

    if embeddings.vectors.len() != expected {
        return Err(GatewayError::internal(format!(
            "provider returned {} embeddings for {} inputs",
            embeddings.vectors.len(),
            expected
        )));
    }

    let data = embeddings
        .vectors
        .into_iter()
        .enumerate()
        .map(|(index, embedding)| EmbeddingData {
            object: "embedding".to_string(),
            embedding,
            index,
        })
        .collect();

    Ok(EmbeddingResponse {
        object: "list".to_string(),
        data,
        model: model_name.to_string(),
        usage: embeddings.tokens.map(|tokens| EmbeddingUsage {
            prompt_tokens: tokens,
            total_tokens: tokens,
        }),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::openai::{FunctionDefinition, ImageUrl, NamedToolChoice, FunctionName, Tool};
    use crate::providers::{Embeddings, FinishReason, Generation, Usage};
    use async_trait::async_trait;
    use futures::StreamExt;
    use parking_lot::Mutex;
    use serde_json::json;

    /// Chat model that answers with a fixed generation and records what it was sent
    pub(crate) struct EchoModel {
        pub reply: Generation,
        pub seen: Mutex<Vec<ChatParams>>,
    }

    impl EchoModel {
        pub(crate) fn new(reply: &str) -> Self {
            Self {
                reply: Generation {
                    text: reply.to_string(),
                    ..Default::default()
                },
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChatModel for EchoModel {
        fn model_id(&self) -> &str {
            "echo"
        }

        async fn generate(&self, params: &ChatParams) -> Result<Generation> {
            self.seen.lock().push(params.clone());
            Ok(self.reply.clone())
        }

        async fn stream(&self, params: &ChatParams) -> Result<TokenStream> {
            self.seen.lock().push(params.clone());
            let tokens: Vec<Result<String>> = self
                .reply
                .text
                .split_inclusive(' ')
                .map(|t| Ok(t.to_string()))
                .collect();
            Ok(Box::pin(futures::stream::iter(tokens)))
        }
    }

    /// Embedding model producing `[index, len]` vectors
    pub(crate) struct LengthEmbedder;

    #[async_trait]
    impl EmbeddingModel for LengthEmbedder {
        fn model_id(&self) -> &str {
            "length"
        }

        async fn embed_many(&self, values: &[String]) -> Result<Embeddings> {
            Ok(Embeddings {
                vectors: values
                    .iter()
                    .enumerate()
                    .map(|(i, v)| vec![i as f32, v.len() as f32])
                    .collect(),
                tokens: Some(values.len() as u64),
            })
        }
    }

    fn user(text: &str) -> ChatMessage {
        ChatMessage {
            role: Role::User,
            content: Some(MessageContent::Text(text.to_string())),
            name: None,
            tool_call_id: None,
            tool_calls: None,
        }
    }

    fn calls_weather(id: &str) -> ChatMessage {
        ChatMessage {
            role: Role::Assistant,
            content: None,
            tool_calls: Some(vec![WireToolCall {
                id: id.to_string(),
                kind: "function".to_string(),
                function: FunctionCall {
                    name: "get_weather".to_string(),
                    arguments: r#"{"city":"Paris"}"#.to_string(),
                },
            }]),
            ..user("")
        }
    }

    fn answers(id: &str, output: &str) -> ChatMessage {
        ChatMessage {
            role: Role::Tool,
            tool_call_id: Some(id.to_string()),
            ..user(output)
        }
    }

    fn params(messages: &[ChatMessage]) -> ChatParams {
        ChatParams::new(to_model_messages(messages).unwrap(), 1.0)
    }

    #[test]
    fn test_to_model_messages_preserves_order() {
        let messages = vec![
            ChatMessage {
                role: Role::System,
                ..user("be brief")
            },
            ChatMessage {
                content: Some(MessageContent::Parts(vec![
                    WireContentPart::Text { text: "look".to_string() },
                    WireContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: "https://example.com/cat.png".to_string(),
                            detail: None,
                        },
                    },
                ])),
                ..user("")
            },
            ChatMessage {
                role: Role::Assistant,
                ..user("a cat")
            },
        ];
        let converted = to_model_messages(&messages).unwrap();
        let roles: Vec<Role> = converted.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant]);
        assert_eq!(
            converted[1].content[1],
            ContentPart::Image { url: "https://example.com/cat.png".to_string() }
        );
    }

    #[test]
    fn test_to_model_messages_rejects_empty() {
        let err = to_model_messages(&[]).unwrap_err();
        assert_eq!(err.status().as_u16(), 400);

        let err = to_model_messages(&[ChatMessage {
            content: Some(MessageContent::Parts(vec![])),
            ..user("")
        }])
        .unwrap_err();
        assert_eq!(err.status().as_u16(), 400);
    }

    #[test]
    fn test_tool_message_is_matched_to_its_call() {
        let converted = to_model_messages(&[
            user("weather in Paris?"),
            calls_weather("call_1"),
            answers("call_1", "21C"),
        ])
        .unwrap();

        assert!(converted[1].content.is_empty());
        assert_eq!(converted[1].tool_calls[0].arguments, json!({"city": "Paris"}));
        assert_eq!(converted[2].tool_name.as_deref(), Some("get_weather"));
        assert_eq!(converted[2].tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn test_unmatched_tool_message_is_bad_request() {
        let err = to_model_messages(&[user("hi"), answers("call_9", "21C")]).unwrap_err();
        assert_eq!(err.status().as_u16(), 400);

        // The call has to come before its answer
        let err = to_model_messages(&[answers("call_1", "21C"), calls_weather("call_1")]).unwrap_err();
        assert_eq!(err.status().as_u16(), 400);
    }

    #[test]
    fn test_invalid_tool_arguments_are_bad_request() {
        let mut call = calls_weather("call_1");
        if let Some(calls) = call.tool_calls.as_mut() {
            calls[0].function.arguments = "{city: Paris".to_string();
        }
        let err = to_model_messages(&[user("hi"), call]).unwrap_err();
        assert_eq!(err.status().as_u16(), 400);
    }

    #[test]
    fn test_to_chat_params_carries_tools() {
        let request = ChatCompletionRequest {
            model: "acme/main/fast".to_string(),
            messages: vec![user("hi")],
            temperature: None,
            stream: false,
            tools: Some(vec![Tool {
                kind: "function".to_string(),
                function: FunctionDefinition {
                    name: "lookup".to_string(),
                    description: Some("Find a record".to_string()),
                    parameters: json!({"type": "object"}),
                },
            }]),
            tool_choice: Some(ToolChoiceParam::Function(NamedToolChoice {
                kind: "function".to_string(),
                function: FunctionName { name: "lookup".to_string() },
            })),
        };
        let params = to_chat_params(&request).unwrap();
        assert_eq!(params.temperature, DEFAULT_TEMPERATURE);
        assert_eq!(params.tools[0].name, "lookup");
        assert_eq!(params.tool_choice, Some(ToolChoice::Function("lookup".to_string())));
    }

    #[tokio::test]
    async fn test_chat_completion_shape() {
        let model = EchoModel::new("world");
        let outcome = chat_completion(&model, "acme/main/fast", &params(&[user("hello")]), false)
            .await
            .unwrap();
        let ChatOutcome::Completion(response) = outcome else {
            panic!("expected a completion");
        };

        assert!(response.id.starts_with("chatcmpl-"));
        assert_eq!(response.object, "chat.completion");
        assert_eq!(response.model, "acme/main/fast");
        assert_eq!(response.choices.len(), 1);
        assert_eq!(response.choices[0].message.role, Role::Assistant);
        assert_eq!(response.choices[0].message.content.as_deref(), Some("world"));
        assert_eq!(response.choices[0].message.tool_calls, None);
        assert_eq!(response.choices[0].finish_reason, "stop");
        assert!(response.usage.is_none());
        assert_eq!(model.seen.lock()[0].temperature, 1.0);
    }

    #[tokio::test]
    async fn test_chat_completion_reports_finish_reason() {
        let mut model = EchoModel::new("cut off mid");
        model.reply.finish_reason = FinishReason::Length;
        let ChatOutcome::Completion(response) = chat_completion(&model, "a/b/c", &params(&[user("hi")]), false)
            .await
            .unwrap()
        else {
            panic!("expected a completion");
        };
        assert_eq!(response.choices[0].finish_reason, "length");
    }

    #[tokio::test]
    async fn test_chat_completion_with_tool_calls() {
        let mut model = EchoModel::new("");
        model.reply.finish_reason = FinishReason::ToolCalls;
        model.reply.reasoning = Some("need the forecast".to_string());
        model.reply.tool_calls = vec![ToolCall {
            id: "call_7".to_string(),
            name: "get_weather".to_string(),
            arguments: json!({"city": "Oslo"}),
        }];

        let ChatOutcome::Completion(response) = chat_completion(&model, "a/b/c", &params(&[user("hi")]), false)
            .await
            .unwrap()
        else {
            panic!("expected a completion");
        };
        let body = serde_json::to_value(&response).unwrap();
        assert_eq!(body["choices"][0]["finish_reason"], "tool_calls");
        assert_eq!(body["choices"][0]["message"]["content"], Value::Null);
        assert_eq!(body["choices"][0]["message"]["reasoning_content"], "need the forecast");
        assert_eq!(
            body["choices"][0]["message"]["tool_calls"],
            json!([{"id": "call_7", "type": "function",
                    "function": {"name": "get_weather", "arguments": "{\"city\":\"Oslo\"}"}}])
        );
    }

    #[tokio::test]
    async fn test_chat_completion_total_tokens_fallback() {
        let mut model = EchoModel::new("world");
        model.reply.usage = Some(Usage {
            input_tokens: Some(3),
            output_tokens: Some(2),
            total_tokens: None,
        });
        let ChatOutcome::Completion(response) = chat_completion(&model, "a/b/c", &params(&[user("hello")]), false)
            .await
            .unwrap()
        else {
            panic!("expected a completion");
        };
        assert_eq!(
            response.usage,
            Some(CompletionUsage { prompt_tokens: 3, completion_tokens: 2, total_tokens: 5 })
        );
    }

    #[tokio::test]
    async fn test_chat_completion_stream() {
        let model = EchoModel::new("hello big world");
        let ChatOutcome::Stream(tokens) = chat_completion(&model, "a/b/c", &params(&[user("hi")]), true)
            .await
            .unwrap()
        else {
            panic!("expected a stream");
        };
        let tokens: Vec<String> = tokens.map(|t| t.unwrap()).collect().await;
        assert_eq!(tokens.concat(), "hello big world");
    }

    #[tokio::test]
    async fn test_embedding_batch_keeps_order() {
        let input = EmbeddingInput::Batch(vec!["a".to_string(), "bb".to_string(), "ccc".to_string()]);
        let response = embedding(&LengthEmbedder, "acme/main/embed", &input).await.unwrap();

        assert_eq!(response.object, "list");
        assert_eq!(response.model, "acme/main/embed");
        let indices: Vec<usize> = response.data.iter().map(|d| d.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(response.data[2].embedding, vec![2.0, 3.0]);
        assert_eq!(response.usage.unwrap().total_tokens, 3);
    }

    #[tokio::test]
    async fn test_embedding_single_is_one_element_list() {
        let input = EmbeddingInput::Single("hello".to_string());
        let response = embedding(&LengthEmbedder, "a/b/c", &input).await.unwrap();
        assert_eq!(response.data.len(), 1);
        assert_eq!(response.data[0].index, 0);
        assert_eq!(response.data[0].embedding, vec![0.0, 5.0]);
    }
}
