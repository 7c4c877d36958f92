// OpenAI Chat Completions adapter
//
// Translates the Chat Completions SSE stream into canonical events.
// Tool-call argument fragments arrive interleaved per choice index and
// are accumulated until the finish chunk, at which point each call is
// finalized with parsed arguments.

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::Client;
use serde_json::json;
use tracing::debug;

use orbit_core::error::{AgentError, Result};
use orbit_core::events::StreamEvent;
use orbit_core::message::{FinishReason, MessageRole, ToolCall, Usage};
use orbit_core::provider::{Capabilities, GenerateRequest, Provider, ToolSpec};
use orbit_core::stream::{event_channel, EventEmitter, EventStream};

use crate::types::{
    OpenAiFunction, OpenAiFunctionCall, OpenAiMessage, OpenAiRequest, OpenAiStreamChunk,
    OpenAiStreamOptions, OpenAiTool, OpenAiToolCall, OpenAiUsage,
};

const DEFAULT_API_URL: &str = "https://api.openai.com/v1/chat/completions";
const DEFAULT_MODEL: &str = "gpt-4o";

/// Adapter capacity for the decode channel
const STREAM_CAPACITY: usize = 32;

/// OpenAI Chat Completions provider
///
/// # Example
///
/// ```ignore
/// use orbit_openai::OpenAiProvider;
///
/// let provider = OpenAiProvider::from_env()?;
/// // or
/// let provider = OpenAiProvider::new("your-api-key");
/// // or with a compatible endpoint
/// let provider = OpenAiProvider::with_base_url("key", "https://api.example.com/v1/chat/completions");
/// ```
#[derive(Clone)]
pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    api_url: String,
    default_model: String,
}

impl OpenAiProvider {
    /// Create a new provider with the given API key
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            api_url: DEFAULT_API_URL.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
        }
    }

    /// Create a new provider from the OPENAI_API_KEY environment variable
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| AgentError::provider("OPENAI_API_KEY environment variable not set"))?;
        Ok(Self::new(api_key))
    }

    /// Create a new provider with a custom API URL (for compatible APIs)
    pub fn with_base_url(api_key: impl Into<String>, api_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            api_url: api_url.into(),
            default_model: DEFAULT_MODEL.to_string(),
        }
    }

    /// Override the model reported as this adapter's id
    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    fn convert_messages(request: &GenerateRequest) -> Vec<OpenAiMessage> {
        let mut out = Vec::with_capacity(request.messages.len() + 1);

        if let Some(system) = &request.system_prompt {
            out.push(OpenAiMessage {
                role: "system",
                content: Some(system.clone()),
                tool_calls: None,
                tool_call_id: None,
            });
        }

        for message in &request.messages {
            match message.role {
                MessageRole::System => out.push(OpenAiMessage {
                    role: "system",
                    content: Some(message.content.clone()),
                    tool_calls: None,
                    tool_call_id: None,
                }),
                MessageRole::User => out.push(OpenAiMessage {
                    role: "user",
                    content: Some(message.content.clone()),
                    tool_calls: None,
                    tool_call_id: None,
                }),
                MessageRole::Assistant => {
                    let tool_calls = if message.tool_calls.is_empty() {
                        None
                    } else {
                        Some(
                            message
                                .tool_calls
                                .iter()
                                .map(|call| OpenAiToolCall {
                                    id: call.id.clone(),
                                    r#type: "function",
                                    function: OpenAiFunctionCall {
                                        name: call.name.clone(),
                                        arguments: serde_json::to_string(&call.arguments)
                                            .unwrap_or_default(),
                                    },
                                })
                                .collect(),
                        )
                    };
                    let content = if message.content.is_empty() && tool_calls.is_some() {
                        None
                    } else {
                        Some(message.content.clone())
                    };
                    out.push(OpenAiMessage {
                        role: "assistant",
                        content,
                        tool_calls,
                        tool_call_id: None,
                    });
                }
                // One wire message per result: the API correlates each by
                // tool_call_id.
                MessageRole::Tool => {
                    for result in &message.tool_results {
                        out.push(OpenAiMessage {
                            role: "tool",
                            content: Some(result.content.clone()),
                            tool_calls: None,
                            tool_call_id: Some(result.tool_call_id.clone()),
                        });
                    }
                }
            }
        }

        out
    }

    fn convert_tools(tools: &[ToolSpec]) -> Vec<OpenAiTool> {
        tools
            .iter()
            .map(|tool| OpenAiTool {
                r#type: "function",
                function: OpenAiFunction {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: tool.parameters.clone(),
                },
            })
            .collect()
    }
}

fn map_finish_reason(reason: &str) -> Option<FinishReason> {
    match reason {
        "stop" => Some(FinishReason::Stop),
        "length" => Some(FinishReason::Length),
        "tool_calls" | "function_call" => Some(FinishReason::ToolCalls),
        "content_filter" => Some(FinishReason::ContentFilter),
        _ => None,
    }
}

fn convert_usage(usage: &OpenAiUsage) -> Usage {
    Usage {
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
        reasoning_tokens: usage
            .completion_tokens_details
            .as_ref()
            .map(|d| d.reasoning_tokens)
            .unwrap_or(0),
        cached_input_tokens: usage
            .prompt_tokens_details
            .as_ref()
            .map(|d| d.cached_tokens)
            .unwrap_or(0),
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn id(&self) -> &str {
        &self.default_model
    }

    fn provider_name(&self) -> &str {
        "openai"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_tools: true,
            supports_streaming: true,
            supports_vision: true,
            max_context_tokens: Some(128_000),
            max_output_tokens: Some(16_384),
        }
    }

    async fn stream(&self, request: GenerateRequest) -> Result<EventStream> {
        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(Self::convert_tools(&request.tools))
        };

        let body = OpenAiRequest {
            model: request.model.clone(),
            messages: Self::convert_messages(&request),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream: true,
            stream_options: OpenAiStreamOptions {
                include_usage: true,
            },
            tools,
        };

        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::provider(format!("failed to send request: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(AgentError::provider(format!(
                "OpenAI API error ({}): {}",
                status, error_text
            )));
        }

        let (emitter, stream) = event_channel(STREAM_CAPACITY);
        let model = request.model;
        let sse = Box::pin(response.bytes_stream().eventsource());

        tokio::spawn(async move {
            if let Err(err) = decode_stream(sse, &emitter, &model).await {
                // A closed receiver just means the caller stopped
                // listening; anything else is a vendor failure.
                if !matches!(err, AgentError::EventEmission(_)) {
                    emitter.set_error(err);
                }
            }
        });

        Ok(stream)
    }
}

impl std::fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("api_url", &self.api_url)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

#[derive(Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
    announced: bool,
}

async fn decode_stream<S, E>(
    mut sse: S,
    emitter: &EventEmitter,
    model: &str,
) -> Result<()>
where
    S: futures::Stream<Item = std::result::Result<eventsource_stream::Event, E>> + Unpin,
    E: std::fmt::Display,
{
    let mut text = String::new();
    let mut calls: Vec<PartialToolCall> = Vec::new();
    let mut started = false;
    let mut finished: Option<FinishReason> = None;
    let mut final_usage: Option<Usage> = None;

    while let Some(item) = sse.next().await {
        let event = item.map_err(|e| AgentError::provider(format!("stream error: {}", e)))?;

        if event.data == "[DONE]" {
            emitter
                .emit(StreamEvent::stream_end(finished, final_usage))
                .await?;
            return Ok(());
        }

        let chunk: OpenAiStreamChunk = serde_json::from_str(&event.data)
            .map_err(|e| AgentError::provider(format!("failed to parse chunk: {}", e)))?;

        if !started {
            started = true;
            emitter
                .emit(StreamEvent::stream_start(model, chunk.id.clone()))
                .await?;
        }

        if let Some(usage) = &chunk.usage {
            let usage = convert_usage(usage);
            final_usage = Some(usage);
            emitter.emit(StreamEvent::usage(usage)).await?;
        }

        let Some(choice) = chunk.choices.first() else {
            continue;
        };

        if let Some(tool_calls) = &choice.delta.tool_calls {
            for tc in tool_calls {
                let idx = tc.index as usize;
                while calls.len() <= idx {
                    calls.push(PartialToolCall::default());
                }
                if let Some(id) = &tc.id {
                    calls[idx].id = id.clone();
                }
                let mut fragment = None;
                if let Some(function) = &tc.function {
                    if let Some(name) = &function.name {
                        calls[idx].name.push_str(name);
                    }
                    if let Some(args) = &function.arguments {
                        if !args.is_empty() {
                            calls[idx].arguments.push_str(args);
                            fragment = Some(args.clone());
                        }
                    }
                }
                if !calls[idx].announced && !calls[idx].id.is_empty() && !calls[idx].name.is_empty()
                {
                    calls[idx].announced = true;
                    emitter
                        .emit(StreamEvent::tool_call_start(
                            calls[idx].id.clone(),
                            calls[idx].name.clone(),
                        ))
                        .await?;
                }
                if let Some(fragment) = fragment {
                    emitter
                        .emit(StreamEvent::tool_call_delta(calls[idx].id.clone(), fragment))
                        .await?;
                }
            }
        }

        if let Some(content) = &choice.delta.content {
            if !content.is_empty() {
                text.push_str(content);
                emitter.emit(StreamEvent::text_delta(content.clone())).await?;
            }
        }

        if let Some(reason) = &choice.finish_reason {
            if !text.is_empty() {
                emitter.emit(StreamEvent::text_complete(text.clone())).await?;
            }
            for call in calls.drain(..) {
                let arguments = if call.arguments.trim().is_empty() {
                    json!({})
                } else {
                    match serde_json::from_str(&call.arguments) {
                        Ok(value) => value,
                        Err(e) => {
                            emitter
                                .emit(StreamEvent::warning(format!(
                                    "malformed arguments for tool call {}: {}",
                                    call.id, e
                                )))
                                .await?;
                            json!({})
                        }
                    }
                };
                emitter
                    .emit(StreamEvent::tool_call_complete(ToolCall::new(
                        call.id, call.name, arguments,
                    )))
                    .await?;
            }

            let mapped = match map_finish_reason(reason) {
                Some(mapped) => mapped,
                None => {
                    debug!(reason = %reason, "unknown finish reason");
                    emitter
                        .emit(StreamEvent::warning(format!(
                            "unknown finish reason: {}",
                            reason
                        )))
                        .await?;
                    FinishReason::Stop
                }
            };
            finished = Some(mapped);
            emitter.emit(StreamEvent::finish_reason(mapped)).await?;
        }
    }

    // The vendor closed the connection without [DONE].
    match finished {
        Some(_) => {
            emitter
                .emit(StreamEvent::stream_end(finished, final_usage))
                .await?;
            Ok(())
        }
        None => Err(AgentError::provider("stream ended unexpectedly")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use orbit_core::message::{Message, ToolResult};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sse_body(chunks: &[&str]) -> String {
        let mut body = String::new();
        for chunk in chunks {
            body.push_str("data: ");
            body.push_str(chunk);
            body.push_str("\n\n");
        }
        body.push_str("data: [DONE]\n\n");
        body
    }

    async fn mock_provider(server: &MockServer, body: String) -> OpenAiProvider {
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"),
            )
            .mount(server)
            .await;

        OpenAiProvider::with_base_url(
            "test-key",
            format!("{}/v1/chat/completions", server.uri()),
        )
    }

    #[tokio::test]
    async fn test_text_stream_to_canonical_events() {
        let server = MockServer::start().await;
        let body = sse_body(&[
            r#"{"id":"chatcmpl-1","choices":[{"delta":{"content":"Hel"},"finish_reason":null}]}"#,
            r#"{"id":"chatcmpl-1","choices":[{"delta":{"content":"lo"},"finish_reason":null}]}"#,
            r#"{"id":"chatcmpl-1","choices":[{"delta":{},"finish_reason":"stop"}]}"#,
            r#"{"id":"chatcmpl-1","choices":[],"usage":{"prompt_tokens":5,"completion_tokens":2,"total_tokens":7}}"#,
        ]);
        let provider = mock_provider(&server, body).await;

        let request = GenerateRequest::new("gpt-4o", vec![Message::user("hi")]);
        let stream = provider.stream(request).await.unwrap();
        let (events, error) = stream.collect_events().await;
        assert!(error.is_none());

        assert!(matches!(
            &events[0],
            StreamEvent::StreamStart { request_id: Some(id), .. } if id == "chatcmpl-1"
        ));
        let text: String = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::TextDelta { delta, .. } => Some(delta.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "Hello");
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::TextComplete { text, .. } if text == "Hello")));
        assert!(events.iter().any(|e| matches!(
            e,
            StreamEvent::FinishReason { reason: FinishReason::Stop, .. }
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            StreamEvent::Usage { usage, .. } if usage.total_tokens == 7
        )));
        match events.last().unwrap() {
            StreamEvent::StreamEnd { reason, usage, .. } => {
                assert_eq!(*reason, Some(FinishReason::Stop));
                assert_eq!(usage.unwrap().prompt_tokens, 5);
            }
            other => panic!("expected StreamEnd, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_tool_call_fragment_accumulation() {
        let server = MockServer::start().await;
        let body = sse_body(&[
            r#"{"id":"c2","choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"get_weather","arguments":""}}]},"finish_reason":null}]}"#,
            r#"{"id":"c2","choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"city\":"}}]},"finish_reason":null}]}"#,
            r#"{"id":"c2","choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"Tokyo\"}"}}]},"finish_reason":null}]}"#,
            r#"{"id":"c2","choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
        ]);
        let provider = mock_provider(&server, body).await;

        let request = GenerateRequest::new("gpt-4o", vec![Message::user("weather?")]);
        let stream = provider.stream(request).await.unwrap();
        let (events, error) = stream.collect_events().await;
        assert!(error.is_none());

        let starts: Vec<&StreamEvent> = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::ToolCallStart { .. }))
            .collect();
        assert_eq!(starts.len(), 1);

        let deltas: String = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ToolCallDelta {
                    arguments_delta, ..
                } => Some(arguments_delta.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(deltas, r#"{"city":"Tokyo"}"#);

        let complete = events
            .iter()
            .find_map(|e| match e {
                StreamEvent::ToolCallComplete { tool_call, .. } => Some(tool_call.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(complete.id, "call_1");
        assert_eq!(complete.name, "get_weather");
        assert_eq!(complete.arguments["city"], "Tokyo");

        assert!(events.iter().any(|e| matches!(
            e,
            StreamEvent::FinishReason { reason: FinishReason::ToolCalls, .. }
        )));
    }

    #[tokio::test]
    async fn test_api_error_fails_synchronously() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid key"))
            .mount(&server)
            .await;

        let provider = OpenAiProvider::with_base_url(
            "bad-key",
            format!("{}/v1/chat/completions", server.uri()),
        );
        let err = provider
            .stream(GenerateRequest::new("gpt-4o", Vec::new()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("401"));
    }

    #[tokio::test]
    async fn test_truncated_stream_sets_error() {
        let server = MockServer::start().await;
        // No finish reason and no [DONE]: the connection just ends.
        let body = "data: {\"id\":\"c3\",\"choices\":[{\"delta\":{\"content\":\"par\"},\"finish_reason\":null}]}\n\n".to_string();
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let provider = OpenAiProvider::with_base_url(
            "test-key",
            format!("{}/v1/chat/completions", server.uri()),
        );
        let stream = provider
            .stream(GenerateRequest::new("gpt-4o", Vec::new()))
            .await
            .unwrap();
        let (events, error) = stream.collect_events().await;

        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::TextDelta { .. })));
        assert!(error.unwrap().to_string().contains("unexpectedly"));
    }

    #[tokio::test]
    async fn test_request_wire_shape() {
        let server = MockServer::start().await;
        let body = sse_body(&[
            r#"{"id":"c4","choices":[{"delta":{"content":"ok"},"finish_reason":"stop"}]}"#,
        ]);
        let provider = mock_provider(&server, body).await;

        let mut request = GenerateRequest::new(
            "gpt-4o",
            vec![
                Message::user("run it"),
                Message::assistant_with_tools(
                    "",
                    vec![ToolCall::new("call_1", "echo", serde_json::json!({"message": "x"}))],
                ),
                Message::tool_results(vec![ToolResult::success("call_1", "x")]),
            ],
        );
        request.system_prompt = Some("Be terse.".into());
        request.tools.push(ToolSpec {
            name: "echo".into(),
            description: "Echo".into(),
            parameters: serde_json::json!({"type": "object"}),
        });

        let stream = provider.stream(request).await.unwrap();
        stream.collect_events().await;

        let received = &server.received_requests().await.unwrap()[0];
        let sent: serde_json::Value = serde_json::from_slice(&received.body).unwrap();

        let messages = sent["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[0]["content"], "Be terse.");
        assert_eq!(messages[1]["role"], "user");
        // Assistant tool-call turn: null content, stringified arguments.
        assert_eq!(messages[2]["role"], "assistant");
        assert!(messages[2].get("content").is_none());
        assert_eq!(
            messages[2]["tool_calls"][0]["function"]["arguments"],
            r#"{"message":"x"}"#
        );
        // Tool results expand to one wire message each.
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(messages[3]["tool_call_id"], "call_1");

        assert_eq!(sent["stream"], true);
        assert_eq!(sent["stream_options"]["include_usage"], true);
        assert_eq!(sent["tools"][0]["function"]["name"], "echo");
    }
}
