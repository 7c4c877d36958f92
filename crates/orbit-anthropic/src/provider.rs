// Anthropic Messages adapter
//
// Translates Messages API streaming (message_start, content_block_*,
// message_delta, message_stop) into canonical events. tool_use input
// arrives as input_json_delta fragments per content-block index and is
// accumulated until the block stops.
//
// Usage snapshots are disjoint: input tokens arrive on message_start,
// output tokens on message_delta, so folding every snapshot yields the
// turn total.

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::Client;
use serde_json::json;
use std::collections::HashMap;
use tracing::debug;

use orbit_core::error::{AgentError, Result};
use orbit_core::events::StreamEvent;
use orbit_core::message::{FinishReason, MessageRole, ToolCall, Usage};
use orbit_core::provider::{Capabilities, GenerateRequest, Provider, ToolSpec};
use orbit_core::stream::{event_channel, EventEmitter, EventStream};

use crate::types::{
    AnthropicBlockDelta, AnthropicContentBlock, AnthropicContentPart, AnthropicMessage,
    AnthropicRequest, AnthropicStreamEvent, AnthropicTool,
};

const DEFAULT_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// The API requires max_tokens; used when the request leaves it unset
const DEFAULT_MAX_TOKENS: u32 = 4096;

const STREAM_CAPACITY: usize = 32;

/// Anthropic Messages provider
#[derive(Clone)]
pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    api_url: String,
    default_model: String,
}

impl AnthropicProvider {
    /// Create a new provider with the given API key
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            api_url: DEFAULT_API_URL.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
        }
    }

    /// Create a new provider from the ANTHROPIC_API_KEY environment variable
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("ANTHROPIC_API_KEY").map_err(|_| {
            AgentError::provider("ANTHROPIC_API_KEY environment variable not set")
        })?;
        Ok(Self::new(api_key))
    }

    /// Create a new provider with a custom API URL
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

    /// Build the wire request. System-role history messages fold into the
    /// system parameter since the Messages API has no system role.
    fn convert_request(request: &GenerateRequest) -> AnthropicRequest {
        let mut system = request.system_prompt.clone().unwrap_or_default();
        let mut messages = Vec::with_capacity(request.messages.len());

        for message in &request.messages {
            match message.role {
                MessageRole::System => {
                    if !system.is_empty() {
                        system.push_str("\n\n");
                    }
                    system.push_str(&message.content);
                }
                MessageRole::User => messages.push(AnthropicMessage {
                    role: "user",
                    content: vec![AnthropicContentPart::Text {
                        text: message.content.clone(),
                    }],
                }),
                MessageRole::Assistant => {
                    let mut content = Vec::new();
                    if !message.content.is_empty() {
                        content.push(AnthropicContentPart::Text {
                            text: message.content.clone(),
                        });
                    }
                    for call in &message.tool_calls {
                        content.push(AnthropicContentPart::ToolUse {
                            id: call.id.clone(),
                            name: call.name.clone(),
                            input: call.arguments.clone(),
                        });
                    }
                    if !content.is_empty() {
                        messages.push(AnthropicMessage {
                            role: "assistant",
                            content,
                        });
                    }
                }
                // Tool results ride in a user-role message.
                MessageRole::Tool => {
                    let content: Vec<AnthropicContentPart> = message
                        .tool_results
                        .iter()
                        .map(|result| AnthropicContentPart::ToolResult {
                            tool_use_id: result.tool_call_id.clone(),
                            content: result.content.clone(),
                            is_error: result.is_error,
                        })
                        .collect();
                    if !content.is_empty() {
                        messages.push(AnthropicMessage {
                            role: "user",
                            content,
                        });
                    }
                }
            }
        }

        AnthropicRequest {
            model: request.model.clone(),
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            system: if system.is_empty() { None } else { Some(system) },
            messages,
            temperature: request.temperature,
            tools: if request.tools.is_empty() {
                None
            } else {
                Some(
                    request
                        .tools
                        .iter()
                        .map(|tool: &ToolSpec| AnthropicTool {
                            name: tool.name.clone(),
                            description: tool.description.clone(),
                            input_schema: tool.parameters.clone(),
                        })
                        .collect(),
                )
            },
            stream: true,
        }
    }
}

fn map_stop_reason(reason: &str) -> Option<FinishReason> {
    match reason {
        "end_turn" | "stop_sequence" | "pause_turn" => Some(FinishReason::Stop),
        "max_tokens" => Some(FinishReason::Length),
        "tool_use" => Some(FinishReason::ToolCalls),
        "refusal" => Some(FinishReason::ContentFilter),
        _ => None,
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn id(&self) -> &str {
        &self.default_model
    }

    fn provider_name(&self) -> &str {
        "anthropic"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_tools: true,
            supports_streaming: true,
            supports_vision: true,
            max_context_tokens: Some(200_000),
            max_output_tokens: Some(64_000),
        }
    }

    async fn stream(&self, request: GenerateRequest) -> Result<EventStream> {
        let body = Self::convert_request(&request);

        let response = self
            .client
            .post(&self.api_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::provider(format!("failed to send request: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(AgentError::provider(format!(
                "Anthropic API error ({}): {}",
                status, error_text
            )));
        }

        let (emitter, stream) = event_channel(STREAM_CAPACITY);
        let model = request.model;
        let sse = Box::pin(response.bytes_stream().eventsource());

        tokio::spawn(async move {
            if let Err(err) = decode_stream(sse, &emitter, &model).await {
                if !matches!(err, AgentError::EventEmission(_)) {
                    emitter.set_error(err);
                }
            }
        });

        Ok(stream)
    }
}

impl std::fmt::Debug for AnthropicProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicProvider")
            .field("api_url", &self.api_url)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

struct ToolUseBlock {
    id: String,
    name: String,
    input_json: String,
}

async fn decode_stream<S, E>(mut sse: S, emitter: &EventEmitter, model: &str) -> Result<()>
where
    S: futures::Stream<Item = std::result::Result<eventsource_stream::Event, E>> + Unpin,
    E: std::fmt::Display,
{
    let mut text = String::new();
    let mut text_completed = false;
    let mut tool_blocks: HashMap<usize, ToolUseBlock> = HashMap::new();
    let mut finished: Option<FinishReason> = None;
    let mut cumulative = Usage::default();

    while let Some(item) = sse.next().await {
        let event = item.map_err(|e| AgentError::provider(format!("stream error: {}", e)))?;
        if event.data.is_empty() {
            continue;
        }

        let parsed: AnthropicStreamEvent = serde_json::from_str(&event.data)
            .map_err(|e| AgentError::provider(format!("failed to parse event: {}", e)))?;

        match parsed {
            AnthropicStreamEvent::MessageStart { message } => {
                emitter
                    .emit(StreamEvent::stream_start(
                        message.model.as_deref().unwrap_or(model),
                        Some(message.id),
                    ))
                    .await?;
                if let Some(input) = message.usage {
                    let usage = Usage {
                        prompt_tokens: input.input_tokens,
                        total_tokens: input.input_tokens,
                        cached_input_tokens: input.cache_read_input_tokens,
                        ..Usage::default()
                    };
                    cumulative.add(&usage);
                    emitter.emit(StreamEvent::usage(usage)).await?;
                }
            }
            AnthropicStreamEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                AnthropicContentBlock::Text { text: initial } => {
                    if !initial.is_empty() {
                        text.push_str(&initial);
                        emitter.emit(StreamEvent::text_delta(initial)).await?;
                    }
                }
                AnthropicContentBlock::ToolUse { id, name } => {
                    emitter
                        .emit(StreamEvent::tool_call_start(&id, &name))
                        .await?;
                    tool_blocks.insert(
                        index,
                        ToolUseBlock {
                            id,
                            name,
                            input_json: String::new(),
                        },
                    );
                }
                AnthropicContentBlock::Other => {
                    debug!(index, "ignoring unsupported content block");
                }
            },
            AnthropicStreamEvent::ContentBlockDelta { index, delta } => match delta {
                AnthropicBlockDelta::TextDelta { text: delta_text } => {
                    text.push_str(&delta_text);
                    emitter.emit(StreamEvent::text_delta(delta_text)).await?;
                }
                AnthropicBlockDelta::InputJsonDelta { partial_json } => {
                    if let Some(block) = tool_blocks.get_mut(&index) {
                        block.input_json.push_str(&partial_json);
                        let id = block.id.clone();
                        emitter
                            .emit(StreamEvent::tool_call_delta(id, partial_json))
                            .await?;
                    }
                }
                AnthropicBlockDelta::Other => {}
            },
            AnthropicStreamEvent::ContentBlockStop { index } => {
                if let Some(block) = tool_blocks.remove(&index) {
                    let arguments = if block.input_json.trim().is_empty() {
                        json!({})
                    } else {
                        match serde_json::from_str(&block.input_json) {
                            Ok(value) => value,
                            Err(e) => {
                                emitter
                                    .emit(StreamEvent::warning(format!(
                                        "malformed input for tool call {}: {}",
                                        block.id, e
                                    )))
                                    .await?;
                                json!({})
                            }
                        }
                    };
                    emitter
                        .emit(StreamEvent::tool_call_complete(ToolCall::new(
                            block.id, block.name, arguments,
                        )))
                        .await?;
                }
            }
            AnthropicStreamEvent::MessageDelta { delta, usage } => {
                if !text.is_empty() && !text_completed {
                    text_completed = true;
                    emitter.emit(StreamEvent::text_complete(text.clone())).await?;
                }
                if let Some(output) = usage {
                    let usage = Usage {
                        completion_tokens: output.output_tokens,
                        total_tokens: output.output_tokens,
                        ..Usage::default()
                    };
                    cumulative.add(&usage);
                    emitter.emit(StreamEvent::usage(usage)).await?;
                }
                if let Some(reason) = delta.stop_reason.as_deref() {
                    let mapped = match map_stop_reason(reason) {
                        Some(mapped) => mapped,
                        None => {
                            emitter
                                .emit(StreamEvent::warning(format!(
                                    "unknown stop reason: {}",
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
            AnthropicStreamEvent::MessageStop => {
                emitter
                    .emit(StreamEvent::stream_end(finished, Some(cumulative)))
                    .await?;
                return Ok(());
            }
            AnthropicStreamEvent::Ping => {}
            AnthropicStreamEvent::Error { error } => {
                return Err(AgentError::provider(format!(
                    "Anthropic stream error ({}): {}",
                    error.r#type, error.message
                )));
            }
        }
    }

    // The vendor closed the connection without message_stop.
    match finished {
        Some(_) => {
            emitter
                .emit(StreamEvent::stream_end(finished, Some(cumulative)))
                .await?;
            Ok(())
        }
        None => Err(AgentError::provider("stream ended unexpectedly")),
    }
}
