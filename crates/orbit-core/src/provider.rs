// Provider adapter contract
//
// One adapter per LLM vendor. An adapter translates its vendor's native
// streaming wire format (chunked deltas, content-block events, iterator
// responses) into canonical StreamEvents so the orchestrator consumes
// every vendor identically.
//
// Adapter obligations:
// - accumulate vendor-native fragments into complete values and emit the
//   *Complete events only once fully assembled
// - emit a Usage snapshot whenever new counts are known, not only at the end
// - emit exactly one StreamEnd (or set the stream error) before the event
//   channel closes, even if the vendor connection drops mid-stream
// - StreamEnd repeats the final usage for convenience; consumers fold Usage
//   events only, so snapshots must be disjoint or deltas

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AgentError, Result};
use crate::events::StreamEvent;
use crate::message::{FinishReason, Message, ToolCall, Usage};
use crate::stream::EventStream;

/// Provider-facing tool declaration, produced from a registry snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Tool name (used by the model to invoke it)
    pub name: String,
    /// Tool description for the model
    pub description: String,
    /// JSON schema for the tool's parameters
    pub parameters: Value,
}

/// A single generation request, built fresh for every step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    /// Model identifier (e.g. "gpt-4o", "claude-sonnet-4-20250514")
    pub model: String,

    /// System prompt, sent the way the vendor expects it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Conversation history for this turn
    pub messages: Vec<Message>,

    /// Tools the model may call
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSpec>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl GenerateRequest {
    /// Create a request with just a model and message history
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            system_prompt: None,
            messages,
            tools: Vec::new(),
            temperature: None,
            max_tokens: None,
        }
    }
}

/// A complete (non-streaming) generation response
#[derive(Debug, Clone, Default)]
pub struct GenerateResponse {
    /// Assistant text
    pub content: String,
    /// Tool calls requested by the model
    pub tool_calls: Vec<ToolCall>,
    /// Token usage for the turn
    pub usage: Usage,
    /// Why generation stopped
    pub finish_reason: Option<FinishReason>,
}

/// Static adapter capabilities, used for validation only
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Capabilities {
    pub supports_tools: bool,
    pub supports_streaming: bool,
    pub supports_vision: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_context_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            supports_tools: true,
            supports_streaming: true,
            supports_vision: false,
            max_context_tokens: None,
            max_output_tokens: None,
        }
    }
}

/// Trait for LLM provider adapters
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable adapter identifier (e.g. the default model id)
    fn id(&self) -> &str;

    /// Vendor name (e.g. "openai", "anthropic")
    fn provider_name(&self) -> &str;

    /// Static capability descriptor
    fn capabilities(&self) -> Capabilities;

    /// Stream canonical events for one turn
    async fn stream(&self, request: GenerateRequest) -> Result<EventStream>;

    /// Whole-response generation (convenience: folds the stream)
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse> {
        let mut stream = self.stream(request).await?;
        let mut response = GenerateResponse::default();
        let mut complete_text = None;

        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::TextDelta { delta, .. } => response.content.push_str(&delta),
                StreamEvent::TextComplete { text, .. } => complete_text = Some(text),
                StreamEvent::ToolCallComplete { tool_call, .. } => {
                    response.tool_calls.push(tool_call)
                }
                StreamEvent::Usage { usage, .. } => response.usage.add(&usage),
                StreamEvent::FinishReason { reason, .. } => {
                    response.finish_reason = Some(reason)
                }
                StreamEvent::StreamEnd { reason, .. } => {
                    if response.finish_reason.is_none() {
                        response.finish_reason = reason;
                    }
                }
                _ => {}
            }
        }

        if let Some(err) = stream.take_error() {
            return Err(err);
        }
        if let Some(text) = complete_text {
            response.content = text;
        }
        Ok(response)
    }
}

/// Implement Provider for Box<dyn Provider> to allow dynamic dispatch
#[async_trait]
impl Provider for Box<dyn Provider> {
    fn id(&self) -> &str {
        (**self).id()
    }

    fn provider_name(&self) -> &str {
        (**self).provider_name()
    }

    fn capabilities(&self) -> Capabilities {
        (**self).capabilities()
    }

    async fn stream(&self, request: GenerateRequest) -> Result<EventStream> {
        (**self).stream(request).await
    }

    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse> {
        (**self).generate(request).await
    }
}

/// Validate a request against static adapter capabilities.
///
/// Used by the orchestrator before the first step; capabilities never
/// influence behavior inside the loop.
pub fn validate_request(capabilities: &Capabilities, request: &GenerateRequest) -> Result<()> {
    if !request.tools.is_empty() && !capabilities.supports_tools {
        return Err(AgentError::config(
            "provider does not support tool calling but tools are registered",
        ));
    }
    if let (Some(max), Some(requested)) =
        (capabilities.max_output_tokens, request.max_tokens)
    {
        if requested > max {
            return Err(AgentError::config(format!(
                "max_tokens {} exceeds the provider output ceiling {}",
                requested, max
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_tools_without_support() {
        let capabilities = Capabilities {
            supports_tools: false,
            ..Capabilities::default()
        };
        let mut request = GenerateRequest::new("m", Vec::new());
        request.tools.push(ToolSpec {
            name: "echo".into(),
            description: "echo".into(),
            parameters: serde_json::json!({"type": "object"}),
        });

        assert!(validate_request(&capabilities, &request).is_err());
    }

    #[test]
    fn test_validate_output_ceiling() {
        let capabilities = Capabilities {
            max_output_tokens: Some(1024),
            ..Capabilities::default()
        };
        let mut request = GenerateRequest::new("m", Vec::new());
        request.max_tokens = Some(4096);
        assert!(validate_request(&capabilities, &request).is_err());

        request.max_tokens = Some(512);
        assert!(validate_request(&capabilities, &request).is_ok());
    }
}
