// Canonical stream events
//
// StreamEvent is the provider-agnostic unit of streaming output. Every
// observable thing that happens during generation, tool execution, plan
// management, or the orchestrator loop is one of these variants. The
// serialized form (`type` tag + `timestamp`) is the engine's only public
// wire contract and must be stable across provider swaps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::{FinishReason, ToolCall, Usage};
use crate::plan::{Plan, PlanStep};

/// Events emitted during generation and loop execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Adapter began producing output for this turn
    StreamStart {
        model: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// Incremental assistant text
    TextDelta {
        delta: String,
        timestamp: DateTime<Utc>,
    },

    /// Final assistant text for this turn
    TextComplete {
        text: String,
        timestamp: DateTime<Utc>,
    },

    /// A tool call started streaming in
    ToolCallStart {
        id: String,
        name: String,
        timestamp: DateTime<Utc>,
    },

    /// An argument fragment arrived for an in-flight tool call
    ToolCallDelta {
        id: String,
        arguments_delta: String,
        timestamp: DateTime<Utc>,
    },

    /// A tool call finished streaming; arguments are fully parsed
    ToolCallComplete {
        tool_call: ToolCall,
        timestamp: DateTime<Utc>,
    },

    /// A (possibly partial, possibly cumulative) token-usage snapshot
    Usage {
        usage: Usage,
        timestamp: DateTime<Utc>,
    },

    /// Why generation stopped for this turn
    FinishReason {
        reason: FinishReason,
        timestamp: DateTime<Utc>,
    },

    /// Adapter finished this turn
    StreamEnd {
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<FinishReason>,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
        timestamp: DateTime<Utc>,
    },

    /// Non-fatal vendor annotation
    Warning {
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// Vendor-specific metadata passed through unchanged
    ProviderMetadata {
        provider: String,
        metadata: Value,
        timestamp: DateTime<Utc>,
    },

    /// Orchestrator started a step
    AgentStepStart {
        step_number: u32,
        timestamp: DateTime<Utc>,
    },

    /// Orchestrator completed a step
    AgentStepComplete {
        step_number: u32,
        content: String,
        tool_call_count: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        finish_reason: Option<FinishReason>,
        timestamp: DateTime<Utc>,
    },

    /// Terminal event: the run is over and the channel will close
    AgentEnded {
        usage: Usage,
        finish_reason: FinishReason,
        timestamp: DateTime<Utc>,
    },

    /// Tool dispatch began
    ToolExecutionStart {
        tool_call_id: String,
        name: String,
        timestamp: DateTime<Utc>,
    },

    /// Tool dispatch finished
    ToolExecutionComplete {
        tool_call_id: String,
        name: String,
        is_error: bool,
        timestamp: DateTime<Utc>,
    },

    /// A plan was created
    PlanCreated {
        plan: Plan,
        timestamp: DateTime<Utc>,
    },

    /// A plan step moved to in-progress
    PlanStepStarted {
        step: PlanStep,
        timestamp: DateTime<Utc>,
    },

    /// A plan step completed
    PlanStepCompleted {
        step: PlanStep,
        timestamp: DateTime<Utc>,
    },

    /// The plan's step list changed
    PlanUpdated {
        plan: Plan,
        timestamp: DateTime<Utc>,
    },

    /// Every plan step is done
    PlanCompleted {
        plan: Plan,
        timestamp: DateTime<Utc>,
    },

    /// A human-input tool call is pausing the conversation
    UserInputRequested {
        tool_call_id: String,
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

impl StreamEvent {
    /// Create a stream start event
    pub fn stream_start(model: impl Into<String>, request_id: Option<String>) -> Self {
        StreamEvent::StreamStart {
            model: model.into(),
            request_id,
            timestamp: Utc::now(),
        }
    }

    /// Create a text delta event
    pub fn text_delta(delta: impl Into<String>) -> Self {
        StreamEvent::TextDelta {
            delta: delta.into(),
            timestamp: Utc::now(),
        }
    }

    /// Create a text complete event
    pub fn text_complete(text: impl Into<String>) -> Self {
        StreamEvent::TextComplete {
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    /// Create a tool call start event
    pub fn tool_call_start(id: impl Into<String>, name: impl Into<String>) -> Self {
        StreamEvent::ToolCallStart {
            id: id.into(),
            name: name.into(),
            timestamp: Utc::now(),
        }
    }

    /// Create a tool call delta event
    pub fn tool_call_delta(id: impl Into<String>, arguments_delta: impl Into<String>) -> Self {
        StreamEvent::ToolCallDelta {
            id: id.into(),
            arguments_delta: arguments_delta.into(),
            timestamp: Utc::now(),
        }
    }

    /// Create a tool call complete event
    pub fn tool_call_complete(tool_call: ToolCall) -> Self {
        StreamEvent::ToolCallComplete {
            tool_call,
            timestamp: Utc::now(),
        }
    }

    /// Create a usage snapshot event
    pub fn usage(usage: Usage) -> Self {
        StreamEvent::Usage {
            usage,
            timestamp: Utc::now(),
        }
    }

    /// Create a finish reason event
    pub fn finish_reason(reason: FinishReason) -> Self {
        StreamEvent::FinishReason {
            reason,
            timestamp: Utc::now(),
        }
    }

    /// Create a stream end event
    pub fn stream_end(reason: Option<FinishReason>, usage: Option<Usage>) -> Self {
        StreamEvent::StreamEnd {
            reason,
            usage,
            timestamp: Utc::now(),
        }
    }

    /// Create a warning event
    pub fn warning(message: impl Into<String>) -> Self {
        StreamEvent::Warning {
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// Create a provider metadata event
    pub fn provider_metadata(provider: impl Into<String>, metadata: Value) -> Self {
        StreamEvent::ProviderMetadata {
            provider: provider.into(),
            metadata,
            timestamp: Utc::now(),
        }
    }

    /// Create a step start event
    pub fn step_start(step_number: u32) -> Self {
        StreamEvent::AgentStepStart {
            step_number,
            timestamp: Utc::now(),
        }
    }

    /// Create a step complete event
    pub fn step_complete(
        step_number: u32,
        content: impl Into<String>,
        tool_call_count: usize,
        finish_reason: Option<FinishReason>,
    ) -> Self {
        StreamEvent::AgentStepComplete {
            step_number,
            content: content.into(),
            tool_call_count,
            finish_reason,
            timestamp: Utc::now(),
        }
    }

    /// Create the terminal event
    pub fn agent_ended(usage: Usage, finish_reason: FinishReason) -> Self {
        StreamEvent::AgentEnded {
            usage,
            finish_reason,
            timestamp: Utc::now(),
        }
    }

    /// Create a tool execution start event
    pub fn tool_execution_start(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        StreamEvent::ToolExecutionStart {
            tool_call_id: tool_call_id.into(),
            name: name.into(),
            timestamp: Utc::now(),
        }
    }

    /// Create a tool execution complete event
    pub fn tool_execution_complete(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        is_error: bool,
    ) -> Self {
        StreamEvent::ToolExecutionComplete {
            tool_call_id: tool_call_id.into(),
            name: name.into(),
            is_error,
            timestamp: Utc::now(),
        }
    }

    /// Create a plan created event
    pub fn plan_created(plan: Plan) -> Self {
        StreamEvent::PlanCreated {
            plan,
            timestamp: Utc::now(),
        }
    }

    /// Create a plan step started event
    pub fn plan_step_started(step: PlanStep) -> Self {
        StreamEvent::PlanStepStarted {
            step,
            timestamp: Utc::now(),
        }
    }

    /// Create a plan step completed event
    pub fn plan_step_completed(step: PlanStep) -> Self {
        StreamEvent::PlanStepCompleted {
            step,
            timestamp: Utc::now(),
        }
    }

    /// Create a plan updated event
    pub fn plan_updated(plan: Plan) -> Self {
        StreamEvent::PlanUpdated {
            plan,
            timestamp: Utc::now(),
        }
    }

    /// Create a plan completed event
    pub fn plan_completed(plan: Plan) -> Self {
        StreamEvent::PlanCompleted {
            plan,
            timestamp: Utc::now(),
        }
    }

    /// Create a user input requested event
    pub fn user_input_requested(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        prompt: Option<String>,
    ) -> Self {
        StreamEvent::UserInputRequested {
            tool_call_id: tool_call_id.into(),
            name: name.into(),
            prompt,
            timestamp: Utc::now(),
        }
    }

    /// The event's creation timestamp
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            StreamEvent::StreamStart { timestamp, .. }
            | StreamEvent::TextDelta { timestamp, .. }
            | StreamEvent::TextComplete { timestamp, .. }
            | StreamEvent::ToolCallStart { timestamp, .. }
            | StreamEvent::ToolCallDelta { timestamp, .. }
            | StreamEvent::ToolCallComplete { timestamp, .. }
            | StreamEvent::Usage { timestamp, .. }
            | StreamEvent::FinishReason { timestamp, .. }
            | StreamEvent::StreamEnd { timestamp, .. }
            | StreamEvent::Warning { timestamp, .. }
            | StreamEvent::ProviderMetadata { timestamp, .. }
            | StreamEvent::AgentStepStart { timestamp, .. }
            | StreamEvent::AgentStepComplete { timestamp, .. }
            | StreamEvent::AgentEnded { timestamp, .. }
            | StreamEvent::ToolExecutionStart { timestamp, .. }
            | StreamEvent::ToolExecutionComplete { timestamp, .. }
            | StreamEvent::PlanCreated { timestamp, .. }
            | StreamEvent::PlanStepStarted { timestamp, .. }
            | StreamEvent::PlanStepCompleted { timestamp, .. }
            | StreamEvent::PlanUpdated { timestamp, .. }
            | StreamEvent::PlanCompleted { timestamp, .. }
            | StreamEvent::UserInputRequested { timestamp, .. } => *timestamp,
        }
    }

    /// Whether this is the terminal event of a run
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::AgentEnded { .. })
    }
}
