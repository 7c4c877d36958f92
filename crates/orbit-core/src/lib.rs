// Agent Execution Engine
//
// This crate provides a provider-agnostic, resumable, streamable agent
// loop (generation -> tool execution -> repeat).
//
// Key design decisions:
// - Uses traits (Provider, ConversationStore, Tool) for pluggable backends
// - One canonical StreamEvent model; adapters translate vendor wire formats
// - The outward stream always ends with exactly one AgentEnded event
// - Errors are read from the stream's error slot after it closes
// - Tool failures feed back to the model; they never abort the loop
// - Human-input tools pause the conversation until the caller resumes it
// - The plan manager is an optional capability surfaced as callable tools

pub mod agent;
pub mod config;
pub mod conversation;
pub mod error;
pub mod events;
pub mod message;
pub mod plan;
pub mod provider;
pub mod step;
pub mod store;
pub mod stream;
pub mod tools;

// In-memory implementations for examples and testing
pub mod memory;

// Re-exports for convenience
pub use agent::{Agent, ChatRequest};
pub use config::{AgentConfig, AgentConfigBuilder, Hooks};
pub use conversation::{Conversation, ConversationStatus};
pub use error::{AgentError, Result};
pub use events::StreamEvent;
pub use message::{FinishReason, Message, MessageRole, ToolCall, ToolResult, Usage};
pub use plan::{Plan, PlanManager, PlanStatus, PlanStep, PlanStepStatus};
pub use provider::{Capabilities, GenerateRequest, GenerateResponse, Provider, ToolSpec};
pub use step::Step;
pub use store::{ConversationFilter, ConversationStore};
pub use stream::{event_channel, EventEmitter, EventStream};
pub use tools::{
    EchoTool, EventEmitting, FailingTool, HumanInput, RequestUserInputTool, Tool, ToolAdder,
    ToolError, ToolRegistry,
};

// In-memory re-exports
pub use memory::{
    InMemoryConversationStore, NoopConversationStore, StubProvider, StubTurn,
};
