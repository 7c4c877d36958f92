// Error types for the agent engine

use thiserror::Error;

/// Result type alias for agent engine operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Errors that can occur while driving the agent loop
#[derive(Debug, Error)]
pub enum AgentError {
    /// Provider adapter error (connection, protocol, parse)
    #[error("Provider error: {0}")]
    Provider(String),

    /// Tool execution error that is fatal to the step (lookup miss, malformed call)
    #[error("Tool error: {0}")]
    Tool(String),

    /// Conversation store error
    #[error("Store error: {0}")]
    Store(String),

    /// Event emission error (outward channel closed)
    #[error("Event emission error: {0}")]
    EventEmission(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Loop terminated due to max iterations
    #[error("Max iterations ({0}) reached")]
    MaxIterationsReached(u32),

    /// Run was cancelled
    #[error("Run cancelled")]
    Cancelled,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AgentError {
    /// Create a provider error
    pub fn provider(msg: impl Into<String>) -> Self {
        AgentError::Provider(msg.into())
    }

    /// Create a step-fatal tool error
    pub fn tool(msg: impl Into<String>) -> Self {
        AgentError::Tool(msg.into())
    }

    /// Create a store error
    pub fn store(msg: impl Into<String>) -> Self {
        AgentError::Store(msg.into())
    }

    /// Create an event emission error
    pub fn event(msg: impl Into<String>) -> Self {
        AgentError::EventEmission(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        AgentError::Configuration(msg.into())
    }
}
