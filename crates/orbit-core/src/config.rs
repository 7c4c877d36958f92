// Agent configuration and lifecycle hooks
//
// AgentConfig is a serializable description of how the loop runs. Hooks
// are process-local callbacks and live outside the config so the config
// stays a plain data object.

use serde::{Deserialize, Serialize};

use crate::conversation::Conversation;
use crate::error::AgentError;
use crate::provider::GenerateRequest;
use crate::step::Step;

/// Configuration for the agent loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// System prompt that defines the agent's behavior
    pub system_prompt: String,

    /// Model identifier (e.g. "gpt-4o", "claude-sonnet-4-20250514")
    pub model: String,

    /// Maximum number of loop steps (prevents infinite tool loops)
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Number of trailing messages sent to the provider (None = all)
    #[serde(default)]
    pub history_limit: Option<usize>,

    /// Temperature for sampling
    #[serde(default)]
    pub temperature: Option<f32>,

    /// Maximum tokens to generate per response
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

fn default_max_iterations() -> u32 {
    10
}

impl AgentConfig {
    /// Create a new agent configuration
    pub fn new(system_prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            model: model.into(),
            max_iterations: default_max_iterations(),
            history_limit: None,
            temperature: None,
            max_tokens: None,
        }
    }

    /// Set maximum iterations
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Set the history retrieval limit
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = Some(limit);
        self
    }

    /// Set temperature
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set max tokens
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::new("You are a helpful assistant.", "gpt-4o")
    }
}

/// Builder for AgentConfig with fluent API
pub struct AgentConfigBuilder {
    config: AgentConfig,
}

impl AgentConfigBuilder {
    /// Start building a new configuration
    pub fn new() -> Self {
        Self {
            config: AgentConfig::default(),
        }
    }

    /// Set the system prompt
    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = prompt.into();
        self
    }

    /// Set the model
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    /// Set maximum iterations
    pub fn max_iterations(mut self, max: u32) -> Self {
        self.config.max_iterations = max;
        self
    }

    /// Set the history retrieval limit
    pub fn history_limit(mut self, limit: usize) -> Self {
        self.config.history_limit = Some(limit);
        self
    }

    /// Set temperature
    pub fn temperature(mut self, temp: f32) -> Self {
        self.config.temperature = Some(temp);
        self
    }

    /// Set max tokens
    pub fn max_tokens(mut self, tokens: u32) -> Self {
        self.config.max_tokens = Some(tokens);
        self
    }

    /// Build the configuration
    pub fn build(self) -> AgentConfig {
        self.config
    }
}

impl Default for AgentConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Hooks
// ============================================================================

type RequestHook = Box<dyn Fn(&mut GenerateRequest, u32) + Send + Sync>;
type ErrorHook = Box<dyn Fn(&AgentError) + Send + Sync>;
type StepNumberHook = Box<dyn Fn(u32) + Send + Sync>;
type StepHook = Box<dyn Fn(&Step) + Send + Sync>;
type SessionHook = Box<dyn Fn(&str) + Send + Sync>;
type ConversationHook = Box<dyn Fn(&Conversation) + Send + Sync>;

/// Lifecycle callbacks invoked by the orchestrator.
///
/// All hooks are synchronous and best-effort observers except
/// `before_generate`, which may mutate the outgoing request (or snapshot
/// it against the step number).
#[derive(Default)]
pub struct Hooks {
    pub before_generate: Option<RequestHook>,
    pub generation_failed: Option<ErrorHook>,
    pub step_start: Option<StepNumberHook>,
    pub step_complete: Option<StepHook>,
    pub before_memory_retrieve: Option<SessionHook>,
    pub after_memory_retrieve: Option<ConversationHook>,
    pub memory_retrieve_failed: Option<ErrorHook>,
    pub before_memory_save: Option<ConversationHook>,
    pub after_memory_save: Option<ConversationHook>,
    pub memory_save_failed: Option<ErrorHook>,
}

impl Hooks {
    /// Create an empty hook set
    pub fn new() -> Self {
        Self::default()
    }

    /// Run before each generation request is sent
    pub fn on_before_generate(
        mut self,
        hook: impl Fn(&mut GenerateRequest, u32) + Send + Sync + 'static,
    ) -> Self {
        self.before_generate = Some(Box::new(hook));
        self
    }

    /// Run when generation fails
    pub fn on_generation_failed(
        mut self,
        hook: impl Fn(&AgentError) + Send + Sync + 'static,
    ) -> Self {
        self.generation_failed = Some(Box::new(hook));
        self
    }

    /// Run when a step starts
    pub fn on_step_start(mut self, hook: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.step_start = Some(Box::new(hook));
        self
    }

    /// Run when a step completes
    pub fn on_step_complete(mut self, hook: impl Fn(&Step) + Send + Sync + 'static) -> Self {
        self.step_complete = Some(Box::new(hook));
        self
    }

    /// Run before the conversation is loaded from the store
    pub fn on_before_memory_retrieve(
        mut self,
        hook: impl Fn(&str) + Send + Sync + 'static,
    ) -> Self {
        self.before_memory_retrieve = Some(Box::new(hook));
        self
    }

    /// Run after the conversation is loaded
    pub fn on_after_memory_retrieve(
        mut self,
        hook: impl Fn(&Conversation) + Send + Sync + 'static,
    ) -> Self {
        self.after_memory_retrieve = Some(Box::new(hook));
        self
    }

    /// Run when loading the conversation fails
    pub fn on_memory_retrieve_failed(
        mut self,
        hook: impl Fn(&AgentError) + Send + Sync + 'static,
    ) -> Self {
        self.memory_retrieve_failed = Some(Box::new(hook));
        self
    }

    /// Run before the conversation is persisted
    pub fn on_before_memory_save(
        mut self,
        hook: impl Fn(&Conversation) + Send + Sync + 'static,
    ) -> Self {
        self.before_memory_save = Some(Box::new(hook));
        self
    }

    /// Run after the conversation is persisted
    pub fn on_after_memory_save(
        mut self,
        hook: impl Fn(&Conversation) + Send + Sync + 'static,
    ) -> Self {
        self.after_memory_save = Some(Box::new(hook));
        self
    }

    /// Run when persisting the conversation fails
    pub fn on_memory_save_failed(
        mut self,
        hook: impl Fn(&AgentError) + Send + Sync + 'static,
    ) -> Self {
        self.memory_save_failed = Some(Box::new(hook));
        self
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("before_generate", &self.before_generate.is_some())
            .field("generation_failed", &self.generation_failed.is_some())
            .field("step_start", &self.step_start.is_some())
            .field("step_complete", &self.step_complete.is_some())
            .finish()
    }
}
