// Tool abstraction
//
// Tools are named capabilities the model can invoke with JSON arguments.
// The base trait covers lookup and execution; optional capabilities
// (emitting custom stream events, registering further tools at runtime,
// requiring human input) are small side interfaces detected through
// accessor methods that default to None.
//
// A tool-level execution failure is not fatal to the loop: it becomes an
// is_error ToolResult and is handed back to the model as conversation
// content. An unknown tool name, by contrast, is fatal to the step.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::events::StreamEvent;
use crate::message::{ToolCall, ToolResult};
use crate::provider::ToolSpec;
use crate::stream::EventEmitter;

/// Tool-level error, safe to hand back to the model
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ToolError {
    message: String,
}

impl ToolError {
    /// Create a tool error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for ToolError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for ToolError {
    fn from(message: &str) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

// ============================================================================
// Optional capabilities
// ============================================================================

/// Capability: the tool emits custom events into the run's stream.
///
/// The orchestrator binds the run's emitter before the first step.
pub trait EventEmitting: Send + Sync {
    fn bind_emitter(&self, emitter: EventEmitter);
}

/// Capability: the tool registers further tools at runtime.
///
/// Bound once at registration; the handle stays valid because the
/// registry is internally shared.
pub trait ToolAdder: Send + Sync {
    fn bind_registry(&self, registry: ToolRegistry);
}

/// Capability: the tool pauses the conversation for human input.
///
/// `send_input_event` is the request side effect: it announces the
/// pausing tool call (and the id the caller must answer) on the stream.
#[async_trait]
pub trait HumanInput: Send + Sync {
    async fn send_input_event(&self, tool_call: &ToolCall) -> Result<()>;
}

// ============================================================================
// Tool trait
// ============================================================================

/// Trait for tools callable by the model
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique tool name, used by the model to invoke it
    fn name(&self) -> &str;

    /// Description provided to the model
    fn description(&self) -> &str;

    /// JSON schema for the tool's parameters
    fn parameters_schema(&self) -> Value;

    /// Execute with JSON arguments, returning plain text or a tool error
    async fn execute(&self, arguments: Value) -> std::result::Result<String, ToolError>;

    /// Capability accessor: custom stream events
    fn event_emitting(&self) -> Option<&dyn EventEmitting> {
        None
    }

    /// Capability accessor: runtime tool registration
    fn tool_adder(&self) -> Option<&dyn ToolAdder> {
        None
    }

    /// Capability accessor: human-input pause
    fn human_input(&self) -> Option<&dyn HumanInput> {
        None
    }

    /// Provider-facing declaration for this tool
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

// ============================================================================
// ToolRegistry
// ============================================================================

#[derive(Default)]
struct RegistryInner {
    tools: Vec<Arc<dyn Tool>>,
    human_input: HashSet<String>,
}

/// A shared, lock-guarded set of named tools.
///
/// Safe for concurrent append while the loop reads: tools may register
/// further tools mid-run, and the loop takes a snapshot once per turn
/// rather than reading live.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl ToolRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any previous tool with the same name.
    ///
    /// Wires the tool's optional capabilities: human-input tools join the
    /// intervention set and tool-adders receive a registry handle.
    pub fn register(&self, tool: Arc<dyn Tool>) {
        if let Some(adder) = tool.tool_adder() {
            adder.bind_registry(self.clone());
        }

        let mut inner = self.inner.lock().unwrap();
        let name = tool.name().to_string();
        if tool.human_input().is_some() {
            inner.human_input.insert(name.clone());
        }
        if let Some(existing) = inner.tools.iter_mut().find(|t| t.name() == name) {
            *existing = tool;
        } else {
            inner.tools.push(tool);
        }
    }

    /// Mark a tool name as human-input without it carrying the capability
    pub fn mark_human_input(&self, name: impl Into<String>) {
        self.inner.lock().unwrap().human_input.insert(name.into());
    }

    /// Whether this name is in the intervention set
    pub fn is_human_input(&self, name: &str) -> bool {
        self.inner.lock().unwrap().human_input.contains(name)
    }

    /// Look up a tool by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.inner
            .lock()
            .unwrap()
            .tools
            .iter()
            .find(|t| t.name() == name)
            .cloned()
    }

    /// A point-in-time copy of the registered tools
    pub fn snapshot(&self) -> Vec<Arc<dyn Tool>> {
        self.inner.lock().unwrap().tools.clone()
    }

    /// Provider-facing declarations for the current snapshot
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.snapshot().iter().map(|t| t.spec()).collect()
    }

    /// Number of registered tools
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().tools.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().tools.is_empty()
    }

    /// Hand the run's emitter to every event-emitting tool
    pub fn bind_emitters(&self, emitter: &EventEmitter) {
        for tool in self.snapshot() {
            if let Some(emitting) = tool.event_emitting() {
                emitting.bind_emitter(emitter.clone());
            }
        }
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .snapshot()
            .iter()
            .map(|t| t.name().to_string())
            .collect();
        f.debug_struct("ToolRegistry").field("tools", &names).finish()
    }
}

/// Execute one tool call against a tool, converting failure into an
/// is_error result rather than propagating it.
pub async fn run_tool(tool: &dyn Tool, call: &ToolCall) -> ToolResult {
    match tool.execute(call.arguments.clone()).await {
        Ok(content) => ToolResult::success(&call.id, content),
        Err(err) => {
            tracing::warn!(tool = %call.name, tool_call_id = %call.id, error = %err, "tool returned an error");
            ToolResult::error(&call.id, err)
        }
    }
}

// ============================================================================
// Built-in tools
// ============================================================================

/// A tool that echoes back its message argument (useful for testing)
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo back the provided message. Useful for testing tool execution."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "message": {
                    "type": "string",
                    "description": "The message to echo back"
                }
            },
            "required": ["message"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, arguments: Value) -> std::result::Result<String, ToolError> {
        let message = arguments
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        Ok(message.to_string())
    }
}

/// A tool that always fails (useful for testing error handling)
pub struct FailingTool {
    message: String,
}

impl FailingTool {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Default for FailingTool {
    fn default() -> Self {
        Self::new("tool execution failed")
    }
}

#[async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &str {
        "failing_tool"
    }

    fn description(&self) -> &str {
        "A tool that always fails (for testing error handling)"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "additionalProperties": false
        })
    }

    async fn execute(&self, _arguments: Value) -> std::result::Result<String, ToolError> {
        Err(ToolError::new(self.message.clone()))
    }
}

/// The standard human-input tool.
///
/// Never dispatched: the orchestrator intercepts calls to it, pauses the
/// conversation, and emits UserInputRequested through the bound emitter.
#[derive(Default)]
pub struct RequestUserInputTool {
    emitter: Mutex<Option<EventEmitter>>,
}

impl RequestUserInputTool {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Tool for RequestUserInputTool {
    fn name(&self) -> &str {
        "request_user_input"
    }

    fn description(&self) -> &str {
        "Ask the user a question and wait for their answer before continuing."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "prompt": {
                    "type": "string",
                    "description": "The question to put to the user"
                }
            },
            "required": ["prompt"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, _arguments: Value) -> std::result::Result<String, ToolError> {
        // Reaching here means the orchestrator failed to intercept the call.
        Err(ToolError::new(
            "request_user_input requires human input and cannot be executed directly",
        ))
    }

    fn event_emitting(&self) -> Option<&dyn EventEmitting> {
        Some(self)
    }

    fn human_input(&self) -> Option<&dyn HumanInput> {
        Some(self)
    }
}

impl EventEmitting for RequestUserInputTool {
    fn bind_emitter(&self, emitter: EventEmitter) {
        *self.emitter.lock().unwrap() = Some(emitter);
    }
}

#[async_trait]
impl HumanInput for RequestUserInputTool {
    async fn send_input_event(&self, tool_call: &ToolCall) -> Result<()> {
        let emitter = self.emitter.lock().unwrap().clone();
        let Some(emitter) = emitter else {
            return Ok(());
        };
        let prompt = tool_call
            .arguments
            .get("prompt")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        emitter
            .emit(StreamEvent::user_input_requested(
                &tool_call.id,
                &tool_call.name,
                prompt,
            ))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RegisteringTool {
        registry: Mutex<Option<ToolRegistry>>,
    }

    impl RegisteringTool {
        fn new() -> Self {
            Self {
                registry: Mutex::new(None),
            }
        }
    }

    impl ToolAdder for RegisteringTool {
        fn bind_registry(&self, registry: ToolRegistry) {
            *self.registry.lock().unwrap() = Some(registry);
        }
    }

    #[async_trait]
    impl Tool for RegisteringTool {
        fn name(&self) -> &str {
            "install_helper"
        }

        fn description(&self) -> &str {
            "Registers the echo helper tool for later turns."
        }

        fn parameters_schema(&self) -> Value {
            serde_json::json!({"type": "object", "properties": {}})
        }

        async fn execute(&self, _arguments: Value) -> std::result::Result<String, ToolError> {
            let registry = self.registry.lock().unwrap().clone();
            let registry = registry.ok_or_else(|| ToolError::new("registry not bound"))?;
            registry.register(Arc::new(EchoTool));
            Ok("registered echo".to_string())
        }

        fn tool_adder(&self) -> Option<&dyn ToolAdder> {
            Some(self)
        }
    }

    #[tokio::test]
    async fn test_echo_tool() {
        let tool = EchoTool;
        let out = tool
            .execute(serde_json::json!({"message": "Hello, world!"}))
            .await
            .unwrap();
        assert_eq!(out, "Hello, world!");
    }

    #[tokio::test]
    async fn test_run_tool_converts_failure() {
        let tool = FailingTool::new("boom");
        let call = ToolCall::new("call_1", "failing_tool", serde_json::json!({}));
        let result = run_tool(&tool, &call).await;
        assert!(result.is_error);
        assert_eq!(result.content, "Error: boom");
        assert_eq!(result.tool_call_id, "call_1");
    }

    #[test]
    fn test_registry_register_and_lookup() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        registry.register(Arc::new(FailingTool::default()));

        assert_eq!(registry.len(), 2);
        assert!(registry.get("echo").is_some());
        assert!(registry.get("missing").is_none());

        let specs = registry.specs();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].name, "echo");
    }

    #[test]
    fn test_registry_replaces_same_name() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(FailingTool::new("first")));
        registry.register(Arc::new(FailingTool::new("second")));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_human_input_tool_joins_intervention_set() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(RequestUserInputTool::new()));
        assert!(registry.is_human_input("request_user_input"));
        assert!(!registry.is_human_input("echo"));

        registry.mark_human_input("approve_change");
        assert!(registry.is_human_input("approve_change"));
    }

    #[tokio::test]
    async fn test_tool_adder_registers_mid_run() {
        let registry = ToolRegistry::new();
        let snapshot_before = registry.snapshot();
        registry.register(Arc::new(RegisteringTool::new()));

        // The pre-registration snapshot is unaffected by later appends.
        assert!(snapshot_before.is_empty());

        let tool = registry.get("install_helper").unwrap();
        let out = tool.execute(serde_json::json!({})).await.unwrap();
        assert_eq!(out, "registered echo");
        assert!(registry.get("echo").is_some());
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_request_user_input_emits_event() {
        use futures::StreamExt;

        let tool = RequestUserInputTool::new();
        let (emitter, mut stream) = crate::stream::event_channel(4);
        tool.bind_emitter(emitter);

        let call = ToolCall::new(
            "call_9",
            "request_user_input",
            serde_json::json!({"prompt": "Which region?"}),
        );
        tool.send_input_event(&call).await.unwrap();

        match stream.next().await.unwrap() {
            StreamEvent::UserInputRequested {
                tool_call_id,
                prompt,
                ..
            } => {
                assert_eq!(tool_call_id, "call_9");
                assert_eq!(prompt.as_deref(), Some("Which region?"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
