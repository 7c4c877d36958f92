// Agent orchestrator
//
// Owns the per-conversation step loop: builds each turn's request from
// the running conversation and the tool registry, drives the provider's
// canonical event stream, folds events into step state, detects and
// handles tool calls (including human-input pauses), persists each turn,
// and emits a single outward event stream.
//
// chat() returns immediately after conversation setup; generation runs on
// a separate task that always emits exactly one terminal AgentEnded event
// before the channel closes, on every path.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{AgentConfig, Hooks};
use crate::conversation::{Conversation, ConversationStatus};
use crate::error::{AgentError, Result};
use crate::events::StreamEvent;
use crate::message::{FinishReason, Message, ToolCall, ToolResult, Usage};
use crate::provider::{validate_request, GenerateRequest, Provider};
use crate::step::Step;
use crate::store::{ConversationFilter, ConversationStore};
use crate::stream::{event_channel, EventEmitter, EventStream};
use crate::tools::{run_tool, ToolRegistry};

/// Outward channel capacity: backpressure bounds in-flight memory to one
/// event.
const EVENT_CHANNEL_CAPACITY: usize = 1;

/// A single chat invocation
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// User prompt; empty when resuming with tool results only
    pub prompt: String,
    /// Session the conversation is keyed by
    pub session_id: String,
    /// Answers for tool calls left pending by a human-input pause
    pub tool_results: Vec<ToolResult>,
}

impl ChatRequest {
    /// A fresh prompt for a session
    pub fn new(session_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            session_id: session_id.into(),
            tool_results: Vec::new(),
        }
    }

    /// Resume an interrupted conversation with tool results
    pub fn resume(session_id: impl Into<String>, tool_results: Vec<ToolResult>) -> Self {
        Self {
            prompt: String::new(),
            session_id: session_id.into(),
            tool_results,
        }
    }
}

/// The agent: configuration plus the collaborators the loop drives
pub struct Agent {
    config: AgentConfig,
    provider: Arc<dyn Provider>,
    store: Arc<dyn ConversationStore>,
    tools: ToolRegistry,
    hooks: Arc<Hooks>,
    cancel: CancellationToken,
}

impl Agent {
    /// Create an agent with an empty tool registry and no hooks
    pub fn new(
        config: AgentConfig,
        provider: Arc<dyn Provider>,
        store: Arc<dyn ConversationStore>,
    ) -> Self {
        Self {
            config,
            provider,
            store,
            tools: ToolRegistry::new(),
            hooks: Arc::new(Hooks::default()),
            cancel: CancellationToken::new(),
        }
    }

    /// Use an existing tool registry
    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    /// Install lifecycle hooks
    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    /// Propagate cancellation from the given token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// The agent's tool registry
    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// The agent's configuration
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Run one chat invocation.
    ///
    /// Performs conversation setup synchronously (setup failures return an
    /// error before any event is emitted), then spawns the step loop and
    /// returns the outward event stream. The stream yields canonical
    /// events, ends with exactly one AgentEnded, and records any fatal
    /// loop error for `take_error` after close.
    pub async fn chat(&self, request: ChatRequest) -> Result<EventStream> {
        let capabilities = self.provider.capabilities();
        if !capabilities.supports_streaming {
            return Err(AgentError::config(format!(
                "provider {} does not support streaming",
                self.provider.provider_name()
            )));
        }
        if !self.tools.is_empty() && !capabilities.supports_tools {
            return Err(AgentError::config(format!(
                "provider {} does not support tool calling but tools are registered",
                self.provider.provider_name()
            )));
        }

        let task = LoopTask {
            config: self.config.clone(),
            provider: Arc::clone(&self.provider),
            store: Arc::clone(&self.store),
            tools: self.tools.clone(),
            hooks: Arc::clone(&self.hooks),
            cancel: self.cancel.clone(),
        };

        let mut conversation = task.load_conversation(&request.session_id).await?;

        // Exactly one setup branch applies per call.
        if conversation.status == ConversationStatus::Interrupted
            && !request.tool_results.is_empty()
        {
            // The caller is answering the pending tool calls. Partial
            // answers stay partial; nothing is synthesized here.
            conversation.push(Message::tool_results(request.tool_results));
            conversation.status = ConversationStatus::Active;
            task.save(&mut conversation).await?;
        } else if conversation.status == ConversationStatus::Interrupted {
            // The caller abandoned the pending request with a new prompt:
            // answer every still-pending call with a skip placeholder.
            let skipped: Vec<ToolResult> = conversation
                .pending_tool_calls()
                .iter()
                .map(|call| {
                    ToolResult::success(
                        &call.id,
                        serde_json::json!({
                            "skipped": true,
                            "reason": "superseded by a new prompt",
                        })
                        .to_string(),
                    )
                })
                .collect();
            if !skipped.is_empty() {
                conversation.push(Message::tool_results(skipped));
            }
            conversation.status = ConversationStatus::Active;
            if !request.prompt.is_empty() {
                conversation.push(Message::user(request.prompt));
            }
        } else if !request.prompt.is_empty() {
            conversation.status = ConversationStatus::Active;
            conversation.push(Message::user(request.prompt));
        }

        let (emitter, stream) = event_channel(EVENT_CHANNEL_CAPACITY);
        self.tools.bind_emitters(&emitter);

        tokio::spawn(task.run(conversation, emitter));
        Ok(stream)
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("provider", &self.provider.provider_name())
            .field("model", &self.config.model)
            .field("tools", &self.tools)
            .finish()
    }
}

// ============================================================================
// Loop task
// ============================================================================

/// Everything the spawned loop task needs; the task is the sole writer of
/// the in-flight conversation and step list.
struct LoopTask {
    config: AgentConfig,
    provider: Arc<dyn Provider>,
    store: Arc<dyn ConversationStore>,
    tools: ToolRegistry,
    hooks: Arc<Hooks>,
    cancel: CancellationToken,
}

impl LoopTask {
    async fn run(self, mut conversation: Conversation, emitter: EventEmitter) {
        let session_id = conversation.session_id.clone();
        info!(session_id = %session_id, "agent loop started");

        let mut guard = TerminalGuard::new(emitter.clone());
        let mut steps: Vec<Step> = Vec::new();
        let mut total_usage = Usage::default();

        let outcome = self
            .run_steps(&mut conversation, &mut steps, &mut total_usage, &emitter)
            .await;

        let final_reason = match &outcome {
            Ok(reason) => *reason,
            Err(AgentError::MaxIterationsReached(_)) => steps
                .last()
                .and_then(|s| s.finish_reason)
                .unwrap_or(FinishReason::Stop),
            Err(_) => FinishReason::Error,
        };

        match &outcome {
            Ok(FinishReason::HumanIntervention) => {
                // The paused turn was already persisted as interrupted.
            }
            Ok(_) | Err(AgentError::MaxIterationsReached(_)) => {
                conversation.status = ConversationStatus::Completed;
                if let Err(err) = self.save(&mut conversation).await {
                    warn!(session_id = %session_id, error = %err, "final save failed");
                }
            }
            Err(_) => {
                conversation.status = ConversationStatus::Failed;
                if let Err(err) = self.save(&mut conversation).await {
                    warn!(session_id = %session_id, error = %err, "final save failed");
                }
            }
        }

        if let Err(err) = outcome {
            error!(session_id = %session_id, error = %err, "agent loop failed");
            emitter.set_error(err);
        } else {
            info!(
                session_id = %session_id,
                steps = steps.len(),
                reason = %final_reason,
                "agent loop finished"
            );
        }

        guard.complete(total_usage, final_reason).await;
    }

    async fn run_steps(
        &self,
        conversation: &mut Conversation,
        steps: &mut Vec<Step>,
        total_usage: &mut Usage,
        emitter: &EventEmitter,
    ) -> Result<FinishReason> {
        let mut step_number: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }

            // The finish check looks at the previous completed step; on the
            // very first iteration no step exists yet.
            if let Some(prev) = steps.last() {
                if let Some(reason) = finish_condition(prev) {
                    return Ok(reason);
                }
            }

            if step_number >= self.config.max_iterations {
                return Err(AgentError::MaxIterationsReached(self.config.max_iterations));
            }
            step_number += 1;

            if let Some(hook) = &self.hooks.step_start {
                hook(step_number);
            }
            emitter.emit(StreamEvent::step_start(step_number)).await?;

            let mut request = self.build_request(conversation);
            if let Some(hook) = &self.hooks.before_generate {
                hook(&mut request, step_number);
            }
            let mut step = Step::new(step_number, request);

            match self
                .execute_step(&mut step, conversation, total_usage, emitter)
                .await
            {
                Ok(()) => {
                    emitter
                        .emit(StreamEvent::step_complete(
                            step.step_number,
                            step.content.clone(),
                            step.tool_calls.len(),
                            step.finish_reason,
                        ))
                        .await?;
                    if let Some(hook) = &self.hooks.step_complete {
                        hook(&step);
                    }
                    steps.push(step);
                }
                Err(err) => {
                    step.finish_reason = Some(FinishReason::Error);
                    // Error events must never block on a caller that
                    // stopped listening.
                    emitter.emit_best_effort(StreamEvent::finish_reason(FinishReason::Error));
                    steps.push(step);
                    return Err(err);
                }
            }
        }
    }

    /// One full turn: generation, intervention check, persistence, tool
    /// execution. Any error returned here is fatal to the step.
    async fn execute_step(
        &self,
        step: &mut Step,
        conversation: &mut Conversation,
        total_usage: &mut Usage,
        emitter: &EventEmitter,
    ) -> Result<()> {
        validate_request(&self.provider.capabilities(), &step.request)?;

        let stream = match self.provider.stream(step.request.clone()).await {
            Ok(stream) => stream,
            Err(err) => return Err(self.generation_failed(err)),
        };
        if let Err(err) = self.drive_stream(stream, step, total_usage, emitter).await {
            return Err(match err {
                AgentError::Provider(_) => self.generation_failed(err),
                other => other,
            });
        }

        // Human-input calls pause the conversation instead of executing.
        let human_calls: Vec<ToolCall> = step
            .tool_calls
            .iter()
            .filter(|call| self.tools.is_human_input(&call.name))
            .cloned()
            .collect();
        if !human_calls.is_empty() {
            conversation.status = ConversationStatus::Interrupted;
            step.finish_reason = Some(FinishReason::HumanIntervention);
            for call in &human_calls {
                info!(tool = %call.name, tool_call_id = %call.id, "pausing for human input");
                let sent = match self.tools.get(&call.name) {
                    Some(tool) => match tool.human_input() {
                        Some(human) => {
                            human.send_input_event(call).await?;
                            true
                        }
                        None => false,
                    },
                    None => false,
                };
                if !sent {
                    // Name was marked human-input without the capability.
                    emitter
                        .emit(StreamEvent::user_input_requested(&call.id, &call.name, None))
                        .await?;
                }
            }
        }

        // The paused turn is durably recorded too.
        conversation.push(Message::assistant_with_tools(
            step.content.clone(),
            step.tool_calls.clone(),
        ));
        if let Err(err) = self.save(conversation).await {
            return Err(self.generation_failed(err));
        }

        // Execute the remaining (non-human) tool calls.
        let to_run: Vec<ToolCall> = step
            .tool_calls
            .iter()
            .filter(|call| !self.tools.is_human_input(&call.name))
            .cloned()
            .collect();
        if !to_run.is_empty() {
            for call in &to_run {
                emitter
                    .emit(StreamEvent::tool_execution_start(&call.id, &call.name))
                    .await?;

                let tool = self.tools.get(&call.name).ok_or_else(|| {
                    AgentError::tool(format!(
                        "tool not found: {} (call {})",
                        call.name, call.id
                    ))
                })?;

                let result = tokio::select! {
                    _ = self.cancel.cancelled() => return Err(AgentError::Cancelled),
                    result = run_tool(tool.as_ref(), call) => result,
                };

                emitter
                    .emit(StreamEvent::tool_execution_complete(
                        &call.id,
                        &call.name,
                        result.is_error,
                    ))
                    .await?;
                step.tool_results.push(result);
            }

            conversation.push(Message::tool_results(step.tool_results.clone()));
            if let Err(err) = self.save(conversation).await {
                return Err(self.generation_failed(err));
            }
        }

        Ok(())
    }

    /// Drain the provider stream, folding every event into the step and
    /// forwarding it unchanged on the outward channel.
    async fn drive_stream(
        &self,
        mut stream: EventStream,
        step: &mut Step,
        total_usage: &mut Usage,
        emitter: &EventEmitter,
    ) -> Result<()> {
        use futures::StreamExt;

        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => return Err(AgentError::Cancelled),
                event = stream.next() => event,
            };
            let Some(event) = event else { break };

            step.apply_event(&event);
            if let StreamEvent::Usage { usage, .. } = &event {
                total_usage.add(usage);
            }
            emitter.emit(event).await?;
        }

        match stream.take_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn build_request(&self, conversation: &Conversation) -> GenerateRequest {
        let messages = match self.config.history_limit {
            Some(limit) if conversation.messages.len() > limit => {
                conversation.messages[conversation.messages.len() - limit..].to_vec()
            }
            _ => conversation.messages.clone(),
        };

        GenerateRequest {
            model: self.config.model.clone(),
            system_prompt: if self.config.system_prompt.is_empty() {
                None
            } else {
                Some(self.config.system_prompt.clone())
            },
            messages,
            tools: self.tools.specs(),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        }
    }

    fn generation_failed(&self, err: AgentError) -> AgentError {
        if let Some(hook) = &self.hooks.generation_failed {
            hook(&err);
        }
        err
    }

    async fn load_conversation(&self, session_id: &str) -> Result<Conversation> {
        if let Some(hook) = &self.hooks.before_memory_retrieve {
            hook(session_id);
        }
        match self
            .store
            .get_conversation(&ConversationFilter::session(session_id))
            .await
        {
            Ok(conversation) => {
                if let Some(hook) = &self.hooks.after_memory_retrieve {
                    hook(&conversation);
                }
                Ok(conversation)
            }
            Err(err) => {
                if let Some(hook) = &self.hooks.memory_retrieve_failed {
                    hook(&err);
                }
                Err(err)
            }
        }
    }

    async fn save(&self, conversation: &mut Conversation) -> Result<()> {
        conversation.updated_at = chrono::Utc::now();
        if let Some(hook) = &self.hooks.before_memory_save {
            hook(conversation);
        }
        match self.store.save_conversation(conversation).await {
            Ok(()) => {
                if let Some(hook) = &self.hooks.after_memory_save {
                    hook(conversation);
                }
                Ok(())
            }
            Err(err) => {
                if let Some(hook) = &self.hooks.memory_save_failed {
                    hook(&err);
                }
                Err(err)
            }
        }
    }
}

/// Why the loop stops before starting a new step, judged against the
/// previous completed step.
fn finish_condition(prev: &Step) -> Option<FinishReason> {
    // A turn that called no tools is a finished answer.
    if prev.tool_calls.is_empty() {
        return Some(prev.finish_reason.unwrap_or(FinishReason::Stop));
    }
    // Tools were called but none were answered: dispatch was withheld
    // (human intervention), so the loop cannot make progress.
    if prev.tool_results.is_empty() {
        return Some(prev.finish_reason.unwrap_or(FinishReason::HumanIntervention));
    }
    match prev.finish_reason {
        Some(reason) if reason.is_terminal() => Some(reason),
        _ => None,
    }
}

// ============================================================================
// Terminal guard
// ============================================================================

/// Guarantees exactly one AgentEnded on every exit path: the loop task
/// calls `complete` on orderly shutdown, and Drop fires a best-effort
/// terminal event if the task unwound without reaching it.
struct TerminalGuard {
    emitter: EventEmitter,
    fired: bool,
}

impl TerminalGuard {
    fn new(emitter: EventEmitter) -> Self {
        Self {
            emitter,
            fired: false,
        }
    }

    async fn complete(&mut self, usage: Usage, reason: FinishReason) {
        self.fired = true;
        let _ = self
            .emitter
            .emit(StreamEvent::agent_ended(usage, reason))
            .await;
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        if !self.fired {
            self.emitter
                .emit_best_effort(StreamEvent::agent_ended(Usage::default(), FinishReason::Error));
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{
        FailingConversationStore, InMemoryConversationStore, StubProvider, StubTurn,
    };
    use crate::message::MessageRole;
    use crate::plan::PlanManager;
    use crate::tools::{EchoTool, FailingTool, RequestUserInputTool, Tool};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn agent(provider: StubProvider, store: InMemoryConversationStore) -> Agent {
        Agent::new(
            AgentConfig::new("You are a helpful assistant.", "stub"),
            Arc::new(provider),
            Arc::new(store),
        )
    }

    fn step_starts(events: &[StreamEvent]) -> Vec<u32> {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::AgentStepStart { step_number, .. } => Some(*step_number),
                _ => None,
            })
            .collect()
    }

    fn terminal(events: &[StreamEvent]) -> Vec<(Usage, FinishReason)> {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::AgentEnded {
                    usage,
                    finish_reason,
                    ..
                } => Some((*usage, *finish_reason)),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_simple_text_scenario() {
        // "What's 2+2?" with zero tools: exactly one step, content "4",
        // terminal reason stop.
        let provider = StubProvider::new(vec![StubTurn::text("4")]);
        let store = InMemoryConversationStore::new();
        let agent = agent(provider.clone(), store.clone());

        let stream = agent
            .chat(ChatRequest::new("s1", "What's 2+2?"))
            .await
            .unwrap();
        let (events, error) = stream.collect_events().await;

        assert!(error.is_none());
        assert_eq!(step_starts(&events), vec![1]);
        assert_eq!(terminal(&events), vec![(Usage::default(), FinishReason::Stop)]);
        assert!(events.last().unwrap().is_terminal());

        let conversation = store
            .get_conversation(&ConversationFilter::session("s1"))
            .await
            .unwrap();
        assert_eq!(conversation.status, ConversationStatus::Completed);
        assert_eq!(conversation.messages.len(), 2);
        assert_eq!(conversation.messages[0].role, MessageRole::User);
        assert_eq!(conversation.messages[1].role, MessageRole::Assistant);
        assert_eq!(conversation.messages[1].content, "4");
        assert_eq!(provider.calls().await, 1);
    }

    #[tokio::test]
    async fn test_human_intervention_scenario() {
        // A request_user_input call in step 1 interrupts the conversation
        // and the loop never increments past step 1.
        let provider = StubProvider::new(vec![StubTurn::tool_calls(vec![ToolCall::new(
            "call_h",
            "request_user_input",
            serde_json::json!({"prompt": "Which file?"}),
        )])]);
        let store = InMemoryConversationStore::new();
        let agent = agent(provider, store.clone());
        agent.tools().register(Arc::new(RequestUserInputTool::new()));

        let stream = agent.chat(ChatRequest::new("s1", "edit it")).await.unwrap();
        let (events, error) = stream.collect_events().await;

        assert!(error.is_none());
        assert_eq!(step_starts(&events), vec![1]);
        assert!(events.iter().any(|e| matches!(
            e,
            StreamEvent::UserInputRequested { tool_call_id, .. } if tool_call_id == "call_h"
        )));
        assert_eq!(
            terminal(&events),
            vec![(Usage::default(), FinishReason::HumanIntervention)]
        );

        let conversation = store
            .get_conversation(&ConversationFilter::session("s1"))
            .await
            .unwrap();
        assert_eq!(conversation.status, ConversationStatus::Interrupted);
        // The paused turn was durably recorded with its tool call.
        assert_eq!(conversation.pending_tool_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_mixed_human_and_regular_calls() {
        // Only the human-input call is withheld; the echo call still runs.
        let provider = StubProvider::new(vec![StubTurn::tool_calls(vec![
            ToolCall::new("call_e", "echo", serde_json::json!({"message": "hi"})),
            ToolCall::new(
                "call_h",
                "request_user_input",
                serde_json::json!({"prompt": "ok?"}),
            ),
        ])]);
        let store = InMemoryConversationStore::new();
        let agent = agent(provider, store.clone());
        agent.tools().register(Arc::new(EchoTool));
        agent.tools().register(Arc::new(RequestUserInputTool::new()));

        let stream = agent.chat(ChatRequest::new("s1", "go")).await.unwrap();
        let (events, error) = stream.collect_events().await;
        assert!(error.is_none());

        let executed: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ToolExecutionStart { name, .. } => Some(name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(executed, vec!["echo"]);

        let conversation = store
            .get_conversation(&ConversationFilter::session("s1"))
            .await
            .unwrap();
        assert_eq!(conversation.status, ConversationStatus::Interrupted);
        let pending = conversation.pending_tool_calls();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "call_h");
    }

    #[tokio::test]
    async fn test_tool_error_isolation() {
        // A failing tool produces an is_error result and the loop
        // continues to the next step instead of aborting.
        let provider = StubProvider::new(vec![
            StubTurn::tool_calls(vec![ToolCall::new(
                "call_f",
                "failing_tool",
                serde_json::json!({}),
            )]),
            StubTurn::text("recovered"),
        ]);
        let store = InMemoryConversationStore::new();
        let agent = agent(provider, store.clone());
        agent.tools().register(Arc::new(FailingTool::new("boom")));

        let stream = agent.chat(ChatRequest::new("s1", "try it")).await.unwrap();
        let (events, error) = stream.collect_events().await;

        assert!(error.is_none());
        assert_eq!(step_starts(&events), vec![1, 2]);
        assert_eq!(terminal(&events), vec![(Usage::default(), FinishReason::Stop)]);
        assert!(events.iter().any(|e| matches!(
            e,
            StreamEvent::ToolExecutionComplete { is_error: true, .. }
        )));

        let conversation = store
            .get_conversation(&ConversationFilter::session("s1"))
            .await
            .unwrap();
        let tool_message = conversation
            .messages
            .iter()
            .find(|m| m.role == MessageRole::Tool)
            .unwrap();
        assert_eq!(tool_message.tool_results[0].content, "Error: boom");
        assert!(tool_message.tool_results[0].is_error);
    }

    #[tokio::test]
    async fn test_tool_results_feed_next_request() {
        let provider = StubProvider::new(vec![
            StubTurn::tool_calls(vec![ToolCall::new(
                "call_e",
                "echo",
                serde_json::json!({"message": "ping"}),
            )]),
            StubTurn::text("done"),
        ]);
        let store = InMemoryConversationStore::new();
        let agent = agent(provider.clone(), store);
        agent.tools().register(Arc::new(EchoTool));

        let stream = agent.chat(ChatRequest::new("s1", "go")).await.unwrap();
        let (_, error) = stream.collect_events().await;
        assert!(error.is_none());

        let requests = provider.requests().await;
        assert_eq!(requests.len(), 2);
        // Step 2's request carries the assistant tool-call turn and the
        // tool results turn.
        let second = &requests[1];
        let tool_message = second
            .messages
            .iter()
            .find(|m| m.role == MessageRole::Tool)
            .unwrap();
        assert_eq!(tool_message.tool_results[0].content, "ping");
        // The registry is converted to provider tool declarations.
        assert_eq!(second.tools.len(), 1);
        assert_eq!(second.tools[0].name, "echo");
    }

    #[tokio::test]
    async fn test_resume_round_trip_partial_results() {
        // Interrupted with pending {t1, t2}; resumed with only t1's
        // result: the tool message contains exactly t1's answer and t2
        // stays unanswered (no synthesized skip).
        let store = InMemoryConversationStore::new();
        let mut conversation = Conversation::new("s1");
        conversation.push(Message::user("do two things"));
        conversation.push(Message::assistant_with_tools(
            "",
            vec![
                ToolCall::new("t1", "request_user_input", serde_json::json!({})),
                ToolCall::new("t2", "request_user_input", serde_json::json!({})),
            ],
        ));
        conversation.status = ConversationStatus::Interrupted;
        store.seed(conversation).await;

        let provider = StubProvider::new(vec![StubTurn::text("thanks")]);
        let agent = agent(provider, store.clone());

        let stream = agent
            .chat(ChatRequest::resume(
                "s1",
                vec![ToolResult::success("t1", "first answer")],
            ))
            .await
            .unwrap();
        let (events, error) = stream.collect_events().await;
        assert!(error.is_none());
        assert_eq!(terminal(&events).len(), 1);

        let loaded = store
            .get_conversation(&ConversationFilter::session("s1"))
            .await
            .unwrap();
        let tool_messages: Vec<&Message> = loaded
            .messages
            .iter()
            .filter(|m| m.role == MessageRole::Tool)
            .collect();
        assert_eq!(tool_messages.len(), 1);
        assert_eq!(tool_messages[0].tool_results.len(), 1);
        assert_eq!(tool_messages[0].tool_results[0].tool_call_id, "t1");
        assert_eq!(tool_messages[0].tool_results[0].content, "first answer");
    }

    #[tokio::test]
    async fn test_new_prompt_resume_synthesizes_skips() {
        let store = InMemoryConversationStore::new();
        let mut conversation = Conversation::new("s1");
        conversation.push(Message::user("ask me"));
        conversation.push(Message::assistant_with_tools(
            "",
            vec![ToolCall::new(
                "t1",
                "request_user_input",
                serde_json::json!({}),
            )],
        ));
        conversation.status = ConversationStatus::Interrupted;
        store.seed(conversation).await;

        let provider = StubProvider::new(vec![StubTurn::text("new topic then")]);
        let agent = agent(provider, store.clone());

        let stream = agent
            .chat(ChatRequest::new("s1", "forget that, what's the time?"))
            .await
            .unwrap();
        let (_, error) = stream.collect_events().await;
        assert!(error.is_none());

        let loaded = store
            .get_conversation(&ConversationFilter::session("s1"))
            .await
            .unwrap();
        let tool_message = loaded
            .messages
            .iter()
            .find(|m| m.role == MessageRole::Tool)
            .unwrap();
        assert_eq!(tool_message.tool_results.len(), 1);
        assert_eq!(tool_message.tool_results[0].tool_call_id, "t1");
        assert!(tool_message.tool_results[0].content.contains("\"skipped\":true"));

        // The abandoned pause is followed by the fresh user prompt.
        let last_user = loaded
            .messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .unwrap();
        assert_eq!(last_user.content, "forget that, what's the time?");
    }

    #[tokio::test]
    async fn test_terminal_event_on_stream_error() {
        let provider = StubProvider::new(vec![StubTurn::failing_after(
            vec![StreamEvent::text_delta("par")],
            "connection reset",
        )]);
        let store = InMemoryConversationStore::new();
        let agent = agent(provider, store.clone());

        let stream = agent.chat(ChatRequest::new("s1", "hi")).await.unwrap();
        let (events, error) = stream.collect_events().await;

        assert_eq!(terminal(&events), vec![(Usage::default(), FinishReason::Error)]);
        assert!(events.last().unwrap().is_terminal());
        assert!(matches!(error, Some(AgentError::Provider(_))));

        let conversation = store
            .get_conversation(&ConversationFilter::session("s1"))
            .await
            .unwrap();
        assert_eq!(conversation.status, ConversationStatus::Failed);
    }

    #[tokio::test]
    async fn test_terminal_event_on_max_iterations() {
        // Every turn asks for tools; the loop must stop at max_iterations
        // and still deliver exactly one terminal event.
        let turns: Vec<StubTurn> = (0..4)
            .map(|i| {
                StubTurn::tool_calls(vec![ToolCall::new(
                    format!("call_{}", i),
                    "echo",
                    serde_json::json!({"message": "again"}),
                )])
            })
            .collect();
        let provider = StubProvider::new(turns);
        let store = InMemoryConversationStore::new();
        let agent = Agent::new(
            AgentConfig::new("", "stub").with_max_iterations(2),
            Arc::new(provider),
            Arc::new(store),
        );
        agent.tools().register(Arc::new(EchoTool));

        let stream = agent.chat(ChatRequest::new("s1", "loop")).await.unwrap();
        let (events, error) = stream.collect_events().await;

        assert_eq!(step_starts(&events), vec![1, 2]);
        assert_eq!(terminal(&events).len(), 1);
        assert!(matches!(error, Some(AgentError::MaxIterationsReached(2))));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_fatal() {
        let provider = StubProvider::new(vec![StubTurn::tool_calls(vec![ToolCall::new(
            "call_x",
            "not_registered",
            serde_json::json!({}),
        )])]);
        let store = InMemoryConversationStore::new();
        let agent = agent(provider, store);
        agent.tools().register(Arc::new(EchoTool));

        let stream = agent.chat(ChatRequest::new("s1", "go")).await.unwrap();
        let (events, error) = stream.collect_events().await;

        assert_eq!(terminal(&events), vec![(Usage::default(), FinishReason::Error)]);
        let err = error.unwrap();
        assert!(err.to_string().contains("not_registered"));
        assert!(err.to_string().contains("call_x"));
    }

    #[tokio::test]
    async fn test_persistence_failure_is_step_fatal() {
        let provider = StubProvider::new(vec![StubTurn::text("hello")]);
        let store = FailingConversationStore::new("disk full");
        let agent = Agent::new(
            AgentConfig::new("", "stub"),
            Arc::new(provider),
            Arc::new(store),
        );

        let stream = agent.chat(ChatRequest::new("s1", "hi")).await.unwrap();
        let (events, error) = stream.collect_events().await;

        assert_eq!(terminal(&events), vec![(Usage::default(), FinishReason::Error)]);
        assert!(matches!(error, Some(AgentError::Store(_))));
    }

    #[tokio::test]
    async fn test_usage_accumulates_across_steps() {
        let usage_a = Usage {
            prompt_tokens: 10,
            completion_tokens: 2,
            total_tokens: 12,
            ..Usage::default()
        };
        let usage_b = Usage {
            prompt_tokens: 14,
            completion_tokens: 3,
            total_tokens: 17,
            ..Usage::default()
        };
        let provider = StubProvider::new(vec![
            StubTurn::tool_calls(vec![ToolCall::new(
                "call_e",
                "echo",
                serde_json::json!({"message": "x"}),
            )])
            .with_usage(usage_a),
            StubTurn::text("done").with_usage(usage_b),
        ]);
        let store = InMemoryConversationStore::new();
        let agent = agent(provider, store);
        agent.tools().register(Arc::new(EchoTool));

        let stream = agent.chat(ChatRequest::new("s1", "go")).await.unwrap();
        let (events, error) = stream.collect_events().await;
        assert!(error.is_none());

        let (total, reason) = terminal(&events)[0];
        assert_eq!(reason, FinishReason::Stop);
        assert_eq!(total.prompt_tokens, 24);
        assert_eq!(total.completion_tokens, 5);
        assert_eq!(total.total_tokens, 29);
    }

    #[tokio::test]
    async fn test_step_numbers_are_monotonic() {
        let provider = StubProvider::new(vec![
            StubTurn::tool_calls(vec![ToolCall::new(
                "c1",
                "echo",
                serde_json::json!({"message": "1"}),
            )]),
            StubTurn::tool_calls(vec![ToolCall::new(
                "c2",
                "echo",
                serde_json::json!({"message": "2"}),
            )]),
            StubTurn::text("end"),
        ]);
        let store = InMemoryConversationStore::new();
        let agent = agent(provider, store);
        agent.tools().register(Arc::new(EchoTool));

        let stream = agent.chat(ChatRequest::new("s1", "go")).await.unwrap();
        let (events, error) = stream.collect_events().await;
        assert!(error.is_none());

        let starts = step_starts(&events);
        assert_eq!(starts, vec![1, 2, 3]);
        let completes: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::AgentStepComplete { step_number, .. } => Some(*step_number),
                _ => None,
            })
            .collect();
        assert_eq!(completes, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_hooks_fire_and_mutate_request() {
        let generate_calls = Arc::new(AtomicU32::new(0));
        let step_completes = Arc::new(AtomicU32::new(0));
        let generate_count = Arc::clone(&generate_calls);
        let complete_count = Arc::clone(&step_completes);

        let hooks = Hooks::new()
            .on_before_generate(move |request, _step| {
                generate_count.fetch_add(1, Ordering::SeqCst);
                request.temperature = Some(0.0);
            })
            .on_step_complete(move |_step| {
                complete_count.fetch_add(1, Ordering::SeqCst);
            });

        let provider = StubProvider::new(vec![StubTurn::text("ok")]);
        let store = InMemoryConversationStore::new();
        let agent = Agent::new(
            AgentConfig::new("", "stub"),
            Arc::new(provider.clone()),
            Arc::new(store),
        )
        .with_hooks(hooks);

        let stream = agent.chat(ChatRequest::new("s1", "hi")).await.unwrap();
        let (_, error) = stream.collect_events().await;
        assert!(error.is_none());

        assert_eq!(generate_calls.load(Ordering::SeqCst), 1);
        assert_eq!(step_completes.load(Ordering::SeqCst), 1);
        // The mutation reached the provider.
        assert_eq!(provider.requests().await[0].temperature, Some(0.0));
    }

    #[tokio::test]
    async fn test_cancellation_still_emits_terminal_event() {
        let token = CancellationToken::new();
        token.cancel();

        let provider = StubProvider::new(vec![StubTurn::text("never")]);
        let store = InMemoryConversationStore::new();
        let agent = Agent::new(
            AgentConfig::new("", "stub"),
            Arc::new(provider),
            Arc::new(store),
        )
        .with_cancellation(token);

        let stream = agent.chat(ChatRequest::new("s1", "hi")).await.unwrap();
        let (events, error) = stream.collect_events().await;

        assert_eq!(terminal(&events).len(), 1);
        assert!(events.last().unwrap().is_terminal());
        assert!(matches!(error, Some(AgentError::Cancelled)));
    }

    #[tokio::test]
    async fn test_plan_events_interleave_with_loop_events() {
        let manager = PlanManager::new();
        let provider = StubProvider::new(vec![
            StubTurn::tool_calls(vec![ToolCall::new(
                "call_p",
                "create_plan",
                serde_json::json!({"goal": "fix bug", "steps": ["reproduce", "patch"]}),
            )]),
            StubTurn::text("planned"),
        ]);
        let store = InMemoryConversationStore::new();
        let agent = agent(provider, store);
        for tool in manager.tools() {
            agent.tools().register(tool);
        }

        let stream = agent.chat(ChatRequest::new("s1", "plan it")).await.unwrap();
        let (events, error) = stream.collect_events().await;
        assert!(error.is_none());

        // PlanCreated arrives between the tool-dispatch boundary events,
        // inside the same stream as everything else.
        let plan_at = events
            .iter()
            .position(|e| matches!(e, StreamEvent::PlanCreated { .. }))
            .unwrap();
        let start_at = events
            .iter()
            .position(|e| matches!(e, StreamEvent::ToolExecutionStart { .. }))
            .unwrap();
        let complete_at = events
            .iter()
            .position(|e| matches!(e, StreamEvent::ToolExecutionComplete { .. }))
            .unwrap();
        assert!(start_at < plan_at && plan_at < complete_at);

        let plan = manager.current().unwrap();
        assert_eq!(plan.steps.len(), 2);
    }

    #[tokio::test]
    async fn test_completed_session_accepts_followup_prompt() {
        let provider = StubProvider::new(vec![StubTurn::text("one"), StubTurn::text("two")]);
        let store = InMemoryConversationStore::new();
        let agent = agent(provider, store.clone());

        let stream = agent.chat(ChatRequest::new("s1", "first")).await.unwrap();
        stream.collect_events().await;

        let stream = agent.chat(ChatRequest::new("s1", "second")).await.unwrap();
        let (_, error) = stream.collect_events().await;
        assert!(error.is_none());

        let conversation = store
            .get_conversation(&ConversationFilter::session("s1"))
            .await
            .unwrap();
        assert_eq!(conversation.status, ConversationStatus::Completed);
        // user, assistant, user, assistant
        assert_eq!(conversation.messages.len(), 4);
    }

    #[tokio::test]
    async fn test_history_limit_truncates_request() {
        let provider = StubProvider::new(vec![StubTurn::text("one"), StubTurn::text("two")]);
        let store = InMemoryConversationStore::new();
        let agent = Agent::new(
            AgentConfig::new("", "stub").with_history_limit(2),
            Arc::new(provider.clone()),
            Arc::new(store),
        );

        let stream = agent.chat(ChatRequest::new("s1", "first")).await.unwrap();
        stream.collect_events().await;
        let stream = agent.chat(ChatRequest::new("s1", "second")).await.unwrap();
        stream.collect_events().await;

        let requests = provider.requests().await;
        // Second chat sees 3 stored messages but only the trailing 2.
        assert_eq!(requests[1].messages.len(), 2);
    }

    #[tokio::test]
    async fn test_dynamic_tool_registration_visible_next_turn() {
        struct InstallEchoTool {
            registry: std::sync::Mutex<Option<ToolRegistry>>,
        }

        impl crate::tools::ToolAdder for InstallEchoTool {
            fn bind_registry(&self, registry: ToolRegistry) {
                *self.registry.lock().unwrap() = Some(registry);
            }
        }

        #[async_trait::async_trait]
        impl Tool for InstallEchoTool {
            fn name(&self) -> &str {
                "install_echo"
            }
            fn description(&self) -> &str {
                "Installs the echo tool."
            }
            fn parameters_schema(&self) -> serde_json::Value {
                serde_json::json!({"type": "object", "properties": {}})
            }
            async fn execute(
                &self,
                _arguments: serde_json::Value,
            ) -> std::result::Result<String, crate::tools::ToolError> {
                let registry = self.registry.lock().unwrap().clone().unwrap();
                registry.register(Arc::new(EchoTool));
                Ok("installed".into())
            }

            fn tool_adder(&self) -> Option<&dyn crate::tools::ToolAdder> {
                Some(self)
            }
        }

        let provider = StubProvider::new(vec![
            StubTurn::tool_calls(vec![ToolCall::new(
                "c1",
                "install_echo",
                serde_json::json!({}),
            )]),
            StubTurn::text("done"),
        ]);
        let store = InMemoryConversationStore::new();
        let agent = agent(provider.clone(), store);
        agent.tools().register(Arc::new(InstallEchoTool {
            registry: std::sync::Mutex::new(None),
        }));

        let stream = agent.chat(ChatRequest::new("s1", "install")).await.unwrap();
        let (_, error) = stream.collect_events().await;
        assert!(error.is_none());

        let requests = provider.requests().await;
        assert_eq!(requests[0].tools.len(), 1);
        // The turn after registration advertises both tools.
        let mut names: Vec<String> = requests[1].tools.iter().map(|t| t.name.clone()).collect();
        names.sort();
        assert_eq!(names, vec!["echo", "install_echo"]);
    }
}
