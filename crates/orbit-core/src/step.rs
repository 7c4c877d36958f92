// Step state
//
// A Step is one full turn of the agent loop: one generation call plus its
// resulting tool executions. It is created at the top of a loop iteration
// and mutated in place by every canonical event attributed to it; it is
// closed once its tool results have been folded back into the
// conversation.

use serde::{Deserialize, Serialize};

use crate::events::StreamEvent;
use crate::message::{FinishReason, ToolCall, ToolResult, Usage};
use crate::provider::GenerateRequest;

/// One iteration of the agent loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// 1-based step number, strictly increasing within a run
    pub step_number: u32,

    /// Accumulated assistant text
    pub content: String,

    /// Tool calls the model requested this turn
    pub tool_calls: Vec<ToolCall>,

    /// Results of the tool calls executed this turn
    pub tool_results: Vec<ToolResult>,

    /// Token usage folded from this turn's snapshots
    pub usage: Usage,

    /// Why this turn's generation stopped
    pub finish_reason: Option<FinishReason>,

    /// The exact request that produced this step
    pub request: GenerateRequest,
}

impl Step {
    /// Create a fresh step for a request about to be sent
    pub fn new(step_number: u32, request: GenerateRequest) -> Self {
        Self {
            step_number,
            content: String::new(),
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            usage: Usage::default(),
            finish_reason: None,
            request,
        }
    }

    /// Fold a canonical event into this step's state.
    ///
    /// TextComplete is authoritative over accumulated deltas. StreamEnd's
    /// usage is a convenience copy and is deliberately not folded; only
    /// Usage events count toward the step total.
    pub fn apply_event(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::TextDelta { delta, .. } => self.content.push_str(delta),
            StreamEvent::TextComplete { text, .. } => self.content = text.clone(),
            StreamEvent::ToolCallComplete { tool_call, .. } => {
                self.tool_calls.push(tool_call.clone())
            }
            StreamEvent::Usage { usage, .. } => self.usage.add(usage),
            StreamEvent::FinishReason { reason, .. } => self.finish_reason = Some(*reason),
            StreamEvent::StreamEnd { reason, .. } => {
                if self.finish_reason.is_none() {
                    self.finish_reason = *reason;
                }
            }
            _ => {}
        }
    }

    /// Whether the model requested tool calls this turn
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}
