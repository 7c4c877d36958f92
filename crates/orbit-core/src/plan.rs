// Plan management
//
// An optional capability that tracks one model-managed, ordered task list
// and exposes it to the model as four callable tools. Every mutation
// emits the matching Plan* event through the same emitter the
// orchestrator uses, so plan activity interleaves with generation and
// tool events in one observable stream.
//
// Handler-level invariants: at most one step is in_progress at a time;
// the plan flips to completed exactly when every step has.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::events::StreamEvent;
use crate::stream::EventEmitter;
use crate::tools::{EventEmitting, Tool, ToolError};

/// Plan status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanStatus {
    Active,
    Completed,
}

/// Plan step status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStepStatus {
    Pending,
    InProgress,
    Completed,
}

/// One step of a plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: Uuid,
    pub description: String,
    pub status: PlanStepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

impl PlanStep {
    fn new(description: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            description: description.into(),
            status: PlanStepStatus::Pending,
            started_at: None,
            completed_at: None,
            result: None,
        }
    }
}

/// A model-managed ordered task list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub goal: String,
    pub steps: Vec<PlanStep>,
    pub status: PlanStatus,
    /// Index of the in-progress step, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<usize>,
}

impl Plan {
    fn new(goal: impl Into<String>, steps: Vec<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            goal: goal.into(),
            steps: steps.into_iter().map(PlanStep::new).collect(),
            status: PlanStatus::Active,
            current_step: None,
        }
    }

    fn all_steps_completed(&self) -> bool {
        !self.steps.is_empty()
            && self
                .steps
                .iter()
                .all(|s| s.status == PlanStepStatus::Completed)
    }
}

// ============================================================================
// PlanManager
// ============================================================================

/// Tracks the single active plan and emits lifecycle events
#[derive(Default)]
pub struct PlanManager {
    plan: Mutex<Option<Plan>>,
    emitter: Mutex<Option<EventEmitter>>,
}

impl PlanManager {
    /// Create a new manager with no plan
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The four plan tools, all backed by this manager
    pub fn tools(self: &Arc<Self>) -> Vec<Arc<dyn Tool>> {
        vec![
            Arc::new(CreatePlanTool {
                manager: Arc::clone(self),
            }),
            Arc::new(StartNextStepTool {
                manager: Arc::clone(self),
            }),
            Arc::new(CompleteCurrentStepTool {
                manager: Arc::clone(self),
            }),
            Arc::new(UpdatePlanTool {
                manager: Arc::clone(self),
            }),
        ]
    }

    /// A copy of the current plan, if any
    pub fn current(&self) -> Option<Plan> {
        self.plan.lock().unwrap().clone()
    }

    fn bind(&self, emitter: EventEmitter) {
        *self.emitter.lock().unwrap() = Some(emitter);
    }

    async fn emit(&self, event: StreamEvent) {
        let emitter = self.emitter.lock().unwrap().clone();
        if let Some(emitter) = emitter {
            let _ = emitter.emit(event).await;
        }
    }

    async fn create_plan(
        &self,
        goal: String,
        steps: Vec<String>,
    ) -> std::result::Result<Plan, ToolError> {
        if steps.is_empty() {
            return Err(ToolError::new("a plan needs at least one step"));
        }
        let plan = Plan::new(goal, steps);
        *self.plan.lock().unwrap() = Some(plan.clone());
        self.emit(StreamEvent::plan_created(plan.clone())).await;
        Ok(plan)
    }

    async fn start_next_step(&self) -> std::result::Result<PlanStep, ToolError> {
        let started = {
            let mut guard = self.plan.lock().unwrap();
            let plan = guard
                .as_mut()
                .ok_or_else(|| ToolError::new("no active plan; call create_plan first"))?;
            if plan
                .steps
                .iter()
                .any(|s| s.status == PlanStepStatus::InProgress)
            {
                return Err(ToolError::new(
                    "a step is already in progress; complete it before starting the next",
                ));
            }
            let index = plan
                .steps
                .iter()
                .position(|s| s.status == PlanStepStatus::Pending)
                .ok_or_else(|| ToolError::new("no pending steps remain"))?;
            let step = &mut plan.steps[index];
            step.status = PlanStepStatus::InProgress;
            step.started_at = Some(Utc::now());
            plan.current_step = Some(index);
            step.clone()
        };
        self.emit(StreamEvent::plan_step_started(started.clone()))
            .await;
        Ok(started)
    }

    async fn complete_current_step(
        &self,
        result: Option<String>,
    ) -> std::result::Result<PlanStep, ToolError> {
        let (completed, finished_plan) = {
            let mut guard = self.plan.lock().unwrap();
            let plan = guard
                .as_mut()
                .ok_or_else(|| ToolError::new("no active plan; call create_plan first"))?;
            let index = plan
                .steps
                .iter()
                .position(|s| s.status == PlanStepStatus::InProgress)
                .ok_or_else(|| ToolError::new("no step is in progress"))?;
            let step = &mut plan.steps[index];
            step.status = PlanStepStatus::Completed;
            step.completed_at = Some(Utc::now());
            step.result = result;
            plan.current_step = None;
            let completed = step.clone();

            let finished_plan = if plan.all_steps_completed() {
                plan.status = PlanStatus::Completed;
                Some(plan.clone())
            } else {
                None
            };
            (completed, finished_plan)
        };

        self.emit(StreamEvent::plan_step_completed(completed.clone()))
            .await;
        if let Some(plan) = finished_plan {
            self.emit(StreamEvent::plan_completed(plan)).await;
        }
        Ok(completed)
    }

    async fn add_step(&self, description: String) -> std::result::Result<Plan, ToolError> {
        let plan = {
            let mut guard = self.plan.lock().unwrap();
            let plan = guard
                .as_mut()
                .ok_or_else(|| ToolError::new("no active plan; call create_plan first"))?;
            plan.steps.push(PlanStep::new(description));
            // A completed plan regains work when a step is appended.
            plan.status = PlanStatus::Active;
            plan.clone()
        };
        self.emit(StreamEvent::plan_updated(plan.clone())).await;
        Ok(plan)
    }

    async fn remove_step(&self, step_id: Uuid) -> std::result::Result<Plan, ToolError> {
        let (plan, finished_plan) = {
            let mut guard = self.plan.lock().unwrap();
            let plan = guard
                .as_mut()
                .ok_or_else(|| ToolError::new("no active plan; call create_plan first"))?;
            let index = plan
                .steps
                .iter()
                .position(|s| s.id == step_id)
                .ok_or_else(|| ToolError::new(format!("no step with id {}", step_id)))?;
            if plan.steps[index].status == PlanStepStatus::InProgress {
                return Err(ToolError::new("cannot remove the step in progress"));
            }
            plan.steps.remove(index);
            if let Some(current) = plan.current_step {
                if current > index {
                    plan.current_step = Some(current - 1);
                }
            }
            let finished_plan = if plan.status == PlanStatus::Active && plan.all_steps_completed()
            {
                plan.status = PlanStatus::Completed;
                Some(plan.clone())
            } else {
                None
            };
            (plan.clone(), finished_plan)
        };
        self.emit(StreamEvent::plan_updated(plan.clone())).await;
        if let Some(finished) = finished_plan {
            self.emit(StreamEvent::plan_completed(finished)).await;
        }
        Ok(plan)
    }
}

impl std::fmt::Debug for PlanManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanManager")
            .field("plan", &self.current())
            .finish()
    }
}

// ============================================================================
// Plan tools
// ============================================================================

struct CreatePlanTool {
    manager: Arc<PlanManager>,
}

#[async_trait]
impl Tool for CreatePlanTool {
    fn name(&self) -> &str {
        "create_plan"
    }

    fn description(&self) -> &str {
        "Create a multi-step plan for the current goal. Replaces any existing plan."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "goal": {
                    "type": "string",
                    "description": "What the plan is trying to achieve"
                },
                "steps": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Ordered step descriptions"
                }
            },
            "required": ["goal", "steps"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, arguments: Value) -> std::result::Result<String, ToolError> {
        let goal = arguments
            .get("goal")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::new("create_plan requires a goal"))?
            .to_string();
        let steps: Vec<String> = arguments
            .get("steps")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default();

        let plan = self.manager.create_plan(goal, steps).await?;
        Ok(format!(
            "Created plan {} with {} steps",
            plan.id,
            plan.steps.len()
        ))
    }

    fn event_emitting(&self) -> Option<&dyn EventEmitting> {
        Some(self)
    }
}

impl EventEmitting for CreatePlanTool {
    fn bind_emitter(&self, emitter: EventEmitter) {
        self.manager.bind(emitter);
    }
}

struct StartNextStepTool {
    manager: Arc<PlanManager>,
}

#[async_trait]
impl Tool for StartNextStepTool {
    fn name(&self) -> &str {
        "start_next_step"
    }

    fn description(&self) -> &str {
        "Mark the next pending plan step as in progress."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "additionalProperties": false
        })
    }

    async fn execute(&self, _arguments: Value) -> std::result::Result<String, ToolError> {
        let step = self.manager.start_next_step().await?;
        Ok(format!("Started step: {}", step.description))
    }

    fn event_emitting(&self) -> Option<&dyn EventEmitting> {
        Some(self)
    }
}

impl EventEmitting for StartNextStepTool {
    fn bind_emitter(&self, emitter: EventEmitter) {
        self.manager.bind(emitter);
    }
}

struct CompleteCurrentStepTool {
    manager: Arc<PlanManager>,
}

#[async_trait]
impl Tool for CompleteCurrentStepTool {
    fn name(&self) -> &str {
        "complete_current_step"
    }

    fn description(&self) -> &str {
        "Mark the in-progress plan step as completed, optionally recording its result."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "result": {
                    "type": "string",
                    "description": "Outcome of the step"
                }
            },
            "additionalProperties": false
        })
    }

    async fn execute(&self, arguments: Value) -> std::result::Result<String, ToolError> {
        let result = arguments
            .get("result")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let step = self.manager.complete_current_step(result).await?;
        Ok(format!("Completed step: {}", step.description))
    }

    fn event_emitting(&self) -> Option<&dyn EventEmitting> {
        Some(self)
    }
}

impl EventEmitting for CompleteCurrentStepTool {
    fn bind_emitter(&self, emitter: EventEmitter) {
        self.manager.bind(emitter);
    }
}

struct UpdatePlanTool {
    manager: Arc<PlanManager>,
}

#[async_trait]
impl Tool for UpdatePlanTool {
    fn name(&self) -> &str {
        "update_plan"
    }

    fn description(&self) -> &str {
        "Add a step to the plan or remove a step by id."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["add_step", "remove_step"]
                },
                "description": {
                    "type": "string",
                    "description": "Step description (for add_step)"
                },
                "step_id": {
                    "type": "string",
                    "description": "Step id (for remove_step)"
                }
            },
            "required": ["action"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, arguments: Value) -> std::result::Result<String, ToolError> {
        let action = arguments
            .get("action")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::new("update_plan requires an action"))?;

        match action {
            "add_step" => {
                let description = arguments
                    .get("description")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| ToolError::new("add_step requires a description"))?
                    .to_string();
                let plan = self.manager.add_step(description).await?;
                Ok(format!("Plan now has {} steps", plan.steps.len()))
            }
            "remove_step" => {
                let step_id = arguments
                    .get("step_id")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| ToolError::new("remove_step requires a step_id"))?;
                let step_id = Uuid::parse_str(step_id)
                    .map_err(|_| ToolError::new(format!("invalid step_id: {}", step_id)))?;
                let plan = self.manager.remove_step(step_id).await?;
                Ok(format!("Plan now has {} steps", plan.steps.len()))
            }
            other => Err(ToolError::new(format!(
                "unknown update_plan action: {}",
                other
            ))),
        }
    }

    fn event_emitting(&self) -> Option<&dyn EventEmitting> {
        Some(self)
    }
}

impl EventEmitting for UpdatePlanTool {
    fn bind_emitter(&self, emitter: EventEmitter) {
        self.manager.bind(emitter);
    }
}
