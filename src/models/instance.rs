// Run-time records for one workflow execution

//! # Workflow Instance Models
//!
//! This module defines the mutable run-time side of the data model:
//! - [`WorkflowInstance`]: one execution of a definition, owned exclusively
//!   by the engine task driving it and persisted after every mutation so an
//!   engine restart can resume in-flight work
//! - [`StepState`]: the nested per-step state machine
//! - [`HistoryEvent`]: instance status transitions, kept for audit
//!
//! ## State machines
//!
//! Instance: `Pending -> Running -> {Completed, Failed, Compensated,
//! PartialFailure, Cancelled}`.
//!
//! Step: `NotStarted -> Running -> {Succeeded, Failed}`, never backward.
//! `Skipped` marks steps of unchosen branches and is terminal. `Compensated`
//! is terminal and reachable only from `Succeeded` or `Failed`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use super::definition::{StepKind, WorkflowDefinition};
use super::step::StepId;

/// Instance-level status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Compensated,
    /// A compensating action failed after its retries; surfaced for
    /// manual intervention, never silently retried
    PartialFailure,
    Cancelled,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, InstanceStatus::Pending | InstanceStatus::Running)
    }
}

/// Step-level status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    NotStarted,
    Running,
    Succeeded,
    Failed,
    /// Member of an unchosen conditional branch
    Skipped,
    Compensated,
}

/// Per-step runtime record, mutated only by the engine task that owns
/// the instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepState {
    pub status: StepStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub output: Option<serde_json::Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Default for StepState {
    fn default() -> Self {
        Self {
            status: StepStatus::NotStarted,
            attempts: 0,
            last_error: None,
            output: None,
            started_at: None,
            completed_at: None,
        }
    }
}

impl StepState {
    pub fn start(&mut self) {
        self.status = StepStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn succeed(&mut self, output: serde_json::Value) {
        self.status = StepStatus::Succeeded;
        self.output = Some(output);
        self.completed_at = Some(Utc::now());
    }

    pub fn fail<E: Into<String>>(&mut self, error: E) {
        self.status = StepStatus::Failed;
        self.last_error = Some(error.into());
        self.completed_at = Some(Utc::now());
    }

    pub fn skip(&mut self) {
        self.status = StepStatus::Skipped;
        self.completed_at = Some(Utc::now());
    }

    pub fn compensated(&mut self) {
        self.status = StepStatus::Compensated;
    }
}

/// Records one instance status transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub timestamp: DateTime<Utc>,
    pub from: InstanceStatus,
    pub to: InstanceStatus,
    pub note: Option<String>,
}

/// One execution of a workflow definition
///
/// `step_states` keys are exactly the steps reachable from the definition
/// given the branches taken: top-level steps and parallel-group children
/// are seeded at creation, branch steps are added when their branch is
/// chosen (as `NotStarted`) or rejected (as `Skipped`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub definition_id: String,
    pub definition_version: u32,
    pub status: InstanceStatus,
    pub step_states: HashMap<StepId, StepState>,

    /// Accumulated data: `{"input": <submitted payload>}` plus each
    /// completed step's output keyed by step id. Branch predicates and
    /// agent-call payloads read from here.
    pub context: serde_json::Value,

    /// Step ids in completion order; compensation walks this in reverse
    pub completed_order: Vec<StepId>,

    pub history: Vec<HistoryEvent>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl WorkflowInstance {
    /// Create a new pending instance for a definition
    pub fn new(definition: &WorkflowDefinition, input: serde_json::Value) -> Self {
        let mut step_states = HashMap::new();
        seed_states(&definition.steps, &mut step_states);

        Self {
            id: Uuid::new_v4(),
            definition_id: definition.id.clone(),
            definition_version: definition.version,
            status: InstanceStatus::Pending,
            step_states,
            context: serde_json::json!({ "input": input }),
            completed_order: vec![],
            history: vec![],
            started_at: Utc::now(),
            completed_at: None,
            last_error: None,
        }
    }

    /// Transition the instance status, recording a history event
    pub fn set_status(&mut self, to: InstanceStatus, note: Option<String>) {
        self.history.push(HistoryEvent {
            timestamp: Utc::now(),
            from: self.status,
            to,
            note,
        });
        self.status = to;
        if to.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
    }

    /// Mutable access to a step's state, creating a fresh record on
    /// first touch (branch steps appear when their branch resolves)
    pub fn step_state_mut(&mut self, id: &StepId) -> &mut StepState {
        self.step_states.entry(id.clone()).or_default()
    }

    pub fn step_state(&self, id: &StepId) -> Option<&StepState> {
        self.step_states.get(id)
    }

    /// Store a completed step's output into the accumulated context
    pub fn record_output(&mut self, id: &StepId, output: serde_json::Value) {
        if let Some(object) = self.context.as_object_mut() {
            object.insert(id.as_str().to_string(), output);
        }
        self.completed_order.push(id.clone());
    }

    /// The failing step and its last error, if any step failed
    ///
    /// `GetStatus` surfaces this so there is no silent partial success.
    pub fn failing_step(&self) -> Option<(&StepId, &str)> {
        self.step_states
            .iter()
            .filter(|(_, state)| state.status == StepStatus::Failed)
            .filter_map(|(id, state)| state.last_error.as_deref().map(|e| (id, e)))
            .next()
    }
}

/// Seed NotStarted states for steps reachable before any branch resolves
fn seed_states(steps: &[super::definition::Step], out: &mut HashMap<StepId, StepState>) {
    for step in steps {
        out.insert(step.id.clone(), StepState::default());
        if let StepKind::ParallelGroup { children, .. } = &step.kind {
            seed_states(children, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::definition::{MergeRule, Step};
    use crate::models::rule::Rule;
    use crate::models::step::AgentRef;
    use serde_json::json;

    fn create_test_instance() -> WorkflowInstance {
        let definition = WorkflowDefinition::new(
            "checkout",
            "Checkout",
            vec![
                Step::agent_call("reserve", AgentRef::new("inventory", "v1"), "reserve"),
                Step::parallel_group(
                    "quotes",
                    vec![
                        Step::agent_call("price", AgentRef::new("pricing", "v1"), "quote"),
                        Step::agent_call("related", AgentRef::new("recommendation", "v1"), "top"),
                    ],
                    MergeRule::Concat,
                ),
                Step::conditional_branch(
                    "routing",
                    vec![crate::models::definition::Branch {
                        name: "default".to_string(),
                        when: Rule::always("always"),
                        steps: vec![Step::agent_call(
                            "notify",
                            AgentRef::new("support", "v1"),
                            "notify",
                        )],
                    }],
                ),
            ],
        );
        WorkflowInstance::new(&definition, json!({"order_id": "o-1"}))
    }

    #[test]
    fn test_seeding_excludes_branch_steps() {
        let instance = create_test_instance();
        // Top-level steps and group children are seeded; branch-nested
        // "notify" only appears once its branch resolves.
        assert_eq!(instance.step_states.len(), 5);
        assert!(instance.step_state(&StepId::from("price")).is_some());
        assert!(instance.step_state(&StepId::from("notify")).is_none());
    }

    #[test]
    fn test_status_history() {
        let mut instance = create_test_instance();
        instance.set_status(InstanceStatus::Running, None);
        instance.set_status(InstanceStatus::Completed, Some("all steps done".to_string()));

        assert_eq!(instance.history.len(), 2);
        assert_eq!(instance.history[0].from, InstanceStatus::Pending);
        assert_eq!(instance.history[1].to, InstanceStatus::Completed);
        assert!(instance.completed_at.is_some());
        assert!(instance.status.is_terminal());
    }

    #[test]
    fn test_record_output_updates_context_and_order() {
        let mut instance = create_test_instance();
        instance.record_output(&StepId::from("reserve"), json!({"reserved": true}));
        instance.record_output(&StepId::from("quotes"), json!([1, 2]));

        assert_eq!(instance.context["reserve"]["reserved"], json!(true));
        assert_eq!(
            instance.completed_order,
            vec![StepId::from("reserve"), StepId::from("quotes")]
        );
        // Submitted input stays addressable for predicates
        assert_eq!(instance.context["input"]["order_id"], json!("o-1"));
    }

    #[test]
    fn test_failing_step_surfaced() {
        let mut instance = create_test_instance();
        assert!(instance.failing_step().is_none());

        instance
            .step_state_mut(&StepId::from("reserve"))
            .fail("out of stock");
        let (id, error) = instance.failing_step().unwrap();
        assert_eq!(id, &StepId::from("reserve"));
        assert_eq!(error, "out of stock");
    }
}
