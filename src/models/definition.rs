// Workflow definitions - declarative DAGs of agent orchestration steps

//! # Workflow Definitions
//!
//! This module defines the declarative workflow document the engine
//! interprets. A [`WorkflowDefinition`] is a complete orchestration plan:
//! - All steps and their dependency edges (a DAG, validated acyclic)
//! - Per-step timeout, retry, and compensation policies
//! - Merge rules for parallel groups and predicates for branches
//!
//! Definitions are **immutable once published**: the engine never mutates
//! one, and a new revision gets a new `version`. Validation happens at
//! submission, before any instance state exists, so a malformed document
//! can never leave a half-executed instance behind.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use super::rule::Rule;
use super::step::{AgentRef, StepId};
use crate::{ConductorError, Result};

/// Retry policy consumed uniformly by the agent client and the
/// compensation manager
///
/// Backoff is exponential: `base_delay_ms * 2^attempt`, capped at
/// `max_delay_ms`, plus uniform random jitter up to `jitter_fraction` of
/// the computed delay. The jitter draw happens in the agent client; the
/// policy itself is pure data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 10_000,
            jitter_fraction: 0.5,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Base backoff before jitter for a zero-indexed attempt
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay_ms
            .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
        Duration::from_millis(exp.min(self.max_delay_ms))
    }
}

/// How a parallel group's child outputs are combined into one value
///
/// Tie-breaking is always declaration order, never completion order, so a
/// replayed instance produces an identical merged result even under
/// different real-world timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MergeRule {
    /// Ordered list of child outputs, in declaration order
    Concat,
    /// Output of the lowest-indexed child that succeeded
    FirstSuccess,
    /// A named rule registered with the result aggregator
    Custom { name: String },
}

/// Compensating agent call declared on a step
///
/// A step without a compensation reference is treated as irreversible and
/// skipped during saga unwind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationRef {
    pub agent: AgentRef,
    pub operation: String,
    /// Retry policy for the compensating call; falls back to the
    /// definition default when absent
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

/// One arm of a conditional-branch step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    pub name: String,
    /// Predicate evaluated against the accumulated instance context;
    /// the first matching branch in declaration order activates
    pub when: Rule,
    pub steps: Vec<Step>,
}

/// The four step kinds the engine knows how to drive
///
/// Serialized as a tagged union, e.g.
/// `{"kind": {"type": "agent_call", "agent": {...}, "operation": "quote"}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// One call to an external agent through the uniform client
    AgentCall { agent: AgentRef, operation: String },

    /// Children launched concurrently; succeeds when all children succeed,
    /// or when `quorum` children succeed, or always when `best_effort`
    ParallelGroup {
        children: Vec<Step>,
        merge: MergeRule,
        #[serde(default)]
        quorum: Option<usize>,
        #[serde(default)]
        best_effort: bool,
        #[serde(default)]
        max_concurrency: Option<usize>,
    },

    /// Activates exactly one branch; steps of unchosen branches are
    /// marked Skipped to keep the state machine total
    ConditionalBranch { branches: Vec<Branch> },

    /// Suspends until a matching event arrives or the step timeout elapses
    EventWait { topic: String },
}

/// One node in the workflow DAG
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub kind: StepKind,

    /// Top-level dependency edges; a step becomes eligible once every
    /// dependency reached a terminal successful state
    #[serde(default)]
    pub depends_on: Vec<StepId>,

    /// Per-step timeout; the effective deadline is the sooner of this and
    /// the instance deadline
    #[serde(default)]
    pub timeout_seconds: Option<u64>,

    /// Per-step retry policy; falls back to the definition default
    #[serde(default)]
    pub retry: Option<RetryPolicy>,

    #[serde(default)]
    pub compensation: Option<CompensationRef>,
}

impl Step {
    /// Create an agent-call step
    pub fn agent_call<I: Into<StepId>, O: Into<String>>(
        id: I,
        agent: AgentRef,
        operation: O,
    ) -> Self {
        Self {
            id: id.into(),
            kind: StepKind::AgentCall {
                agent,
                operation: operation.into(),
            },
            depends_on: vec![],
            timeout_seconds: None,
            retry: None,
            compensation: None,
        }
    }

    /// Create a parallel-group step
    pub fn parallel_group<I: Into<StepId>>(id: I, children: Vec<Step>, merge: MergeRule) -> Self {
        Self {
            id: id.into(),
            kind: StepKind::ParallelGroup {
                children,
                merge,
                quorum: None,
                best_effort: false,
                max_concurrency: None,
            },
            depends_on: vec![],
            timeout_seconds: None,
            retry: None,
            compensation: None,
        }
    }

    /// Create a conditional-branch step
    pub fn conditional_branch<I: Into<StepId>>(id: I, branches: Vec<Branch>) -> Self {
        Self {
            id: id.into(),
            kind: StepKind::ConditionalBranch { branches },
            depends_on: vec![],
            timeout_seconds: None,
            retry: None,
            compensation: None,
        }
    }

    /// Create an event-wait step
    pub fn event_wait<I: Into<StepId>, T: Into<String>>(id: I, topic: T) -> Self {
        Self {
            id: id.into(),
            kind: StepKind::EventWait {
                topic: topic.into(),
            },
            depends_on: vec![],
            timeout_seconds: None,
            retry: None,
            compensation: None,
        }
    }

    pub fn with_depends_on(mut self, deps: Vec<StepId>) -> Self {
        self.depends_on = deps;
        self
    }

    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_compensation(mut self, compensation: CompensationRef) -> Self {
        self.compensation = Some(compensation);
        self
    }

    /// Visit this step and every step nested below it, depth-first
    pub fn visit<'a>(&'a self, out: &mut Vec<&'a Step>) {
        out.push(self);
        match &self.kind {
            StepKind::ParallelGroup { children, .. } => {
                for child in children {
                    child.visit(out);
                }
            }
            StepKind::ConditionalBranch { branches } => {
                for branch in branches {
                    for step in &branch.steps {
                        step.visit(out);
                    }
                }
            }
            _ => {}
        }
    }
}

/// Immutable, versioned workflow DAG
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Stable identifier, e.g. "order_fulfillment"
    pub id: String,

    /// Human-readable name
    pub name: String,

    /// Revision number; a published (id, version) pair never changes
    #[serde(default = "default_version")]
    pub version: u32,

    /// Top-level steps; nested steps live inside parallel groups and
    /// conditional branches
    pub steps: Vec<Step>,

    /// Global instance timeout
    #[serde(default)]
    pub timeout_seconds: Option<u64>,

    /// Retry policy for steps that declare none
    #[serde(default)]
    pub default_retry: RetryPolicy,
}

fn default_version() -> u32 {
    1
}

impl WorkflowDefinition {
    pub fn new<S: Into<String>, N: Into<String>>(id: S, name: N, steps: Vec<Step>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: 1,
            steps,
            timeout_seconds: None,
            default_retry: RetryPolicy::default(),
        }
    }

    /// Every step in the definition, including nested ones
    pub fn all_steps(&self) -> Vec<&Step> {
        let mut out = Vec::new();
        for step in &self.steps {
            step.visit(&mut out);
        }
        out
    }

    /// Find any step (nested or top-level) by id
    pub fn find_step(&self, id: &StepId) -> Option<&Step> {
        self.all_steps().into_iter().find(|s| &s.id == id)
    }

    /// Every agent reference the definition can touch, including
    /// compensation references, for registry resolution at submit
    pub fn agent_refs(&self) -> Vec<AgentRef> {
        let mut refs = Vec::new();
        for step in self.all_steps() {
            if let StepKind::AgentCall { agent, .. } = &step.kind {
                refs.push(agent.clone());
            }
            if let Some(compensation) = &step.compensation {
                refs.push(compensation.agent.clone());
            }
        }
        refs
    }

    /// Names of custom merge rules the definition relies on
    pub fn custom_merge_rules(&self) -> Vec<String> {
        self.all_steps()
            .into_iter()
            .filter_map(|step| match &step.kind {
                StepKind::ParallelGroup {
                    merge: MergeRule::Custom { name },
                    ..
                } => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    /// Validate the definition structure
    ///
    /// Checks, in order: at least one step; unique step ids across the
    /// whole tree; dependency edges only between top-level steps and only
    /// to known ids; no dependency cycles; group and branch shape rules.
    /// Registry resolution of agent references happens separately at
    /// submission, because it needs live registry state.
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(invalid("definition has no steps"));
        }

        // Unique ids across the whole tree
        let mut seen: HashSet<&StepId> = HashSet::new();
        for step in self.all_steps() {
            if !seen.insert(&step.id) {
                return Err(invalid(format!("duplicate step id '{}'", step.id)));
            }
        }

        let top_level: HashSet<&StepId> = self.steps.iter().map(|s| &s.id).collect();

        for step in self.all_steps() {
            let nested = !top_level.contains(&step.id);
            if nested && !step.depends_on.is_empty() {
                return Err(invalid(format!(
                    "step '{}' is nested and cannot declare dependencies",
                    step.id
                )));
            }
            for dep in &step.depends_on {
                if !top_level.contains(dep) {
                    return Err(invalid(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.id, dep
                    )));
                }
            }
            self.validate_kind(step)?;
        }

        self.check_acyclic()
    }

    fn validate_kind(&self, step: &Step) -> Result<()> {
        match &step.kind {
            StepKind::AgentCall { operation, .. } => {
                if operation.is_empty() {
                    return Err(invalid(format!("step '{}' has an empty operation", step.id)));
                }
            }
            StepKind::ParallelGroup {
                children, quorum, ..
            } => {
                if children.is_empty() {
                    return Err(invalid(format!("group '{}' has no children", step.id)));
                }
                if let Some(q) = quorum {
                    if *q == 0 || *q > children.len() {
                        return Err(invalid(format!(
                            "group '{}' quorum {} out of range 1..={}",
                            step.id,
                            q,
                            children.len()
                        )));
                    }
                }
            }
            StepKind::ConditionalBranch { branches } => {
                if branches.is_empty() {
                    return Err(invalid(format!("branch step '{}' has no branches", step.id)));
                }
                for branch in branches {
                    if branch.steps.is_empty() {
                        return Err(invalid(format!(
                            "branch '{}' of step '{}' has no steps",
                            branch.name, step.id
                        )));
                    }
                }
            }
            StepKind::EventWait { topic } => {
                if topic.is_empty() {
                    return Err(invalid(format!("step '{}' has an empty topic", step.id)));
                }
            }
        }
        Ok(())
    }

    /// Kahn's algorithm over the top-level dependency edges
    fn check_acyclic(&self) -> Result<()> {
        let mut in_degree: HashMap<&StepId, usize> = HashMap::new();
        let mut dependents: HashMap<&StepId, Vec<&StepId>> = HashMap::new();

        for step in &self.steps {
            in_degree.entry(&step.id).or_insert(0);
            for dep in &step.depends_on {
                *in_degree.entry(&step.id).or_insert(0) += 1;
                dependents.entry(dep).or_default().push(&step.id);
            }
        }

        let mut queue: VecDeque<&StepId> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut visited = 0usize;
        while let Some(id) = queue.pop_front() {
            visited += 1;
            if let Some(next) = dependents.get(id) {
                for dependent in next {
                    let degree = in_degree.get_mut(dependent).unwrap();
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(dependent);
                    }
                }
            }
        }

        if visited != self.steps.len() {
            return Err(invalid("dependency cycle detected"));
        }
        Ok(())
    }
}

fn invalid<R: Into<String>>(reason: R) -> ConductorError {
    ConductorError::InvalidDefinition {
        reason: reason.into(),
    }
}
