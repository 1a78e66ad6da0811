// Conductor - multi-agent workflow orchestration core
// A DAG workflow engine that coordinates opaque external agents through a
// uniform request/response client with retry and circuit breaking

//! # Conductor Library
//!
//! This is the main library crate for Conductor, a workflow engine that drives
//! independent service agents (recommendation, inventory, pricing, order,
//! support, marketing) through declared orchestration plans. This file serves
//! as the **library root** and defines the public API that external crates use.
//!
//! ## Core Components
//!
//! ### Domain Models
//! - [`WorkflowDefinition`]: Immutable, versioned DAG of steps with per-step policies
//! - [`Step`] / [`StepKind`]: agent-call, parallel-group, conditional-branch, event-wait
//! - [`WorkflowInstance`]: One execution of a definition with its own mutable state
//! - [`Event`]: At-least-once pub/sub payload with an idempotency id
//!
//! ### Engine Layer
//! - [`WorkflowEngine`]: Interprets a definition DAG and drives one instance
//!   per tokio task to a terminal state
//! - [`AgentClient`]: Uniform invocation wrapper (timeout, retry with jittered
//!   backoff, per-agent circuit breaker) around one external agent endpoint
//! - [`AgentRegistry`]: name/version to endpoint resolution with atomic
//!   copy-on-write snapshots
//! - [`EventBus`]: Broadcast channel used by event-wait steps and for
//!   cross-workflow signaling
//! - [`ResultAggregator`]: Deterministic merge of parallel-group outputs
//! - [`CompensationManager`]: Saga-style reverse-order rollback on failure
//!
//! ## Execution Model
//!
//! One logical task drives each workflow instance. Within that task,
//! parallel-group children run as concurrent sub-tasks, bounded by the
//! engine-wide in-flight call limit. Steps with a declared dependency edge
//! are strictly ordered; steps without one interleave freely. All blocking
//! operations (agent calls, event waits) are async at the runtime level.

// Core domain models (transport-agnostic)
pub mod models;

// Engine implementations (workflow interpreter, agent client, event bus, etc.)
pub mod engine;

// Re-export core domain types for easy access
// This creates a "flat" API - users can import directly from the crate root
pub use models::{
    AgentEndpoint,      // Registry entry for one external agent
    AgentRef,           // name + version agent reference
    AgentRequest,       // Uniform invocation request
    AgentResponse,      // Uniform invocation response
    Branch,             // One arm of a conditional-branch step
    CircuitBreakerConfig,
    CompensationRef,    // Compensating agent call declared on a step
    ErrorKind,          // Transient | Permanent | Validation
    Event,              // Published event with idempotency id
    HealthStatus,       // Registry health marker
    InstanceStatus,     // Pending -> Running -> terminal
    MergeRule,          // concat | first_success | named custom rule
    RetryPolicy,        // max attempts + jittered exponential backoff
    Rule,               // Conditional-branch predicate
    RuleCondition,      // Predicate condition tree
    Step,               // One node in the workflow DAG
    StepId,             // Step identifier newtype
    StepKind,           // agent-call | parallel-group | conditional-branch | event-wait
    StepState,          // Per-step runtime record
    StepStatus,         // NotStarted -> Running -> terminal
    WorkflowDefinition, // Immutable workflow DAG
    WorkflowInstance,   // Mutable run-time record
};

// Re-export engine types for convenience
pub use engine::{
    aggregator::{ChildOutput, ResultAggregator},
    client::{AgentClient, AgentTransport, HttpAgentTransport, InvocationOutcome},
    compensation::CompensationManager,
    config::EngineConfig,
    events::EventBus,
    registry::AgentRegistry,
    storage::{InMemoryWorkflowStorage, WorkflowStorage},
    workflow::WorkflowEngine,
};

// Core error types
use thiserror::Error;

/// Custom error types for Conductor operations
///
/// Transient variants (`AgentUnavailable`, `AgentTimeout`, and `EventTimeout`
/// when the step policy permits re-waiting) are retried inside the agent
/// client and never surface to the engine unless the retry budget is
/// exhausted. Permanent variants fail a step immediately.
#[derive(Error, Debug)]
pub enum ConductorError {
    /// Definition failed validation (cycle, duplicate ids, unresolvable refs)
    #[error("Invalid workflow definition: {reason}")]
    InvalidDefinition { reason: String },

    /// Circuit open or connection failure - transient, retried
    #[error("Agent unavailable: {agent}")]
    AgentUnavailable { agent: String },

    /// Call deadline elapsed - transient, retried with backoff
    #[error("Agent call timed out: {agent}")]
    AgentTimeout { agent: String },

    /// Permanent failure reported by an agent - never retried
    #[error("Validation error: {0}")]
    Validation(String),

    /// An event-wait step exhausted its timeout
    #[error("Timed out waiting for event on topic: {topic}")]
    EventTimeout { topic: String },

    /// A compensating action failed - escalated as PartialFailure
    #[error("Compensation failed for step {step}: {reason}")]
    CompensationFailure { step: String, reason: String },

    /// Error when a workflow definition cannot be found
    #[error("Workflow not found: {id}")]
    WorkflowNotFound { id: String },

    /// Error when a workflow instance cannot be found
    #[error("Instance not found: {id}")]
    InstanceNotFound { id: String },

    /// Agent reference does not resolve in the registry
    #[error("Agent not registered: {agent}")]
    AgentNotRegistered { agent: String },

    /// A named custom merge rule was not registered with the aggregator
    #[error("Merge rule not found: {name}")]
    MergeRuleNotFound { name: String },

    /// Cooperative cancellation was requested for the instance
    #[error("Instance cancelled")]
    Cancelled,

    /// Storage-related errors
    /// Using anyhow::Error for flexible error handling across storage backends
    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal engine error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ConductorError {
    /// Whether the agent client may retry after this error
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConductorError::AgentUnavailable { .. }
                | ConductorError::AgentTimeout { .. }
                | ConductorError::EventTimeout { .. }
        )
    }
}

impl From<std::io::Error> for ConductorError {
    fn from(err: std::io::Error) -> Self {
        ConductorError::Internal(err.to_string())
    }
}

/// Type alias for Results that use our custom error type
pub type Result<T> = std::result::Result<T, ConductorError>;
