// Core domain models for Conductor
// These are the transport-agnostic data structures the engine executes

//! # Domain Models Module
//!
//! This module contains the core domain models for Conductor. These are
//! **pure data structures**: the workflow DAG vocabulary, the per-instance
//! runtime records, the uniform agent contract, and the event shape. No
//! execution logic lives here; the `engine` module interprets these models.

// Step and agent identifier newtypes - the basic building blocks of the DAG
pub mod step;

// Rule and RuleCondition - predicates for conditional-branch steps
pub mod rule;

// WorkflowDefinition, Step, StepKind, RetryPolicy, MergeRule - the DAG itself
pub mod definition;

// WorkflowInstance, StepState - mutable run-time records
pub mod instance;

// Event - at-least-once pub/sub payload with idempotency id
pub mod event;

// AgentEndpoint, AgentRequest/AgentResponse, circuit breaker state
pub mod agent;

// Re-export main types for convenience
// This creates shortcuts so users don't need to know the internal structure

/// Re-export the DAG building blocks
pub use step::{AgentRef, StepId};

/// Re-export predicate types for conditional branches
pub use rule::{Rule, RuleCondition};

/// Re-export workflow definition types
pub use definition::{
    Branch, CompensationRef, MergeRule, RetryPolicy, Step, StepKind, WorkflowDefinition,
};

/// Re-export instance types
/// - WorkflowInstance: one execution of a definition
/// - StepState / StepStatus: nested per-step state machine
/// - HistoryEvent: instance status transitions for audit
pub use instance::{HistoryEvent, InstanceStatus, StepState, StepStatus, WorkflowInstance};

/// Re-export event types
pub use event::Event;

/// Re-export agent contract types
pub use agent::{
    AgentEndpoint, AgentRequest, AgentResponse, BreakerState, CircuitBreakerConfig,
    CircuitBreakerState, ErrorKind, HealthStatus, ResponseStatus,
};
