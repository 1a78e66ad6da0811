// Conductor Engine
// This contains the execution engines that drive workflow instances

//! # Conductor Engine Module
//!
//! This module contains the execution layer that sits between the domain
//! models and the external agents.
//!
//! ## Engine Components
//!
//! ### Workflow Engine (`workflow` module)
//! - Interprets a WorkflowDefinition DAG for one WorkflowInstance
//! - One tokio task per instance; parallel-group children as sub-tasks
//! - Drives every instance to a terminal state, compensating on failure
//!
//! ### Agent Client (`client` module)
//! - Uniform invocation wrapper around one external agent endpoint
//! - Timeout, retry with jittered exponential backoff, per-agent circuit
//!   breaker
//! - Pluggable transports behind the `AgentTransport` trait
//!
//! ### Agent Registry (`registry` module)
//! - name/version to endpoint resolution
//! - Copy-on-write snapshots: readers never block, updates swap a pointer
//!
//! ### Event System (`events` module)
//! - Broadcast bus for event-wait steps and cross-workflow signaling
//! - At-least-once delivery; consumers deduplicate by event id
//!
//! ### Result Aggregator (`aggregator` module)
//! - Merges parallel-group outputs deterministically (declaration order)
//! - Named custom merge rule registry
//!
//! ### Compensation Manager (`compensation` module)
//! - Saga-style unwind of completed steps in reverse execution order
//!
//! ### Storage Engine (`storage` module)
//! - Abstracts definition and instance persistence
//! - In-memory implementation for development/testing

/// Workflow interpreter and per-instance execution driver
pub mod workflow;

/// Agent invocation client with retry and circuit breaking
pub mod client;

/// Copy-on-write agent endpoint registry
pub mod registry;

/// Event bus for event-wait steps and signaling
pub mod events;

/// Deterministic parallel-result merging
pub mod aggregator;

/// Saga compensation on unrecoverable failure
pub mod compensation;

/// Definition and instance persistence abstraction
pub mod storage;

/// Engine configuration and environment loading
pub mod config;

// Re-export main engine types for clean API access
pub use aggregator::{ChildOutput, ResultAggregator};
pub use client::{AgentClient, AgentTransport, HttpAgentTransport, InvocationOutcome};
pub use compensation::CompensationManager;
pub use config::EngineConfig;
pub use events::EventBus;
pub use registry::AgentRegistry;
pub use storage::{InMemoryWorkflowStorage, WorkflowStorage};
pub use workflow::WorkflowEngine;
