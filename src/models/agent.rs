// Agent contract models - registry entries, invocation shapes, breaker state

//! # Agent Models
//!
//! Agents are opaque external collaborators reachable through one uniform
//! request/response contract. This module defines that contract plus the
//! registry entry and the per-agent circuit breaker state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use super::step::AgentRef;

/// Health marker on a registry entry, settable by admin operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Registry entry resolving an agent reference to a callable address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEndpoint {
    pub agent: AgentRef,
    pub address: String,
    pub health: HealthStatus,
    pub registered_at: DateTime<Utc>,
}

impl AgentEndpoint {
    pub fn new<A: Into<String>>(agent: AgentRef, address: A) -> Self {
        Self {
            agent,
            address: address.into(),
            health: HealthStatus::Healthy,
            registered_at: Utc::now(),
        }
    }
}

/// Uniform invocation request sent to every agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    pub agent: AgentRef,
    pub operation: String,
    pub payload: serde_json::Value,
    /// Milliseconds the agent has before the caller abandons the call
    pub deadline_ms: u64,
}

/// Response status reported by an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    Error,
}

/// Failure classification reported by agents and transports
///
/// Transient failures are retried with backoff; Permanent and Validation
/// failures propagate immediately and are never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Validation,
}

/// Uniform invocation response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    pub status: ResponseStatus,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub error_kind: Option<ErrorKind>,
    #[serde(default)]
    pub message: Option<String>,
}

impl AgentResponse {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            status: ResponseStatus::Ok,
            data,
            error_kind: None,
            message: None,
        }
    }

    pub fn error<M: Into<String>>(kind: ErrorKind, message: M) -> Self {
        Self {
            status: ResponseStatus::Error,
            data: serde_json::Value::Null,
            error_kind: Some(kind),
            message: Some(message.into()),
        }
    }
}

/// Circuit breaker tuning, shared by every per-agent breaker cell
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive transient failures before the breaker opens
    pub failure_threshold: u32,
    /// How long an open breaker short-circuits before allowing a trial
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Breaker position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-agent failure isolation state
///
/// One cell exists per (agent name, version). Owned by the agent client
/// and mutated only under a short per-agent lock. `Open` implies all new
/// calls short-circuit without contacting the agent until the reset
/// timeout elapses; the first admission after that becomes the single
/// half-open trial.
#[derive(Debug, Clone)]
pub struct CircuitBreakerState {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub opened_at: Option<Instant>,
}

impl Default for CircuitBreakerState {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
        }
    }
}

impl CircuitBreakerState {
    /// Whether a call may proceed right now
    ///
    /// Transitions Open -> HalfOpen when the reset timeout elapsed; the
    /// caller that observes the transition owns the trial call. Other
    /// callers see HalfOpen and are rejected until the trial resolves.
    pub fn admit(&mut self, reset_timeout: Duration) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => false,
            BreakerState::Open => {
                let elapsed = self
                    .opened_at
                    .map(|at| at.elapsed() >= reset_timeout)
                    .unwrap_or(true);
                if elapsed {
                    self.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call: failures reset, a half-open trial
    /// re-closes the breaker
    pub fn record_success(&mut self) {
        self.state = BreakerState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
    }

    /// Revert an admitted half-open trial that never reached the agent
    /// (cancellation, shutdown); the breaker re-opens so a later call can
    /// run the trial instead
    pub fn abort_trial(&mut self) {
        if self.state == BreakerState::HalfOpen {
            self.state = BreakerState::Open;
            self.opened_at = Some(Instant::now());
        }
    }

    /// Record a transient failure; opens the breaker at the threshold,
    /// and immediately re-opens on a failed half-open trial
    pub fn record_failure(&mut self, threshold: u32) {
        match self.state {
            BreakerState::HalfOpen => {
                self.state = BreakerState::Open;
                self.opened_at = Some(Instant::now());
            }
            _ => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= threshold {
                    self.state = BreakerState::Open;
                    self.opened_at = Some(Instant::now());
                }
            }
        }
    }
}
