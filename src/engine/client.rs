// Agent invocation client - timeout, retry, circuit breaking

//! # Agent Client
//!
//! Makes one logical call to an external agent resilient to transient
//! failure without masking permanent failure.
//!
//! ## Call path
//!
//! 1. Resolve the agent through a registry snapshot (no lock held during
//!    the network call)
//! 2. Check the per-agent circuit breaker; an open breaker fails
//!    immediately with `AgentUnavailable` without contacting the agent
//! 3. Perform the call under the remaining deadline
//! 4. On transient failure, retry with capped exponential backoff plus
//!    random jitter, re-checking deadline and cancellation before every
//!    retry
//!
//! Permanent and validation failures propagate immediately and are never
//! retried. Retries and circuit breaking stay entirely inside this module;
//! the workflow engine only sees exhausted failures.

use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::engine::registry::AgentRegistry;
use crate::models::{
    AgentEndpoint, AgentRef, AgentRequest, AgentResponse, CircuitBreakerConfig,
    CircuitBreakerState, ErrorKind, ResponseStatus, RetryPolicy,
};
use crate::{ConductorError, Result};

/// Transport abstraction for one agent call
///
/// One implementation exists per transport (HTTP, in-process test
/// doubles). Implementations classify their own failures: connection
/// problems surface as `AgentUnavailable`, elapsed deadlines as
/// `AgentTimeout`, agent-reported errors as an [`AgentResponse`] carrying
/// an [`ErrorKind`].
#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn call(&self, endpoint: &AgentEndpoint, request: &AgentRequest)
        -> Result<AgentResponse>;
}

/// HTTP transport posting the uniform request contract as JSON
pub struct HttpAgentTransport {
    client: reqwest::Client,
}

impl HttpAgentTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpAgentTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentTransport for HttpAgentTransport {
    async fn call(
        &self,
        endpoint: &AgentEndpoint,
        request: &AgentRequest,
    ) -> Result<AgentResponse> {
        debug!(agent = %request.agent, operation = %request.operation, address = %endpoint.address, "agent call");

        let response = self
            .client
            .post(&endpoint.address)
            .json(request)
            .timeout(Duration::from_millis(request.deadline_ms.max(1)))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ConductorError::AgentTimeout {
                        agent: request.agent.to_string(),
                    }
                } else {
                    ConductorError::AgentUnavailable {
                        agent: request.agent.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if status.is_server_error() {
            return Ok(AgentResponse::error(
                ErrorKind::Transient,
                format!("upstream error {}", status),
            ));
        }
        if status.is_client_error() {
            return Ok(AgentResponse::error(
                ErrorKind::Permanent,
                format!("request rejected with {}", status),
            ));
        }

        response
            .json::<AgentResponse>()
            .await
            .map_err(|e| ConductorError::Validation(format!("malformed agent response: {}", e)))
    }
}

/// Result of one logical invocation, with the attempt count the retry
/// loop consumed
#[derive(Debug)]
pub struct InvocationOutcome {
    pub attempts: u32,
    pub result: Result<serde_json::Value>,
}

/// Uniform invocation wrapper around external agents
///
/// One circuit breaker cell exists per (agent name, version), shared by
/// every caller of this client, including compensation calls. Cells are
/// mutated only under the map's short per-entry lock.
pub struct AgentClient {
    registry: Arc<AgentRegistry>,
    transport: Arc<dyn AgentTransport>,
    breakers: DashMap<AgentRef, CircuitBreakerState>,
    breaker_config: CircuitBreakerConfig,
}

impl AgentClient {
    pub fn new(
        registry: Arc<AgentRegistry>,
        transport: Arc<dyn AgentTransport>,
        breaker_config: CircuitBreakerConfig,
    ) -> Self {
        Self {
            registry,
            transport,
            breakers: DashMap::new(),
            breaker_config,
        }
    }

    /// Snapshot of an agent's breaker cell, if any call touched it yet
    pub fn breaker_state(&self, agent: &AgentRef) -> Option<CircuitBreakerState> {
        self.breakers.get(agent).map(|cell| cell.clone())
    }

    /// Make one logical call: resolve, admit, call, retry transients
    ///
    /// `deadline` bounds the whole invocation including retries and
    /// backoff sleeps. The returned outcome always reports how many
    /// attempts actually reached the transport.
    pub async fn invoke(
        &self,
        agent: &AgentRef,
        operation: &str,
        payload: serde_json::Value,
        deadline: Instant,
        retry: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> InvocationOutcome {
        let mut attempts = 0u32;

        loop {
            if cancel.is_cancelled() {
                return InvocationOutcome {
                    attempts,
                    result: Err(ConductorError::Cancelled),
                };
            }

            // Fresh snapshot per attempt so endpoint swaps apply to retries
            let endpoint = match self.registry.resolve(agent) {
                Some(endpoint) => endpoint,
                None => {
                    return InvocationOutcome {
                        attempts,
                        result: Err(ConductorError::AgentNotRegistered {
                            agent: agent.to_string(),
                        }),
                    }
                }
            };

            let admitted = self
                .breakers
                .entry(agent.clone())
                .or_default()
                .admit(self.breaker_config.reset_timeout);
            if !admitted {
                debug!(agent = %agent, "circuit open, short-circuiting");
                return InvocationOutcome {
                    attempts,
                    result: Err(ConductorError::AgentUnavailable {
                        agent: agent.to_string(),
                    }),
                };
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.abort_trial(agent);
                return InvocationOutcome {
                    attempts,
                    result: Err(ConductorError::AgentTimeout {
                        agent: agent.to_string(),
                    }),
                };
            }

            attempts += 1;
            let request = AgentRequest {
                agent: agent.clone(),
                operation: operation.to_string(),
                payload: payload.clone(),
                deadline_ms: remaining.as_millis() as u64,
            };

            let attempt_result = tokio::select! {
                _ = cancel.cancelled() => {
                    self.abort_trial(agent);
                    return InvocationOutcome {
                        attempts,
                        result: Err(ConductorError::Cancelled),
                    };
                }
                outcome = tokio::time::timeout(remaining, self.transport.call(&endpoint, &request)) => {
                    match outcome {
                        Err(_) => Err(ConductorError::AgentTimeout {
                            agent: agent.to_string(),
                        }),
                        Ok(Err(e)) => Err(e),
                        Ok(Ok(response)) => classify_response(agent, response),
                    }
                }
            };

            match attempt_result {
                Ok(data) => {
                    self.record_success(agent);
                    return InvocationOutcome {
                        attempts,
                        result: Ok(data),
                    };
                }
                Err(error) if !error.is_transient() => {
                    // Permanent failures say nothing about agent health
                    self.abort_trial(agent);
                    return InvocationOutcome {
                        attempts,
                        result: Err(error),
                    };
                }
                Err(error) => {
                    self.record_failure(agent);
                    warn!(agent = %agent, attempt = attempts, error = %error, "transient agent failure");

                    if attempts >= retry.max_attempts {
                        return InvocationOutcome {
                            attempts,
                            result: Err(error),
                        };
                    }

                    let delay = jittered_backoff(retry, attempts - 1);
                    if Instant::now() + delay >= deadline {
                        return InvocationOutcome {
                            attempts,
                            result: Err(ConductorError::AgentTimeout {
                                agent: agent.to_string(),
                            }),
                        };
                    }

                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return InvocationOutcome {
                                attempts,
                                result: Err(ConductorError::Cancelled),
                            };
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn record_success(&self, agent: &AgentRef) {
        self.breakers
            .entry(agent.clone())
            .or_default()
            .record_success();
    }

    fn record_failure(&self, agent: &AgentRef) {
        self.breakers
            .entry(agent.clone())
            .or_default()
            .record_failure(self.breaker_config.failure_threshold);
    }

    fn abort_trial(&self, agent: &AgentRef) {
        if let Some(mut cell) = self.breakers.get_mut(agent) {
            cell.abort_trial();
        }
    }
}

/// Map an agent-reported response onto the error taxonomy
fn classify_response(agent: &AgentRef, response: AgentResponse) -> Result<serde_json::Value> {
    match response.status {
        ResponseStatus::Ok => Ok(response.data),
        ResponseStatus::Error => {
            let message = response
                .message
                .unwrap_or_else(|| "agent reported an error".to_string());
            match response.error_kind {
                Some(ErrorKind::Transient) => Err(ConductorError::AgentUnavailable {
                    agent: format!("{}: {}", agent, message),
                }),
                Some(ErrorKind::Validation) | Some(ErrorKind::Permanent) | None => {
                    Err(ConductorError::Validation(message))
                }
            }
        }
    }
}

/// Exponential backoff with uniform random jitter up to
/// `jitter_fraction` of the computed delay
fn jittered_backoff(retry: &RetryPolicy, attempt: u32) -> Duration {
    let base = retry.backoff(attempt);
    let fraction = rand::thread_rng().gen_range(0.0..=retry.jitter_fraction.max(0.0));
    base + base.mul_f64(fraction)
}
