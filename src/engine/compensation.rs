// Saga compensation - reverse-order rollback of completed steps

//! # Compensation Manager
//!
//! Implements saga-style rollback when a workflow instance reaches
//! `Failed` (or when an operator triggers compensation explicitly).
//!
//! Completed steps are unwound in strict reverse execution order. Each
//! step that declared a compensation reference gets one compensating
//! agent call through the same [`crate::AgentClient`] used for forward
//! execution, with the compensation's own retry policy. Steps without a
//! compensation reference are irreversible and skipped. A compensating
//! action that fails after its retries stops the walk: the instance
//! becomes `PartialFailure` and is surfaced for manual intervention,
//! never retried silently.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::engine::client::AgentClient;
use crate::models::{InstanceStatus, RetryPolicy, WorkflowDefinition, WorkflowInstance};
use crate::ConductorError;

/// Runs compensating actions for one failed instance
pub struct CompensationManager {
    client: Arc<AgentClient>,
    default_retry: RetryPolicy,
    default_step_timeout: Duration,
}

impl CompensationManager {
    pub fn new(
        client: Arc<AgentClient>,
        default_retry: RetryPolicy,
        default_step_timeout: Duration,
    ) -> Self {
        Self {
            client,
            default_retry,
            default_step_timeout,
        }
    }

    /// Unwind the instance's completed steps in reverse execution order
    ///
    /// Returns the terminal status the instance should take:
    /// `Compensated` when every declared compensator succeeded,
    /// `PartialFailure` when one failed. Mutates step states and
    /// `last_error` on the way; the caller persists the instance.
    pub async fn compensate(
        &self,
        instance: &mut WorkflowInstance,
        definition: &WorkflowDefinition,
        cancel: &CancellationToken,
    ) -> InstanceStatus {
        let completed: Vec<_> = instance.completed_order.iter().rev().cloned().collect();

        for step_id in completed {
            let step = match definition.find_step(&step_id) {
                Some(step) => step,
                None => continue,
            };
            let compensation = match &step.compensation {
                Some(compensation) => compensation,
                // No compensation declared: irreversible by design
                None => continue,
            };

            let payload = serde_json::json!({
                "instance_id": instance.id,
                "step_id": step_id,
                "output": instance
                    .step_state(&step_id)
                    .and_then(|state| state.output.clone()),
                "context": instance.context,
            });

            let retry = compensation.retry.as_ref().unwrap_or(&self.default_retry);
            let deadline = Instant::now()
                + step
                    .timeout_seconds
                    .map(Duration::from_secs)
                    .unwrap_or(self.default_step_timeout);

            info!(instance = %instance.id, step = %step_id, agent = %compensation.agent, "compensating step");
            let outcome = self
                .client
                .invoke(
                    &compensation.agent,
                    &compensation.operation,
                    payload,
                    deadline,
                    retry,
                    cancel,
                )
                .await;

            match outcome.result {
                Ok(_) => {
                    instance.step_state_mut(&step_id).compensated();
                }
                Err(error) => {
                    warn!(instance = %instance.id, step = %step_id, error = %error, "compensation failed");
                    let failure = ConductorError::CompensationFailure {
                        step: step_id.to_string(),
                        reason: error.to_string(),
                    };
                    instance.last_error = Some(failure.to_string());
                    return InstanceStatus::PartialFailure;
                }
            }
        }

        InstanceStatus::Compensated
    }
}
