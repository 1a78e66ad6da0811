// Workflow engine - interprets definition DAGs and drives instances

//! # Workflow Engine
//!
//! Interprets a [`WorkflowDefinition`] DAG for one [`WorkflowInstance`]
//! and drives it to a terminal state.
//!
//! ## Scheduling model
//!
//! One tokio task owns each instance. The task executes the DAG in waves:
//! a step becomes eligible once every declared dependency reached a
//! terminal successful state, and all eligible steps of a wave launch
//! concurrently. Parallel-group children run as concurrent sub-tasks,
//! bounded by the group's `max_concurrency` and by the engine-wide
//! in-flight call semaphore that protects downstream agents.
//!
//! ## Failure path
//!
//! A step that exhausts its retry budget marks itself Failed. That fails
//! the owning group (unless best-effort or a met quorum) or the instance.
//! On instance failure the compensation manager unwinds completed steps
//! before the final status is set. Cancellation is cooperative: the
//! instance token aborts in-flight calls and waits, and never triggers
//! compensation by itself.
//!
//! Every instance mutation is persisted through [`WorkflowStorage`], so
//! `recover()` can reload non-terminal instances after an engine restart
//! and resume them without repeating succeeded steps.

use dashmap::DashMap;
use futures::future::{join_all, BoxFuture};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::aggregator::{ChildOutput, ResultAggregator};
use crate::engine::client::{AgentClient, AgentTransport};
use crate::engine::compensation::CompensationManager;
use crate::engine::config::EngineConfig;
use crate::engine::events::EventBus;
use crate::engine::registry::AgentRegistry;
use crate::engine::storage::WorkflowStorage;
use crate::models::{
    AgentRef, Branch, InstanceStatus, MergeRule, Step, StepKind, StepState, StepStatus,
    WorkflowDefinition, WorkflowInstance,
};
use crate::{ConductorError, Result};

/// The workflow engine
///
/// Construct with [`WorkflowEngine::new`], which returns an `Arc` because
/// every submitted instance runs on a spawned task holding a reference to
/// the engine.
pub struct WorkflowEngine {
    registry: Arc<AgentRegistry>,
    client: Arc<AgentClient>,
    bus: EventBus,
    aggregator: Arc<ResultAggregator>,
    compensation: CompensationManager,
    storage: Arc<dyn WorkflowStorage>,
    config: EngineConfig,

    /// Engine-wide cap on concurrent in-flight agent calls
    call_permits: Arc<Semaphore>,

    /// Event ids already consumed by event-wait steps; redelivery of a
    /// seen id is a no-op
    consumed_events: DashMap<Uuid, ()>,

    /// Cancellation tokens of live instance tasks
    running: DashMap<Uuid, CancellationToken>,
}

impl WorkflowEngine {
    pub fn new(
        registry: Arc<AgentRegistry>,
        transport: Arc<dyn AgentTransport>,
        storage: Arc<dyn WorkflowStorage>,
        aggregator: ResultAggregator,
        config: EngineConfig,
    ) -> Arc<Self> {
        let client = Arc::new(AgentClient::new(
            registry.clone(),
            transport,
            config.breaker.clone(),
        ));
        let compensation = CompensationManager::new(
            client.clone(),
            config.default_retry.clone(),
            config.default_step_timeout,
        );

        Arc::new(Self {
            registry,
            client,
            bus: EventBus::new(config.event_buffer_size),
            aggregator: Arc::new(aggregator),
            compensation,
            storage,
            call_permits: Arc::new(Semaphore::new(config.max_inflight_calls)),
            consumed_events: DashMap::new(),
            running: DashMap::new(),
            config,
        })
    }

    /// The bus external producers publish on and subscribers listen to
    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    /// The registry admin operations go through
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// The shared agent client, exposing breaker state for operators
    pub fn agent_client(&self) -> &Arc<AgentClient> {
        &self.client
    }

    /// Validate and submit a definition with an input payload
    ///
    /// Validation covers DAG structure, registry resolution of every
    /// agent and compensation reference, and custom merge rule names.
    /// On success a Pending instance is persisted and execution starts
    /// asynchronously.
    pub async fn submit(
        self: &Arc<Self>,
        definition: WorkflowDefinition,
        input: serde_json::Value,
    ) -> Result<Uuid> {
        definition.validate()?;

        for agent in definition.agent_refs() {
            if self.registry.resolve(&agent).is_none() {
                return Err(ConductorError::InvalidDefinition {
                    reason: format!("agent '{}' is not registered", agent),
                });
            }
        }
        for rule_name in definition.custom_merge_rules() {
            if !self.aggregator.has_rule(&rule_name) {
                return Err(ConductorError::InvalidDefinition {
                    reason: format!("custom merge rule '{}' is not registered", rule_name),
                });
            }
        }

        self.storage.create_definition(definition.clone()).await?;
        let instance = WorkflowInstance::new(&definition, input);
        let instance_id = instance.id;
        self.storage.create_instance(instance).await?;

        info!(instance = %instance_id, definition = %definition.id, "instance submitted");
        self.spawn_instance(instance_id, definition);
        Ok(instance_id)
    }

    /// Non-blocking snapshot of an instance
    pub async fn get_status(&self, id: &Uuid) -> Result<WorkflowInstance> {
        self.storage
            .get_instance(id)
            .await?
            .ok_or_else(|| ConductorError::InstanceNotFound { id: id.to_string() })
    }

    /// Request cooperative cancellation of a running instance
    ///
    /// Steps already completed are not rolled back; compensation is a
    /// separate explicit decision.
    pub async fn cancel(&self, id: &Uuid) -> Result<()> {
        if let Some(entry) = self.running.get(id) {
            info!(instance = %id, "cancellation requested");
            entry.value().cancel();
            return Ok(());
        }
        // Not running: a no-op for known instances
        self.get_status(id).await.map(|_| ())
    }

    /// Manually trigger compensation for a Failed or Cancelled instance
    pub async fn compensate(&self, id: &Uuid) -> Result<InstanceStatus> {
        let mut instance = self.get_status(id).await?;
        if !matches!(
            instance.status,
            InstanceStatus::Failed | InstanceStatus::Cancelled
        ) {
            return Err(ConductorError::Validation(format!(
                "instance {} is {:?}; only Failed or Cancelled instances can be compensated",
                id, instance.status
            )));
        }

        let definition = self.definition_for(&instance).await?;
        let status = self
            .compensation
            .compensate(&mut instance, &definition, &CancellationToken::new())
            .await;
        instance.set_status(status, Some("manual compensation".to_string()));
        self.storage.update_instance(instance).await?;
        Ok(status)
    }

    /// Resume every persisted non-terminal instance, for engine restarts
    pub async fn recover(self: &Arc<Self>) -> Result<Vec<Uuid>> {
        let inflight = self.storage.list_inflight_instances().await?;
        let mut resumed = Vec::new();

        for instance in inflight {
            if self.running.contains_key(&instance.id) {
                continue;
            }
            match self.definition_for(&instance).await {
                Ok(definition) => {
                    info!(instance = %instance.id, "resuming in-flight instance");
                    self.spawn_instance(instance.id, definition);
                    resumed.push(instance.id);
                }
                Err(e) => {
                    warn!(instance = %instance.id, error = %e, "cannot resume instance");
                }
            }
        }
        Ok(resumed)
    }

    async fn definition_for(&self, instance: &WorkflowInstance) -> Result<WorkflowDefinition> {
        self.storage
            .get_definition(&instance.definition_id, instance.definition_version)
            .await?
            .ok_or_else(|| ConductorError::WorkflowNotFound {
                id: instance.definition_id.clone(),
            })
    }

    fn spawn_instance(self: &Arc<Self>, id: Uuid, definition: WorkflowDefinition) {
        let cancel = CancellationToken::new();
        self.running.insert(id, cancel.clone());

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.run_instance(id, definition, cancel).await;
            engine.running.remove(&id);
        });
    }

    /// Drive one instance to a terminal state
    async fn run_instance(
        &self,
        id: Uuid,
        definition: WorkflowDefinition,
        cancel: CancellationToken,
    ) {
        let instance = match self.storage.get_instance(&id).await {
            Ok(Some(instance)) => instance,
            other => {
                error!(instance = %id, "instance vanished before execution: {:?}", other.err());
                return;
            }
        };

        let shared = Arc::new(Mutex::new(instance));
        {
            let mut guard = shared.lock().await;
            // Steps interrupted mid-flight by a crash restart fresh
            for state in guard.step_states.values_mut() {
                if state.status == StepStatus::Running {
                    *state = StepState::default();
                }
            }
            if guard.status != InstanceStatus::Running {
                guard.set_status(InstanceStatus::Running, None);
            }
            self.persist(&guard).await;
        }

        let instance_deadline = definition
            .timeout_seconds
            .map(|seconds| Instant::now() + Duration::from_secs(seconds));

        let outcome = self
            .drive(&definition, &shared, instance_deadline, &cancel)
            .await;

        let mut guard = shared.lock().await;
        match outcome {
            Ok(()) => {
                info!(instance = %id, "instance completed");
                guard.set_status(InstanceStatus::Completed, None);
            }
            Err(ConductorError::Cancelled) => {
                info!(instance = %id, "instance cancelled");
                guard.set_status(InstanceStatus::Cancelled, None);
            }
            Err(step_error) => {
                warn!(instance = %id, error = %step_error, "instance failed, compensating");
                guard.last_error = Some(step_error.to_string());
                guard.set_status(InstanceStatus::Failed, Some(step_error.to_string()));
                self.persist(&guard).await;

                let status = self
                    .compensation
                    .compensate(&mut guard, &definition, &cancel)
                    .await;
                guard.set_status(status, None);
            }
        }
        self.persist(&guard).await;
        let _ = self.bus.emit_instance_finished(&guard).await;
    }

    /// Wave scheduler over the top-level DAG
    async fn drive(
        &self,
        definition: &WorkflowDefinition,
        shared: &Arc<Mutex<WorkflowInstance>>,
        instance_deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(ConductorError::Cancelled);
            }

            let eligible: Vec<Step> = {
                let guard = shared.lock().await;
                definition
                    .steps
                    .iter()
                    .filter(|step| {
                        matches!(
                            guard.step_state(&step.id).map(|s| s.status),
                            Some(StepStatus::NotStarted)
                        )
                    })
                    .filter(|step| {
                        step.depends_on.iter().all(|dep| {
                            matches!(
                                guard.step_state(dep).map(|s| s.status),
                                Some(StepStatus::Succeeded) | Some(StepStatus::Skipped)
                            )
                        })
                    })
                    .cloned()
                    .collect()
            };

            if eligible.is_empty() {
                let guard = shared.lock().await;
                // A recovered instance may carry a step that already
                // failed before the crash
                if let Some(step) = definition.steps.iter().find(|step| {
                    matches!(
                        guard.step_state(&step.id).map(|s| s.status),
                        Some(StepStatus::Failed)
                    )
                }) {
                    let reason = guard
                        .step_state(&step.id)
                        .and_then(|s| s.last_error.clone())
                        .unwrap_or_else(|| "step failed".to_string());
                    return Err(ConductorError::Internal(format!(
                        "step '{}' failed: {}",
                        step.id, reason
                    )));
                }
                let unfinished = definition.steps.iter().any(|step| {
                    matches!(
                        guard.step_state(&step.id).map(|s| s.status),
                        Some(StepStatus::NotStarted) | Some(StepStatus::Running)
                    )
                });
                if unfinished {
                    // Validation rules out unreachable dependencies, so
                    // this only fires on storage corruption
                    return Err(ConductorError::Internal(
                        "no eligible steps but unfinished work remains".to_string(),
                    ));
                }
                return Ok(());
            }

            let wave = eligible.iter().map(|step| {
                self.execute_step_boxed(step, definition, shared, instance_deadline, cancel)
            });
            for result in join_all(wave).await {
                result?;
            }
        }
    }

    /// Boxed indirection so step execution can recurse into groups and
    /// branches
    fn execute_step_boxed<'a>(
        &'a self,
        step: &'a Step,
        definition: &'a WorkflowDefinition,
        shared: &'a Arc<Mutex<WorkflowInstance>>,
        instance_deadline: Option<Instant>,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.execute_step(step, definition, shared, instance_deadline, cancel))
    }

    async fn execute_step(
        &self,
        step: &Step,
        definition: &WorkflowDefinition,
        shared: &Arc<Mutex<WorkflowInstance>>,
        instance_deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        {
            let mut guard = shared.lock().await;
            // Resumed instances keep finished work
            if matches!(
                guard.step_state(&step.id).map(|s| s.status),
                Some(StepStatus::Succeeded) | Some(StepStatus::Skipped)
            ) {
                return Ok(());
            }
            guard.step_state_mut(&step.id).start();
            self.persist(&guard).await;
        }
        debug!(step = %step.id, "step started");

        let deadline = self.step_deadline(step, instance_deadline);
        let outcome = match &step.kind {
            StepKind::AgentCall { agent, operation } => {
                self.run_agent_call(step, agent, operation, definition, shared, deadline, cancel)
                    .await
            }
            StepKind::ParallelGroup {
                children,
                merge,
                quorum,
                best_effort,
                max_concurrency,
            } => {
                self.run_parallel_group(
                    children,
                    merge,
                    *quorum,
                    *best_effort,
                    *max_concurrency,
                    definition,
                    shared,
                    instance_deadline,
                    cancel,
                )
                .await
            }
            StepKind::ConditionalBranch { branches } => {
                self.run_conditional_branch(
                    step,
                    branches,
                    definition,
                    shared,
                    instance_deadline,
                    cancel,
                )
                .await
            }
            StepKind::EventWait { topic } => {
                self.run_event_wait(step, topic, instance_deadline, cancel).await
            }
        };

        let mut guard = shared.lock().await;
        match outcome {
            Ok(output) => {
                guard.step_state_mut(&step.id).succeed(output.clone());
                guard.record_output(&step.id, output);
                self.persist(&guard).await;
                let _ = self
                    .bus
                    .emit_step_finished(&guard, &step.id, StepStatus::Succeeded)
                    .await;
                Ok(())
            }
            Err(error) => {
                guard.step_state_mut(&step.id).fail(error.to_string());
                self.persist(&guard).await;
                let _ = self
                    .bus
                    .emit_step_finished(&guard, &step.id, StepStatus::Failed)
                    .await;
                Err(error)
            }
        }
    }

    /// Effective deadline: the sooner of step timeout and instance
    /// deadline
    fn step_deadline(&self, step: &Step, instance_deadline: Option<Instant>) -> Instant {
        let step_limit = Instant::now()
            + step
                .timeout_seconds
                .map(Duration::from_secs)
                .unwrap_or(self.config.default_step_timeout);
        match instance_deadline {
            Some(limit) => step_limit.min(limit),
            None => step_limit,
        }
    }

    async fn run_agent_call(
        &self,
        step: &Step,
        agent: &AgentRef,
        operation: &str,
        definition: &WorkflowDefinition,
        shared: &Arc<Mutex<WorkflowInstance>>,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value> {
        let payload = { shared.lock().await.context.clone() };
        let retry = step
            .retry
            .clone()
            .unwrap_or_else(|| definition.default_retry.clone());

        // Global cap on in-flight agent calls across all instances
        let _permit = self
            .call_permits
            .acquire()
            .await
            .map_err(|_| ConductorError::Internal("engine is shutting down".to_string()))?;

        let outcome = self
            .client
            .invoke(agent, operation, payload, deadline, &retry, cancel)
            .await;

        {
            let mut guard = shared.lock().await;
            guard.step_state_mut(&step.id).attempts = outcome.attempts;
        }
        outcome.result
    }

    async fn run_parallel_group(
        &self,
        children: &[Step],
        merge: &MergeRule,
        quorum: Option<usize>,
        best_effort: bool,
        max_concurrency: Option<usize>,
        definition: &WorkflowDefinition,
        shared: &Arc<Mutex<WorkflowInstance>>,
        instance_deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value> {
        let group_slots = max_concurrency.map(|limit| Arc::new(Semaphore::new(limit)));

        let child_runs = children.iter().map(|child| {
            let group_slots = group_slots.clone();
            async move {
                let _slot = match &group_slots {
                    Some(slots) => Some(slots.acquire().await.map_err(|_| {
                        ConductorError::Internal("group semaphore closed".to_string())
                    })?),
                    None => None,
                };
                self.execute_step_boxed(child, definition, shared, instance_deadline, cancel)
                    .await
            }
        });
        let child_results = join_all(child_runs).await;

        if cancel.is_cancelled()
            || child_results
                .iter()
                .any(|r| matches!(r, Err(ConductorError::Cancelled)))
        {
            return Err(ConductorError::Cancelled);
        }

        let child_outputs: Vec<ChildOutput> = {
            let guard = shared.lock().await;
            children
                .iter()
                .enumerate()
                .map(|(index, child)| {
                    let state = guard.step_state(&child.id);
                    ChildOutput {
                        step: child.id.clone(),
                        index,
                        succeeded: matches!(
                            state.map(|s| s.status),
                            Some(StepStatus::Succeeded)
                        ),
                        output: state.and_then(|s| s.output.clone()),
                    }
                })
                .collect()
        };

        let succeeded = child_outputs.iter().filter(|c| c.succeeded).count();
        let required = quorum.unwrap_or(children.len());

        if succeeded < required && !best_effort {
            // Propagate the first child failure; the failed child states
            // stay recorded for audit
            let first_error = child_results
                .into_iter()
                .find_map(|r| r.err())
                .unwrap_or_else(|| {
                    ConductorError::Internal("group failed without child error".to_string())
                });
            return Err(first_error);
        }

        self.aggregator.merge(&child_outputs, merge)
    }

    async fn run_conditional_branch(
        &self,
        step: &Step,
        branches: &[Branch],
        definition: &WorkflowDefinition,
        shared: &Arc<Mutex<WorkflowInstance>>,
        instance_deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value> {
        // First matching branch in declaration order activates
        let chosen = {
            let guard = shared.lock().await;
            branches.iter().position(|b| b.when.evaluate(&guard.context))
        };
        let chosen = chosen.ok_or_else(|| {
            ConductorError::Validation(format!("no branch of step '{}' matched", step.id))
        })?;

        {
            let mut guard = shared.lock().await;
            for (index, branch) in branches.iter().enumerate() {
                if index == chosen {
                    continue;
                }
                let mut unchosen = Vec::new();
                for branch_step in &branch.steps {
                    branch_step.visit(&mut unchosen);
                }
                for skipped in unchosen {
                    guard.step_state_mut(&skipped.id).skip();
                }
            }
            self.persist(&guard).await;
        }
        debug!(step = %step.id, branch = %branches[chosen].name, "branch chosen");

        // Chosen branch steps run sequentially in declaration order
        for branch_step in &branches[chosen].steps {
            self.execute_step_boxed(branch_step, definition, shared, instance_deadline, cancel)
                .await?;
        }

        Ok(serde_json::json!({ "branch": branches[chosen].name }))
    }

    async fn run_event_wait(
        &self,
        step: &Step,
        topic: &str,
        instance_deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value> {
        let mut receiver = self.bus.subscribe();
        let per_wait = step
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(self.config.default_step_timeout);
        let max_waits = step.retry.as_ref().map(|r| r.max_attempts).unwrap_or(1);

        for _ in 0..max_waits {
            let mut wait_deadline = Instant::now() + per_wait;
            if let Some(limit) = instance_deadline {
                wait_deadline = wait_deadline.min(limit);
            }

            loop {
                let remaining = wait_deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }

                tokio::select! {
                    _ = cancel.cancelled() => return Err(ConductorError::Cancelled),
                    received = tokio::time::timeout(remaining, receiver.recv()) => {
                        match received {
                            Err(_) => break,
                            Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped))) => {
                                warn!(step = %step.id, skipped, "event receiver lagged");
                                continue;
                            }
                            Ok(Err(tokio::sync::broadcast::error::RecvError::Closed)) => {
                                return Err(ConductorError::Internal(
                                    "event bus closed".to_string(),
                                ));
                            }
                            Ok(Ok(event)) => {
                                if event.topic != topic {
                                    continue;
                                }
                                // Idempotent consumption: a redelivered
                                // event id is a no-op
                                if self
                                    .consumed_events
                                    .insert(event.event_id, ())
                                    .is_some()
                                {
                                    debug!(step = %step.id, event_id = %event.event_id, "duplicate event ignored");
                                    continue;
                                }
                                return Ok(event.payload);
                            }
                        }
                    }
                }
            }
        }

        Err(ConductorError::EventTimeout {
            topic: topic.to_string(),
        })
    }

    async fn persist(&self, instance: &WorkflowInstance) {
        if let Err(e) = self.storage.update_instance(instance.clone()).await {
            error!(instance = %instance.id, error = %e, "failed to persist instance");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::aggregator::ResultAggregator;
    use crate::engine::storage::InMemoryWorkflowStorage;
    use crate::models::{
        AgentEndpoint, AgentRequest, AgentResponse, CompensationRef, ErrorKind, RetryPolicy,
        Rule, StepId,
    };
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex as StdMutex;

    /// Transport with per-operation scripted outcomes; unscripted
    /// operations succeed with `{"operation": <name>}`
    struct MockAgents {
        scripts: StdMutex<HashMap<String, VecDeque<Result<AgentResponse>>>>,
        operations: StdMutex<Vec<String>>,
    }

    impl MockAgents {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                scripts: StdMutex::new(HashMap::new()),
                operations: StdMutex::new(vec![]),
            })
        }

        fn script(&self, operation: &str, responses: Vec<Result<AgentResponse>>) {
            self.scripts
                .lock()
                .unwrap()
                .insert(operation.to_string(), responses.into_iter().collect());
        }

        fn operations(&self) -> Vec<String> {
            self.operations.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AgentTransport for MockAgents {
        async fn call(
            &self,
            _endpoint: &AgentEndpoint,
            request: &AgentRequest,
        ) -> Result<AgentResponse> {
            self.operations
                .lock()
                .unwrap()
                .push(request.operation.clone());
            let scripted = self
                .scripts
                .lock()
                .unwrap()
                .get_mut(&request.operation)
                .and_then(|queue| queue.pop_front());
            scripted.unwrap_or_else(|| {
                Ok(AgentResponse::ok(json!({ "operation": request.operation })))
            })
        }
    }

    fn agent(name: &str) -> AgentRef {
        AgentRef::new(name, "v1")
    }

    fn transient() -> Result<AgentResponse> {
        Err(ConductorError::AgentTimeout {
            agent: "mock".to_string(),
        })
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 5,
            jitter_fraction: 0.0,
        }
    }

    fn create_test_engine_with(
        transport: Arc<MockAgents>,
        storage: Arc<dyn WorkflowStorage>,
    ) -> Arc<WorkflowEngine> {
        let registry = Arc::new(AgentRegistry::new());
        for name in [
            "inventory",
            "pricing",
            "recommendation",
            "order",
            "support",
            "marketing",
        ] {
            registry.register(AgentEndpoint::new(agent(name), format!("mock://{}", name)));
        }

        let mut config = EngineConfig::default();
        config.default_retry = fast_retry(3);
        config.default_step_timeout = Duration::from_secs(5);

        WorkflowEngine::new(
            registry,
            transport,
            storage,
            ResultAggregator::with_common_rules(),
            config,
        )
    }

    fn create_test_engine(transport: Arc<MockAgents>) -> Arc<WorkflowEngine> {
        create_test_engine_with(transport, Arc::new(InMemoryWorkflowStorage::default()))
    }

    async fn wait_terminal(engine: &Arc<WorkflowEngine>, id: &Uuid) -> WorkflowInstance {
        for _ in 0..500 {
            let instance = engine.get_status(id).await.unwrap();
            if instance.status.is_terminal() {
                return instance;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("instance never reached a terminal state");
    }

    #[tokio::test]
    async fn test_submit_rejects_cyclic_definition() {
        let engine = create_test_engine(MockAgents::new());

        let mut definition = WorkflowDefinition::new(
            "cyclic",
            "Cyclic",
            vec![
                Step::agent_call("a", agent("inventory"), "reserve")
                    .with_depends_on(vec![StepId::from("b")]),
                Step::agent_call("b", agent("pricing"), "quote")
                    .with_depends_on(vec![StepId::from("a")]),
            ],
        );
        definition.version = 1;

        let error = engine.submit(definition, json!({})).await.unwrap_err();
        assert!(matches!(error, ConductorError::InvalidDefinition { .. }));
    }

    #[tokio::test]
    async fn test_submit_rejects_unregistered_agent() {
        let engine = create_test_engine(MockAgents::new());

        let definition = WorkflowDefinition::new(
            "ghostly",
            "Ghostly",
            vec![Step::agent_call("a", agent("ghost"), "boo")],
        );

        let error = engine.submit(definition, json!({})).await.unwrap_err();
        assert!(matches!(error, ConductorError::InvalidDefinition { .. }));
        assert!(error.to_string().contains("ghost"));
    }

    #[tokio::test]
    async fn test_submit_rejects_unknown_merge_rule() {
        let engine = create_test_engine(MockAgents::new());

        let definition = WorkflowDefinition::new(
            "custom",
            "Custom Merge",
            vec![Step::parallel_group(
                "group",
                vec![
                    Step::agent_call("a", agent("pricing"), "quote"),
                    Step::agent_call("b", agent("recommendation"), "related"),
                ],
                MergeRule::Custom {
                    name: "unregistered".to_string(),
                },
            )],
        );

        let error = engine.submit(definition, json!({})).await.unwrap_err();
        assert!(matches!(error, ConductorError::InvalidDefinition { .. }));
    }

    #[tokio::test]
    async fn test_linear_workflow_completes() {
        let transport = MockAgents::new();
        let engine = create_test_engine(transport.clone());

        let definition = WorkflowDefinition::new(
            "linear",
            "Linear",
            vec![
                Step::agent_call("reserve", agent("inventory"), "reserve"),
                Step::agent_call("place", agent("order"), "place")
                    .with_depends_on(vec![StepId::from("reserve")]),
            ],
        );

        let id = engine.submit(definition, json!({"order_id": "o-1"})).await.unwrap();
        let instance = wait_terminal(&engine, &id).await;

        assert_eq!(instance.status, InstanceStatus::Completed);
        assert_eq!(
            instance.completed_order,
            vec![StepId::from("reserve"), StepId::from("place")]
        );
        assert_eq!(instance.context["reserve"]["operation"], json!("reserve"));
        assert_eq!(transport.operations(), vec!["reserve", "place"]);
    }

    /// The canonical scenario: S1, then S2 parallel with S3, then a
    /// concat merge. S2 times out twice and succeeds on attempt 3; the
    /// merged result still lists S2 before S3.
    #[tokio::test]
    async fn test_parallel_group_retry_and_declaration_order() {
        let transport = MockAgents::new();
        transport.script(
            "quote_price",
            vec![
                transient(),
                transient(),
                Ok(AgentResponse::ok(json!({"price": 100}))),
            ],
        );
        let engine = create_test_engine(transport.clone());

        let definition = WorkflowDefinition::new(
            "checkout",
            "Checkout",
            vec![
                Step::agent_call("reserve", agent("inventory"), "reserve"),
                Step::parallel_group(
                    "quotes",
                    vec![
                        Step::agent_call("price", agent("pricing"), "quote_price")
                            .with_retry(fast_retry(3)),
                        Step::agent_call("related", agent("recommendation"), "quote_related"),
                    ],
                    MergeRule::Concat,
                )
                .with_depends_on(vec![StepId::from("reserve")]),
                Step::agent_call("place", agent("order"), "place")
                    .with_depends_on(vec![StepId::from("quotes")]),
            ],
        );

        let id = engine.submit(definition, json!({})).await.unwrap();
        let instance = wait_terminal(&engine, &id).await;

        assert_eq!(instance.status, InstanceStatus::Completed);
        assert_eq!(
            instance.step_state(&StepId::from("price")).unwrap().attempts,
            3
        );
        // Declaration order regardless of which child finished first
        assert_eq!(
            instance.context["quotes"],
            json!([{"price": 100}, {"operation": "quote_related"}])
        );
    }

    #[tokio::test]
    async fn test_validation_failure_compensates_in_reverse() {
        let transport = MockAgents::new();
        transport.script(
            "lock_price",
            vec![Ok(AgentResponse::error(
                ErrorKind::Validation,
                "unknown SKU",
            ))],
        );
        let engine = create_test_engine(transport.clone());

        let definition = WorkflowDefinition::new(
            "checkout",
            "Checkout",
            vec![
                Step::agent_call("reserve", agent("inventory"), "reserve").with_compensation(
                    CompensationRef {
                        agent: agent("inventory"),
                        operation: "release_stock".to_string(),
                        retry: None,
                    },
                ),
                Step::agent_call("lock", agent("pricing"), "lock_price")
                    .with_depends_on(vec![StepId::from("reserve")]),
            ],
        );

        let id = engine.submit(definition, json!({})).await.unwrap();
        let instance = wait_terminal(&engine, &id).await;

        assert_eq!(instance.status, InstanceStatus::Compensated);

        let lock_state = instance.step_state(&StepId::from("lock")).unwrap();
        assert_eq!(lock_state.status, StepStatus::Failed);
        // Permanent errors are never retried
        assert_eq!(lock_state.attempts, 1);
        assert!(lock_state.last_error.as_deref().unwrap().contains("unknown SKU"));

        assert_eq!(
            instance.step_state(&StepId::from("reserve")).unwrap().status,
            StepStatus::Compensated
        );
        assert_eq!(
            transport.operations(),
            vec!["reserve", "lock_price", "release_stock"]
        );

        let (failing, error) = instance.failing_step().unwrap();
        assert_eq!(failing, &StepId::from("lock"));
        assert!(error.contains("unknown SKU"));
    }

    #[tokio::test]
    async fn test_compensation_failure_escalates_to_partial_failure() {
        let transport = MockAgents::new();
        transport.script(
            "lock_price",
            vec![Ok(AgentResponse::error(ErrorKind::Validation, "bad input"))],
        );
        transport.script(
            "release_stock",
            vec![Ok(AgentResponse::error(
                ErrorKind::Permanent,
                "stock already shipped",
            ))],
        );
        let engine = create_test_engine(transport.clone());

        let definition = WorkflowDefinition::new(
            "checkout",
            "Checkout",
            vec![
                Step::agent_call("reserve", agent("inventory"), "reserve").with_compensation(
                    CompensationRef {
                        agent: agent("inventory"),
                        operation: "release_stock".to_string(),
                        retry: None,
                    },
                ),
                Step::agent_call("lock", agent("pricing"), "lock_price")
                    .with_depends_on(vec![StepId::from("reserve")]),
            ],
        );

        let id = engine.submit(definition, json!({})).await.unwrap();
        let instance = wait_terminal(&engine, &id).await;

        assert_eq!(instance.status, InstanceStatus::PartialFailure);
        assert!(instance
            .last_error
            .as_deref()
            .unwrap()
            .contains("Compensation failed"));
    }

    #[tokio::test]
    async fn test_conditional_branch_selects_and_skips() {
        let transport = MockAgents::new();
        let engine = create_test_engine(transport.clone());

        let definition = WorkflowDefinition::new(
            "routing",
            "Tier Routing",
            vec![Step::conditional_branch(
                "route",
                vec![
                    Branch {
                        name: "premium".to_string(),
                        when: Rule::field_equals("gold", "input.tier", json!("gold")),
                        steps: vec![Step::agent_call("perk", agent("support"), "grant_perk")],
                    },
                    Branch {
                        name: "standard".to_string(),
                        when: Rule::always("fallback"),
                        steps: vec![Step::agent_call("basic", agent("support"), "send_email")],
                    },
                ],
            )],
        );

        let id = engine.submit(definition, json!({"tier": "gold"})).await.unwrap();
        let instance = wait_terminal(&engine, &id).await;

        assert_eq!(instance.status, InstanceStatus::Completed);
        assert_eq!(instance.context["route"], json!({"branch": "premium"}));
        assert_eq!(
            instance.step_state(&StepId::from("perk")).unwrap().status,
            StepStatus::Succeeded
        );
        // Unchosen branch steps are Skipped, not NotStarted
        assert_eq!(
            instance.step_state(&StepId::from("basic")).unwrap().status,
            StepStatus::Skipped
        );
        assert_eq!(transport.operations(), vec!["grant_perk"]);
    }

    #[tokio::test]
    async fn test_best_effort_group_records_failure_and_excludes_it() {
        let transport = MockAgents::new();
        transport.script(
            "flaky",
            vec![Ok(AgentResponse::error(ErrorKind::Validation, "nope"))],
        );
        let engine = create_test_engine(transport.clone());

        let mut group = Step::parallel_group(
            "fanout",
            vec![
                Step::agent_call("solid", agent("marketing"), "track"),
                Step::agent_call("broken", agent("support"), "flaky"),
            ],
            MergeRule::Concat,
        );
        if let StepKind::ParallelGroup { best_effort, .. } = &mut group.kind {
            *best_effort = true;
        }
        let definition = WorkflowDefinition::new("fanout", "Fanout", vec![group]);

        let id = engine.submit(definition, json!({})).await.unwrap();
        let instance = wait_terminal(&engine, &id).await;

        assert_eq!(instance.status, InstanceStatus::Completed);
        // The failed child stays recorded for audit
        assert_eq!(
            instance.step_state(&StepId::from("broken")).unwrap().status,
            StepStatus::Failed
        );
        // ...and is excluded from the merge
        assert_eq!(instance.context["fanout"], json!([{"operation": "track"}]));
    }

    #[tokio::test]
    async fn test_quorum_group_succeeds_with_enough_children() {
        let transport = MockAgents::new();
        transport.script(
            "slow_quote",
            vec![Ok(AgentResponse::error(ErrorKind::Validation, "overloaded"))],
        );
        let engine = create_test_engine(transport.clone());

        let mut group = Step::parallel_group(
            "quotes",
            vec![
                Step::agent_call("q1", agent("pricing"), "quote_a"),
                Step::agent_call("q2", agent("pricing"), "quote_b"),
                Step::agent_call("q3", agent("pricing"), "slow_quote"),
            ],
            MergeRule::FirstSuccess,
        );
        if let StepKind::ParallelGroup { quorum, .. } = &mut group.kind {
            *quorum = Some(2);
        }
        let definition = WorkflowDefinition::new("quorum", "Quorum", vec![group]);

        let id = engine.submit(definition, json!({})).await.unwrap();
        let instance = wait_terminal(&engine, &id).await;

        assert_eq!(instance.status, InstanceStatus::Completed);
        // first_success tie-breaks to the lowest-indexed success
        assert_eq!(instance.context["quotes"], json!({"operation": "quote_a"}));
    }

    #[tokio::test]
    async fn test_event_wait_consumes_once_and_ignores_redelivery() {
        let transport = MockAgents::new();
        let engine = create_test_engine(transport.clone());

        let definition = WorkflowDefinition::new(
            "shipping",
            "Shipping",
            vec![
                Step::event_wait("first_leg", "orders.shipped").with_timeout_seconds(5),
                Step::event_wait("second_leg", "orders.shipped")
                    .with_timeout_seconds(5)
                    .with_depends_on(vec![StepId::from("first_leg")]),
            ],
        );

        let id = engine.submit(definition, json!({})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let event_a = crate::models::Event::new("orders.shipped", json!({"leg": 1}));
        engine.event_bus().publish_event(event_a.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        // Redelivery of the consumed event id must be a no-op
        engine.event_bus().publish_event(event_a).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let snapshot = engine.get_status(&id).await.unwrap();
        assert_eq!(snapshot.status, InstanceStatus::Running);
        assert_ne!(
            snapshot.step_state(&StepId::from("second_leg")).unwrap().status,
            StepStatus::Succeeded
        );

        engine
            .event_bus()
            .publish("orders.shipped", json!({"leg": 2}))
            .await
            .unwrap();

        let instance = wait_terminal(&engine, &id).await;
        assert_eq!(instance.status, InstanceStatus::Completed);
        assert_eq!(instance.context["first_leg"], json!({"leg": 1}));
        assert_eq!(instance.context["second_leg"], json!({"leg": 2}));
    }

    #[tokio::test]
    async fn test_event_wait_times_out() {
        let transport = MockAgents::new();
        let engine = create_test_engine(transport.clone());

        let definition = WorkflowDefinition::new(
            "waiting",
            "Waiting",
            vec![Step::event_wait("never", "ghosts.only").with_timeout_seconds(1)],
        );

        let id = engine.submit(definition, json!({})).await.unwrap();
        let instance = wait_terminal(&engine, &id).await;

        assert_eq!(instance.status, InstanceStatus::Failed);
        let state = instance.step_state(&StepId::from("never")).unwrap();
        assert_eq!(state.status, StepStatus::Failed);
        assert!(state.last_error.as_deref().unwrap().contains("ghosts.only"));
    }

    #[tokio::test]
    async fn test_cancel_reaches_in_flight_wait() {
        let transport = MockAgents::new();
        let engine = create_test_engine(transport.clone());

        let definition = WorkflowDefinition::new(
            "cancellable",
            "Cancellable",
            vec![
                Step::agent_call("reserve", agent("inventory"), "reserve"),
                Step::event_wait("wait", "never.arrives")
                    .with_timeout_seconds(30)
                    .with_depends_on(vec![StepId::from("reserve")]),
            ],
        );

        let id = engine.submit(definition, json!({})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        engine.cancel(&id).await.unwrap();

        let instance = wait_terminal(&engine, &id).await;
        assert_eq!(instance.status, InstanceStatus::Cancelled);
        // Completed steps are not rolled back by cancellation alone
        assert_eq!(
            instance.step_state(&StepId::from("reserve")).unwrap().status,
            StepStatus::Succeeded
        );
        assert!(transport.operations().iter().all(|op| op != "release_stock"));
    }

    #[tokio::test]
    async fn test_recover_resumes_persisted_instance() {
        let transport = MockAgents::new();
        let storage: Arc<dyn WorkflowStorage> = Arc::new(InMemoryWorkflowStorage::default());

        let definition = WorkflowDefinition::new(
            "restartable",
            "Restartable",
            vec![Step::agent_call("reserve", agent("inventory"), "reserve")],
        );
        storage.create_definition(definition.clone()).await.unwrap();
        let instance = WorkflowInstance::new(&definition, json!({}));
        let id = instance.id;
        storage.create_instance(instance).await.unwrap();

        // A fresh engine picks the pending instance up and finishes it
        let engine = create_test_engine_with(transport, storage);
        let resumed = engine.recover().await.unwrap();
        assert_eq!(resumed, vec![id]);

        let instance = wait_terminal(&engine, &id).await;
        assert_eq!(instance.status, InstanceStatus::Completed);
    }

    #[tokio::test]
    async fn test_get_status_unknown_instance() {
        let engine = create_test_engine(MockAgents::new());
        let error = engine.get_status(&Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(error, ConductorError::InstanceNotFound { .. }));
    }
}
