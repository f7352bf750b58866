//! Orchestration Engine (C8): the top-level FSM that drives a
//! `WorkflowDefinition` to completion, coordinating the persistence store
//! (C1), resource pool (C2), event bus (C3), and the three nested engines
//! (C5-C7).
//!
//! The generic interpreter (C4) tracks the execution's state for
//! observability and tests; the actual step dispatch loop is a regular
//! async function, since awaiting nested engine calls, resource waits, and
//! human gates doesn't fit the interpreter's synchronous `send`/`step`
//! contract (see the design note on message passing in fsm::mod).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use orchestrator_contracts::{
    Checkpoint, DataPipelineConfig, DeploymentConfig, Execution, ExecutionContext,
    ExecutionStatus, HumanTask, HumanTaskResponse, ModelOperator, OrchestratorErrorRecord,
    ResourceRequirement, Step, StepExecution, StepKind, TrainingConfig, WorkflowDefinition,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{oneshot, Notify};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::condition;
use crate::deployment::DeploymentEngine;
use crate::error::OrchestratorError;
use crate::eventbus::EventBus;
use crate::fsm::{Interpreter, StateMachineBuilder, StateMachineDefinition};
use crate::persistence::PersistenceStore;
use crate::pipeline::PipelineEngine;
use crate::resources::ResourcePool;
use crate::training::TrainingCoordinator;

#[derive(Default)]
struct ExecState {
    current_state: String,
}

fn definition() -> Arc<StateMachineDefinition<ExecState>> {
    Arc::new(
        StateMachineBuilder::new()
            .initial("initializing")
            .final_state("completed")
            .final_state("cancelled")
            .final_state("failed")
            .state("planning")
            .state("resource_allocation")
            .state("waiting_for_resources")
            .state("executing")
            .state("checkpointing")
            .state("human_validation")
            .state("retry")
            .state("recovery")
            .state("paused")
            .state("finalizing")
            .transition("initializing", "PLAN", "planning")
            .transition("planning", "ALLOCATE", "resource_allocation")
            .transition("resource_allocation", "WAIT", "waiting_for_resources")
            .transition("waiting_for_resources", "ALLOCATED", "resource_allocation")
            .transition("waiting_for_resources", "TIMEOUT", "failed")
            .transition("resource_allocation", "EXECUTE", "executing")
            .transition("executing", "CHECKPOINT_DUE", "checkpointing")
            .transition("checkpointing", "RESUME_EXECUTION", "executing")
            .transition("executing", "REQUIRE_HUMAN", "human_validation")
            .transition("human_validation", "HUMAN_APPROVED", "executing")
            .transition("human_validation", "HUMAN_REJECTED", "recovery")
            .transition("human_validation", "HUMAN_TIMEOUT", "recovery")
            .transition("executing", "RETRYABLE_FAILURE", "retry")
            .transition("retry", "RESUME_EXECUTION", "executing")
            .transition("executing", "NEEDS_RECOVERY", "recovery")
            .transition("recovery", "RESUME_EXECUTION", "executing")
            .transition("recovery", "RECOVERY_FAILED", "failed")
            .transition("recovery", "MANUAL_INTERVENTION", "paused")
            .transition("paused", "RESUME", "executing")
            .transition("paused", "CANCEL", "cancelled")
            .transition("executing", "FINALIZE", "finalizing")
            .transition("finalizing", "DONE", "completed")
            .build(),
    )
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("step execution failed: {0}")]
    Failed(String),
    #[error("execution cancelled")]
    Cancelled,
}

struct ExecutionHandle {
    cancelled: Arc<AtomicBool>,
    paused: Arc<Notify>,
    is_paused: Arc<AtomicBool>,
    resume_signal: Arc<Notify>,
}

struct PendingHumanTask {
    responder: Mutex<Option<oneshot::Sender<HumanTaskResponse>>>,
}

pub struct OrchestrationEngine {
    store: Arc<dyn PersistenceStore>,
    resources: Arc<ResourcePool>,
    events: EventBus,
    pipelines: Arc<PipelineEngine>,
    training: Arc<TrainingCoordinator>,
    deployments: Arc<DeploymentEngine>,
    models: DashMap<String, Arc<dyn ModelOperator>>,
    definitions: DashMap<(String, String), WorkflowDefinition>,
    executions: DashMap<String, Execution>,
    active_executions: DashMap<String, Execution>,
    handles: DashMap<String, ExecutionHandle>,
    pending_human_tasks: DashMap<String, PendingHumanTask>,
    resource_wait_timeout: Duration,
    checkpoint_interval: chrono::Duration,
    fsm_def: Arc<StateMachineDefinition<ExecState>>,
}

impl OrchestrationEngine {
    pub fn new(
        store: Arc<dyn PersistenceStore>,
        resources: Arc<ResourcePool>,
        events: EventBus,
        pipelines: Arc<PipelineEngine>,
        training: Arc<TrainingCoordinator>,
        deployments: Arc<DeploymentEngine>,
    ) -> Self {
        Self {
            store,
            resources,
            events,
            pipelines,
            training,
            deployments,
            models: DashMap::new(),
            definitions: DashMap::new(),
            executions: DashMap::new(),
            active_executions: DashMap::new(),
            handles: DashMap::new(),
            pending_human_tasks: DashMap::new(),
            resource_wait_timeout: Duration::from_secs(60),
            checkpoint_interval: chrono::Duration::seconds(30),
            fsm_def: definition(),
        }
    }

    /// Overrides the default 60s cap on how long a step waits for resources
    /// to free up before its allocation is considered starved (§4.2).
    pub fn with_resource_wait_timeout(mut self, timeout: Duration) -> Self {
        self.resource_wait_timeout = timeout;
        self
    }

    pub fn register_model(&self, model_id: impl Into<String>, model: Arc<dyn ModelOperator>) {
        self.models.insert(model_id.into(), model);
    }

    pub async fn register_workflow(&self, def: WorkflowDefinition) -> Result<(), OrchestratorError> {
        if !def.has_unique_step_names() {
            return Err(OrchestratorError::ConfigInvalid(format!(
                "workflow '{}' has duplicate step names",
                def.id
            )));
        }
        self.store.save_workflow_definition(&def).await?;
        self.definitions.insert((def.id.clone(), def.version.clone()), def);
        Ok(())
    }

    /// Lifecycle start hook: no-op today, present so callers don't need to
    /// special-case construction vs. readiness the way `durable::worker`
    /// callers do before accepting work.
    pub async fn initialize(&self) -> Result<(), OrchestratorError> {
        Ok(())
    }

    /// Lifecycle stop hook: drains the event bus's debounce timers so no
    /// publish outlives the engine.
    pub async fn dispose(&self) -> Result<(), OrchestratorError> {
        self.events.shutdown();
        Ok(())
    }

    pub fn get_workflow(&self, workflow_id: &str, version: &str) -> Option<WorkflowDefinition> {
        self.definitions
            .get(&(workflow_id.to_string(), version.to_string()))
            .map(|r| r.clone())
    }

    pub async fn get_execution_history(
        &self,
        filter: crate::persistence::ExecutionFilter,
    ) -> Result<Vec<Execution>, OrchestratorError> {
        Ok(self.store.query_executions(filter).await?)
    }

    /// Snapshots of executions that have not yet reached a terminal state.
    pub fn get_active_workflows(&self) -> Vec<Execution> {
        self.active_executions.iter().map(|e| e.value().clone()).collect()
    }

    pub fn get_human_tasks(&self, execution_id: &str) -> Vec<HumanTask> {
        self.active_executions
            .get(execution_id)
            .map(|e| e.human_tasks.clone())
            .or_else(|| self.executions.get(execution_id).map(|e| e.human_tasks.clone()))
            .unwrap_or_default()
    }

    pub fn get_pending_human_tasks(&self) -> Vec<HumanTask> {
        self.active_executions
            .iter()
            .flat_map(|e| e.human_tasks.iter().filter(|t| t.is_pending()).cloned().collect::<Vec<_>>())
            .collect()
    }

    #[instrument(skip(self, inputs), fields(workflow_id, workflow_version))]
    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        workflow_version: &str,
        inputs: HashMap<String, Value>,
    ) -> Result<String, OrchestratorError> {
        let definition = self
            .definitions
            .get(&(workflow_id.to_string(), workflow_version.to_string()))
            .map(|r| r.clone())
            .ok_or_else(|| OrchestratorError::ConfigInvalid(format!("no workflow {workflow_id}@{workflow_version}")))?;

        let execution_id = Uuid::now_v7().to_string();
        let mut execution = Execution::new(execution_id.clone(), workflow_id, workflow_version, inputs, Utc::now());
        execution.context.variables = execution.inputs.clone();

        self.handles.insert(
            execution_id.clone(),
            ExecutionHandle {
                cancelled: Arc::new(AtomicBool::new(false)),
                paused: Arc::new(Notify::new()),
                is_paused: Arc::new(AtomicBool::new(false)),
                resume_signal: Arc::new(Notify::new()),
            },
        );

        let mut interpreter = Interpreter::new(self.fsm_def.clone(), ExecState::default());
        interpreter.on_transition(Arc::new({
            let events = self.events.clone();
            let execution_id = execution_id.clone();
            move |_from, to, _event, _ctx| {
                events.publish("orchestration:state-change", serde_json::json!({"type": "transition", "execution_id": execution_id, "state": to}));
            }
        }));
        interpreter.start();

        execution.status = ExecutionStatus::Planning;
        interpreter.send("PLAN");
        self.active_executions.insert(execution_id.clone(), execution.clone());

        let result = self.run_steps(&mut execution, &definition, &mut interpreter).await;

        match result {
            Ok(()) => {
                interpreter.send("FINALIZE");
                interpreter.send("DONE");
                execution.finish(ExecutionStatus::Completed, Utc::now());
                self.events.publish("orchestration:completed", serde_json::json!({"type": "completed", "execution_id": execution_id}));
            }
            Err(DispatchError::Cancelled) => {
                execution.finish(ExecutionStatus::Cancelled, Utc::now());
                self.events.publish("orchestration:cancelled", serde_json::json!({"type": "cancelled", "execution_id": execution_id}));
            }
            Err(DispatchError::Failed(message)) => {
                execution.error = Some(OrchestratorErrorRecord::new(
                    orchestrator_contracts::ErrorKind::StepFailed,
                    message,
                ));
                execution.finish(ExecutionStatus::Failed, Utc::now());
                self.events.publish("orchestration:failed", serde_json::json!({"type": "failed", "execution_id": execution_id}));
            }
        }

        self.store.save_execution(&execution).await.map_err(OrchestratorError::StoreUnavailable)?;
        self.executions.insert(execution_id.clone(), execution);
        self.handles.remove(&execution_id);
        self.active_executions.remove(&execution_id);

        Ok(execution_id)
    }

    async fn run_steps(
        &self,
        execution: &mut Execution,
        definition: &WorkflowDefinition,
        interpreter: &mut Interpreter<ExecState>,
    ) -> Result<(), DispatchError> {
        execution.status = ExecutionStatus::ResourceAllocation;
        interpreter.send("ALLOCATE");
        interpreter.send("EXECUTE");
        execution.status = ExecutionStatus::Executing;

        let mut last_checkpoint_time = execution.started_at;
        // One recovery attempt per execution: a checkpoint restores us to a
        // known-good point, but if the same step fails again after that
        // restore there is nowhere further back to retreat to, so the
        // execution fails rather than looping on the same gate or error.
        let mut recoveries_remaining: u32 = 1;

        while execution.current_step < definition.step_count() {
            self.check_cancelled(execution)?;
            self.wait_if_paused(execution).await;

            let step = definition.step(execution.current_step).cloned().expect("bounds checked by loop condition");

            // A checkpoint must exist before a human-gated step so recovery
            // after a rejection/timeout has somewhere to roll back to, in
            // addition to the regular time-interval policy for the rest. A
            // `human_task` step carries its gate on `kind` rather than
            // `requires_human_validation`, so both are checked.
            let gate = human_gate_config(&step);
            let gate_ahead = gate.is_some();
            if gate_ahead || Utc::now() - last_checkpoint_time > self.checkpoint_interval {
                interpreter.send("CHECKPOINT_DUE");
                self.write_checkpoint(execution).await;
                last_checkpoint_time = Utc::now();
                interpreter.send("RESUME_EXECUTION");
            }

            if let Some(requirement) = step.resource_request {
                self.allocate_with_wait(execution, &step.name, requirement).await?;
            }

            let retry_policy = definition.default_retry_policy.clone().unwrap_or_default();
            let result = self.dispatch_with_retry(execution, definition, &step, interpreter, &retry_policy).await;

            if step.resource_request.is_some() {
                self.resources.release(&execution_allocation_id(&execution.id, &step.name));
            }

            match result {
                Ok(value) => {
                    execution.context.outputs.insert(step.name.clone(), value);
                }
                Err(DispatchError::Cancelled) => return Err(DispatchError::Cancelled),
                Err(failed @ DispatchError::Failed(_)) => {
                    if recoveries_remaining == 0 {
                        return Err(failed);
                    }
                    recoveries_remaining -= 1;
                    self.attempt_recovery(execution, interpreter).await?;
                    self.refresh_active_snapshot(execution);
                    continue;
                }
            }

            if let Some(gate) = &gate {
                if let Err(failed) = self.run_human_gate(execution, interpreter, &step, gate).await {
                    if recoveries_remaining == 0 {
                        return Err(failed);
                    }
                    recoveries_remaining -= 1;
                    self.attempt_recovery(execution, interpreter).await?;
                    self.refresh_active_snapshot(execution);
                    continue;
                }
            }

            execution.current_step += 1;
            self.refresh_active_snapshot(execution);
        }

        Ok(())
    }

    fn refresh_active_snapshot(&self, execution: &Execution) {
        self.active_executions.insert(execution.id.clone(), execution.clone());
    }

    /// Recovery (§4.8 `recovery` state): restore context and `current_step`
    /// from the latest verified checkpoint and resend `RESUME_EXECUTION`; if
    /// none exists or it fails its checksum, send `RECOVERY_FAILED` and fail
    /// the execution rather than guess at a safe resumption point.
    async fn attempt_recovery(
        &self,
        execution: &mut Execution,
        interpreter: &mut Interpreter<ExecState>,
    ) -> Result<(), DispatchError> {
        interpreter.send("NEEDS_RECOVERY");

        let loaded = match self.store.load_checkpoint(&execution.workflow_id, &execution.id, None).await {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!(execution_id = %execution.id, error = %e, "checkpoint lookup failed during recovery");
                interpreter.send("RECOVERY_FAILED");
                return Err(DispatchError::Failed(e.to_string()));
            }
        };

        let Some(checkpoint) = loaded else {
            interpreter.send("RECOVERY_FAILED");
            return Err(DispatchError::Failed(format!(
                "no checkpoint available to recover execution '{}'",
                execution.id
            )));
        };

        if !checkpoint.verify() {
            warn!(execution_id = %execution.id, checkpoint_id = %checkpoint.id, "checkpoint failed integrity check");
            interpreter.send("RECOVERY_FAILED");
            return Err(DispatchError::Failed(format!(
                "checkpoint '{}' corrupted",
                checkpoint.id
            )));
        }

        let context: ExecutionContext = match serde_json::from_slice(&checkpoint.state) {
            Ok(context) => context,
            Err(e) => {
                interpreter.send("RECOVERY_FAILED");
                return Err(DispatchError::Failed(format!("checkpoint state undecodable: {e}")));
            }
        };

        info!(execution_id = %execution.id, resumed_at_step = checkpoint.step_index, "recovered execution from checkpoint");
        execution.context = context;
        execution.current_step = checkpoint.step_index;
        interpreter.send("RESUME_EXECUTION");
        Ok(())
    }

    fn check_cancelled(&self, execution: &Execution) -> Result<(), DispatchError> {
        if self
            .handles
            .get(&execution.id)
            .map(|h| h.cancelled.load(Ordering::SeqCst))
            .unwrap_or(false)
        {
            return Err(DispatchError::Cancelled);
        }
        Ok(())
    }

    async fn wait_if_paused(&self, execution: &Execution) {
        let Some(handle) = self.handles.get(&execution.id) else { return };
        if handle.is_paused.load(Ordering::SeqCst) {
            let resume_signal = handle.resume_signal.clone();
            drop(handle);
            resume_signal.notified().await;
        }
    }

    async fn allocate_with_wait(&self, execution: &mut Execution, step_name: &str, requirement: ResourceRequirement) -> Result<(), DispatchError> {
        let allocation_id = execution_allocation_id(&execution.id, step_name);
        let deadline = tokio::time::Instant::now() + self.resource_wait_timeout;

        loop {
            let allocation = self.resources.allocate(allocation_id.clone(), requirement);
            if allocation.success {
                execution.resource_allocations.push(allocation);
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(DispatchError::Failed(format!("resource allocation for step '{step_name}' timed out")));
            }
            self.check_cancelled(execution)?;
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn dispatch_with_retry(
        &self,
        execution: &mut Execution,
        definition: &WorkflowDefinition,
        step: &Step,
        interpreter: &mut Interpreter<ExecState>,
        retry_policy: &orchestrator_contracts::RetryPolicy,
    ) -> Result<Value, DispatchError> {
        let mut attempt = 1;
        loop {
            let started = StepExecution::start(execution.current_step, step.name.clone(), format!("{:?}", step.kind.tag()), Utc::now());
            execution.step_executions.push(started);

            let outcome = self.dispatch_step(execution, definition, step, interpreter).await;

            let step_exec = execution.step_executions.last_mut().expect("just pushed");
            match &outcome {
                Ok(value) => {
                    step_exec.finish_ok(value.clone(), Utc::now());
                    return Ok(value.clone());
                }
                Err(message) => {
                    step_exec.finish_err(message.clone(), Utc::now());
                }
            }

            let Err(message) = outcome else { unreachable!() };

            if retry_policy.has_attempts_remaining(attempt) && retry_policy.should_retry(None) {
                interpreter.send("RETRYABLE_FAILURE");
                execution.retry_count += 1;
                let delay = retry_policy.delay_for_attempt(attempt + 1);
                tokio::time::sleep(delay).await;
                interpreter.send("RESUME_EXECUTION");
                attempt += 1;
                continue;
            }

            warn!(execution_id = %execution.id, step = %step.name, "step failed, no retries remaining");
            return Err(DispatchError::Failed(message));
        }
    }

    async fn dispatch_step(
        &self,
        execution: &mut Execution,
        definition: &WorkflowDefinition,
        step: &Step,
        interpreter: &mut Interpreter<ExecState>,
    ) -> Result<Value, String> {
        match &step.kind {
            StepKind::DataPipeline { config } => self.dispatch_data_pipeline(config).await,
            StepKind::Training { config } => self.dispatch_training(config).await,
            StepKind::ModelDeployment { config } => self.dispatch_deployment(config).await,
            StepKind::Validation { config } => Ok(config.clone()),
            StepKind::Script { config } => Ok(config.clone()),
            StepKind::Parallel { children } => self.dispatch_parallel(execution, definition, children, interpreter).await,
            StepKind::Conditional { condition: expr, then_branch, else_branch } => {
                self.dispatch_conditional(execution, definition, expr, then_branch, else_branch, interpreter).await
            }
            StepKind::HumanTask { .. } => Ok(Value::Null),
        }
    }

    async fn dispatch_data_pipeline(&self, config: &Value) -> Result<Value, String> {
        let cfg: DataPipelineConfig = serde_json::from_value(config.clone()).map_err(|e| e.to_string())?;
        let pipeline_id = Uuid::now_v7().to_string();
        self.pipelines.create_pipeline(pipeline_id.clone(), cfg).map_err(|e| e.to_string())?;
        let execution_id = self.pipelines.execute_pipeline(&pipeline_id).await.map_err(|e| e.to_string())?;
        let result = self.pipelines.get_execution(&execution_id).ok_or("pipeline execution vanished")?;
        if let Some(err) = result.error.clone() {
            return Err(err);
        }
        serde_json::to_value(result).map_err(|e| e.to_string())
    }

    async fn dispatch_training(&self, config: &Value) -> Result<Value, String> {
        let cfg: TrainingConfig = serde_json::from_value(config.clone()).map_err(|e| e.to_string())?;
        let job_id = cfg.job_id.clone();
        self.training.start_distributed_training(job_id.clone(), cfg).await.map_err(|e| e.to_string())?;
        Ok(serde_json::json!({"job_id": job_id}))
    }

    async fn dispatch_deployment(&self, config: &Value) -> Result<Value, String> {
        let cfg: DeploymentConfig = serde_json::from_value(config.clone()).map_err(|e| e.to_string())?;
        let model = self.models.get(&cfg.model_id).map(|m| m.clone()).ok_or_else(|| format!("no model registered for id '{}'", cfg.model_id))?;
        let deployment_id = self.deployments.deploy_model(model, cfg).await.map_err(|e| e.to_string())?;
        Ok(serde_json::json!({"deployment_id": deployment_id}))
    }

    /// Runs leaf children (data pipeline, training, deployment, validation,
    /// script) concurrently via `join_all`, since none of them touch shared
    /// execution/interpreter state. Nested `parallel`/`conditional`/
    /// `human_task` children recurse through `dispatch_step` and still run
    /// sequentially relative to the rest, since they need `&mut execution`.
    async fn dispatch_parallel(
        &self,
        execution: &mut Execution,
        definition: &WorkflowDefinition,
        children: &[Step],
        interpreter: &mut Interpreter<ExecState>,
    ) -> Result<Value, String> {
        let mut slots: Vec<Option<Value>> = vec![None; children.len()];

        let concurrent_indices: Vec<usize> = children
            .iter()
            .enumerate()
            .filter(|(_, c)| Self::is_concurrency_safe(&c.kind))
            .map(|(i, _)| i)
            .collect();

        if !concurrent_indices.is_empty() {
            let futures = concurrent_indices.iter().map(|&i| self.dispatch_leaf_step(&children[i]));
            let results = futures::future::join_all(futures).await;
            for (i, result) in concurrent_indices.into_iter().zip(results) {
                slots[i] = Some(result?);
            }
        }

        for (i, child) in children.iter().enumerate() {
            if slots[i].is_none() {
                let value = self.dispatch_step(execution, definition, child, interpreter).await?;
                slots[i] = Some(value);
            }
        }

        Ok(Value::Array(slots.into_iter().map(|s| s.expect("every slot filled above")).collect()))
    }

    fn is_concurrency_safe(kind: &StepKind) -> bool {
        matches!(
            kind,
            StepKind::DataPipeline { .. }
                | StepKind::Training { .. }
                | StepKind::ModelDeployment { .. }
                | StepKind::Validation { .. }
                | StepKind::Script { .. }
        )
    }

    async fn dispatch_leaf_step(&self, step: &Step) -> Result<Value, String> {
        match &step.kind {
            StepKind::DataPipeline { config } => self.dispatch_data_pipeline(config).await,
            StepKind::Training { config } => self.dispatch_training(config).await,
            StepKind::ModelDeployment { config } => self.dispatch_deployment(config).await,
            StepKind::Validation { config } => Ok(config.clone()),
            StepKind::Script { config } => Ok(config.clone()),
            other => unreachable!("dispatch_leaf_step only called for concurrency-safe kinds, got {:?}", other.tag()),
        }
    }

    async fn dispatch_conditional(
        &self,
        execution: &mut Execution,
        definition: &WorkflowDefinition,
        expr: &str,
        then_branch: &[Step],
        else_branch: &[Step],
        interpreter: &mut Interpreter<ExecState>,
    ) -> Result<Value, String> {
        let flat = condition::flatten_context(&execution.context.variables, &execution.context.outputs);
        let branch = if condition::evaluate(expr, &flat) { then_branch } else { else_branch };

        let mut last = Value::Null;
        for child in branch {
            last = self.dispatch_step(execution, definition, child, interpreter).await?;
        }
        Ok(last)
    }

    async fn run_human_gate(
        &self,
        execution: &mut Execution,
        interpreter: &mut Interpreter<ExecState>,
        step: &Step,
        gate: &orchestrator_contracts::HumanGateConfig,
    ) -> Result<(), DispatchError> {
        interpreter.send("REQUIRE_HUMAN");

        let task_id = Uuid::now_v7().to_string();
        let task = HumanTask::new(task_id.clone(), execution.id.clone(), execution.current_step, step.name.clone(), gate, Value::Null, Utc::now());
        execution.human_tasks.push(task);

        let (tx, rx) = oneshot::channel();
        self.pending_human_tasks.insert(task_id.clone(), PendingHumanTask { responder: Mutex::new(Some(tx)) });

        let timeout = gate.timeout_ms.map(Duration::from_millis);
        let response = match timeout {
            Some(d) => tokio::time::timeout(d, rx).await.ok().and_then(|r| r.ok()),
            None => rx.await.ok(),
        };

        self.pending_human_tasks.remove(&task_id);

        match response {
            Some(response) if response.approved => {
                if let Some(task) = execution.human_tasks.iter_mut().find(|t| t.id == task_id) {
                    task.complete(response, "unknown", Utc::now());
                }
                interpreter.send("HUMAN_APPROVED");
                Ok(())
            }
            Some(response) => {
                if let Some(task) = execution.human_tasks.iter_mut().find(|t| t.id == task_id) {
                    task.complete(response, "unknown", Utc::now());
                }
                interpreter.send("HUMAN_REJECTED");
                Err(DispatchError::Failed(format!("human task '{task_id}' rejected")))
            }
            None => {
                if let Some(task) = execution.human_tasks.iter_mut().find(|t| t.id == task_id) {
                    task.cancel(Utc::now());
                }
                interpreter.send("HUMAN_TIMEOUT");
                Err(DispatchError::Failed(format!("human task '{task_id}' timed out")))
            }
        }
    }

    pub fn complete_human_task(&self, task_id: &str, response: HumanTaskResponse, _completed_by: &str) -> Result<(), OrchestratorError> {
        let entry = self
            .pending_human_tasks
            .get(task_id)
            .ok_or_else(|| OrchestratorError::HumanTaskNotFound(task_id.to_string()))?;
        let sender = entry.responder.lock().take();
        drop(entry);
        if let Some(sender) = sender {
            let _ = sender.send(response);
        }
        Ok(())
    }

    async fn write_checkpoint(&self, execution: &mut Execution) {
        let state = serde_json::to_vec(&execution.context).unwrap_or_default();
        let checkpoint = Checkpoint::new(Uuid::now_v7().to_string(), execution.id.clone(), execution.current_step, state, Utc::now());
        match self.store.save_checkpoint(&execution.workflow_id, &execution.id, checkpoint.clone(), Some(10)).await {
            Ok(_) => execution.checkpoints.push(checkpoint),
            Err(e) => warn!(execution_id = %execution.id, error = %e, "checkpoint write failed"),
        }
    }

    pub fn pause_workflow(&self, execution_id: &str) -> Result<(), OrchestratorError> {
        let handle = self
            .handles
            .get(execution_id)
            .ok_or_else(|| OrchestratorError::ExecutionNotFound(execution_id.to_string()))?;
        handle.is_paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn resume_workflow(&self, execution_id: &str) -> Result<(), OrchestratorError> {
        let handle = self
            .handles
            .get(execution_id)
            .ok_or_else(|| OrchestratorError::ExecutionNotFound(execution_id.to_string()))?;
        handle.is_paused.store(false, Ordering::SeqCst);
        handle.resume_signal.notify_waiters();
        Ok(())
    }

    pub fn cancel_workflow(&self, execution_id: &str) -> Result<(), OrchestratorError> {
        let handle = self
            .handles
            .get(execution_id)
            .ok_or_else(|| OrchestratorError::ExecutionNotFound(execution_id.to_string()))?;
        handle.cancelled.store(true, Ordering::SeqCst);
        handle.resume_signal.notify_waiters();
        Ok(())
    }

    pub fn get_execution(&self, execution_id: &str) -> Option<Execution> {
        self.executions.get(execution_id).map(|e| e.clone())
    }

    pub fn metrics(&self) -> OrchestrationMetrics {
        OrchestrationMetrics {
            active_executions: self.handles.len(),
            completed_executions: self
                .executions
                .iter()
                .filter(|e| e.status == ExecutionStatus::Completed)
                .count(),
            failed_executions: self.executions.iter().filter(|e| e.status == ExecutionStatus::Failed).count(),
            resource_utilization: self.resources.utilization(),
            dropped_events: self.events.dropped_updates(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestrationMetrics {
    pub active_executions: usize,
    pub completed_executions: usize,
    pub failed_executions: usize,
    pub resource_utilization: crate::resources::Utilization,
    pub dropped_events: u64,
}

fn execution_allocation_id(execution_id: &str, step_name: &str) -> String {
    format!("{execution_id}:{step_name}")
}

/// The gate governing a step, whichever of the two places it's declared in:
/// a standalone `human_task` step carries its gate on `kind`, while any
/// other step type carries one via `requires_human_validation`.
fn human_gate_config(step: &Step) -> Option<orchestrator_contracts::HumanGateConfig> {
    match &step.kind {
        StepKind::HumanTask { gate } => Some(gate.clone()),
        _ => step.requires_human_validation.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use orchestrator_contracts::{DataSourceSpec, DataSourceType, Dataset, DataSourceAdapter, HumanGateConfig, HumanTaskType, ModelServerOperator, OperatorError, RetryPolicy, StepKind};
    use crate::persistence::InMemoryStore;

    struct FakeAdapter;

    #[async_trait]
    impl DataSourceAdapter for FakeAdapter {
        async fn read(&self, spec: &DataSourceSpec) -> Result<Dataset, OperatorError> {
            Ok(Dataset {
                id: "d1".to_string(),
                source_id: spec.id.clone(),
                rows: vec![serde_json::json!({"v": 1})],
                metadata: serde_json::json!({}),
                schema: std::collections::HashMap::new(),
            })
        }
    }

    struct NoopModelServer;

    #[async_trait]
    impl ModelServerOperator for NoopModelServer {
        async fn deploy(&self, _version: &str, _model: Value) -> Result<(), OperatorError> { Ok(()) }
        async fn undeploy(&self, _version: &str) -> Result<(), OperatorError> { Ok(()) }
        async fn route_traffic(&self, _w: &[(String, f64)]) -> Result<(), OperatorError> { Ok(()) }
        async fn ab_test_result(&self, _c: &str, _b: &str) -> Result<orchestrator_contracts::AbTestResult, OperatorError> {
            Ok(orchestrator_contracts::AbTestResult { candidate_wins: true, significance: 0.99, candidate_metric: 1.0, baseline_metric: 0.5 })
        }
    }

    fn engine() -> OrchestrationEngine {
        let pipelines = Arc::new(PipelineEngine::new());
        pipelines.register_adapter("File", Arc::new(FakeAdapter));
        OrchestrationEngine::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(ResourcePool::new(ResourceRequirement::new(8.0, 8192.0, 2.0, 1000.0))),
            EventBus::new(Duration::from_millis(10), 100),
            pipelines,
            Arc::new(TrainingCoordinator::new(8)),
            Arc::new(DeploymentEngine::new(Arc::new(NoopModelServer))),
        )
    }

    fn script_step(name: &str) -> Step {
        Step::new(name, StepKind::Script { config: serde_json::json!({"ok": true}) })
    }

    #[tokio::test]
    async fn linear_workflow_completes() {
        let engine = engine();
        let def = WorkflowDefinition::new("wf1", "demo", "1.0.0", vec![script_step("a"), script_step("b")]);
        engine.register_workflow(def).await.unwrap();

        let execution_id = engine.execute_workflow("wf1", "1.0.0", HashMap::new()).await.unwrap();
        let execution = engine.get_execution(&execution_id).unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.step_executions.len(), 2);
    }

    #[tokio::test]
    async fn conditional_step_picks_branch_from_context() {
        let engine = engine();
        let conditional = Step::new(
            "branch",
            StepKind::Conditional {
                condition: "flag == true".to_string(),
                then_branch: vec![script_step("then-leaf")],
                else_branch: vec![script_step("else-leaf")],
            },
        );
        let def = WorkflowDefinition::new("wf2", "demo", "1.0.0", vec![conditional]);
        engine.register_workflow(def).await.unwrap();

        let mut inputs = HashMap::new();
        inputs.insert("flag".to_string(), Value::Bool(true));
        let execution_id = engine.execute_workflow("wf2", "1.0.0", inputs).await.unwrap();
        let execution = engine.get_execution(&execution_id).unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn human_task_blocks_until_completed() {
        let engine = Arc::new(engine());
        let gate = HumanGateConfig {
            task_type: HumanTaskType::Approval,
            title: "Review".to_string(),
            description: String::new(),
            priority: 1,
            assignee: None,
            timeout_ms: Some(2000),
        };
        let step = script_step("needs-approval").with_human_gate(gate);
        let def = WorkflowDefinition::new("wf3", "demo", "1.0.0", vec![step]);
        engine.register_workflow(def).await.unwrap();

        let engine_clone = engine.clone();
        let handle = tokio::spawn(async move { engine_clone.execute_workflow("wf3", "1.0.0", HashMap::new()).await });

        tokio::time::sleep(Duration::from_millis(30)).await;
        let task_id = engine
            .pending_human_tasks
            .iter()
            .next()
            .map(|e| e.key().clone())
            .expect("a human task should be pending");

        engine
            .complete_human_task(&task_id, HumanTaskResponse { approved: true, comment: None, payload: Value::Null }, "alice")
            .unwrap();

        let execution_id = handle.await.unwrap().unwrap();
        let execution = engine.get_execution(&execution_id).unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn resource_starvation_times_out() {
        let engine = OrchestrationEngine {
            resource_wait_timeout: Duration::from_millis(50),
            ..engine()
        };
        let huge = ResourceRequirement::new(1000.0, 0.0, 0.0, 0.0);
        let step = script_step("needs-resources").with_resource_request(huge);
        let def = WorkflowDefinition::new("wf4", "demo", "1.0.0", vec![step]);
        engine.register_workflow(def).await.unwrap();

        let execution_id = engine.execute_workflow("wf4", "1.0.0", HashMap::new()).await.unwrap();
        let execution = engine.get_execution(&execution_id).unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn cancel_during_execution_stops_the_workflow() {
        let engine = Arc::new(engine());
        let def = WorkflowDefinition::new("wf5", "demo", "1.0.0", vec![script_step("a"), script_step("b"), script_step("c")]);
        engine.register_workflow(def).await.unwrap();

        let engine_clone = engine.clone();
        let handle = tokio::spawn(async move { engine_clone.execute_workflow("wf5", "1.0.0", HashMap::new()).await });

        tokio::time::sleep(Duration::from_millis(5)).await;
        if let Some(execution_id) = engine.handles.iter().next().map(|e| e.key().clone()) {
            engine.cancel_workflow(&execution_id).ok();
        }

        let execution_id = handle.await.unwrap().unwrap();
        let execution = engine.get_execution(&execution_id).unwrap();
        assert!(matches!(execution.status, ExecutionStatus::Cancelled | ExecutionStatus::Completed));
    }

    #[tokio::test]
    async fn register_workflow_rejects_duplicate_step_names() {
        let engine = engine();
        let def = WorkflowDefinition::new("wf6", "demo", "1.0.0", vec![script_step("a"), script_step("a")]);
        assert!(engine.register_workflow(def).await.is_err());
    }

    #[tokio::test]
    async fn parallel_step_runs_children_concurrently() {
        let engine = engine();
        let parallel = Step::new(
            "fan-out",
            StepKind::Parallel {
                children: vec![script_step("p1"), script_step("p2"), script_step("p3")],
            },
        );
        let def = WorkflowDefinition::new("wf7", "demo", "1.0.0", vec![parallel]);
        engine.register_workflow(def).await.unwrap();

        let execution_id = engine.execute_workflow("wf7", "1.0.0", HashMap::new()).await.unwrap();
        let execution = engine.get_execution(&execution_id).unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        let outputs = execution.context.outputs.get("fan-out").unwrap();
        assert_eq!(outputs.as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn rejected_human_task_recovers_from_checkpoint_then_completes() {
        let engine = Arc::new(engine());
        let gate = HumanGateConfig {
            task_type: HumanTaskType::Approval,
            title: "Review".to_string(),
            description: String::new(),
            priority: 1,
            assignee: None,
            timeout_ms: Some(5_000),
        };
        let step = script_step("b").with_human_gate(gate);
        let def = WorkflowDefinition::new("wf8", "demo", "1.0.0", vec![script_step("a"), step, script_step("c")]);
        engine.register_workflow(def).await.unwrap();

        let engine_clone = engine.clone();
        let handle = tokio::spawn(async move { engine_clone.execute_workflow("wf8", "1.0.0", HashMap::new()).await });

        tokio::time::sleep(Duration::from_millis(30)).await;
        let first_task = engine
            .pending_human_tasks
            .iter()
            .next()
            .map(|e| e.key().clone())
            .expect("a human task should be pending for step b");
        engine
            .complete_human_task(&first_task, HumanTaskResponse { approved: false, comment: None, payload: Value::Null }, "alice")
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        let second_task = engine
            .pending_human_tasks
            .iter()
            .next()
            .map(|e| e.key().clone())
            .expect("recovery should re-present the gate on step b");
        engine
            .complete_human_task(&second_task, HumanTaskResponse { approved: true, comment: None, payload: Value::Null }, "alice")
            .unwrap();

        let execution_id = handle.await.unwrap().unwrap();
        let execution = engine.get_execution(&execution_id).unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert!(execution.context.outputs.contains_key("a"));
        assert!(execution.context.outputs.contains_key("b"));
        assert!(execution.context.outputs.contains_key("c"));
    }
}
