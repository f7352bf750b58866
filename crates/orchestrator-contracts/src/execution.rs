//! `Execution` and its append-only children (§3, §4.8's state machine).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checkpoint::Checkpoint;
use crate::error::OrchestratorErrorRecord;
use crate::human_task::HumanTask;
use crate::resource::ResourceAllocation;

/// Lifecycle states of the top-level orchestration FSM (§4.8).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Initializing,
    Planning,
    ResourceAllocation,
    WaitingForResources,
    Executing,
    Checkpointing,
    HumanValidation,
    Retry,
    Recovery,
    Paused,
    Finalizing,
    Completed,
    Cancelled,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Cancelled | ExecutionStatus::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepExecutionStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepExecution {
    pub step_index: usize,
    pub name: String,
    pub step_type: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub status: StepExecutionStatus,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
}

impl StepExecution {
    pub fn start(step_index: usize, name: impl Into<String>, step_type: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            step_index,
            name: name.into(),
            step_type: step_type.into(),
            started_at: now,
            ended_at: None,
            duration_ms: None,
            status: StepExecutionStatus::Running,
            result: None,
            error_message: None,
        }
    }

    pub fn finish_ok(&mut self, result: serde_json::Value, now: DateTime<Utc>) {
        self.status = StepExecutionStatus::Completed;
        self.ended_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds().max(0) as u64);
        self.result = Some(result);
    }

    pub fn finish_err(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        self.status = StepExecutionStatus::Failed;
        self.ended_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds().max(0) as u64);
        self.error_message = Some(message.into());
    }
}

/// Mutable state threaded through condition expressions, step dispatch, and
/// checkpointing. `variables` is free-form input/derived state; `outputs`
/// is keyed by step name and fed to downstream `conditional`/`transform`
/// expressions.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecutionContext {
    pub variables: HashMap<String, serde_json::Value>,
    pub outputs: HashMap<String, serde_json::Value>,
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Execution {
    pub id: String,
    pub workflow_id: String,
    pub workflow_version: String,
    pub status: ExecutionStatus,
    pub inputs: HashMap<String, serde_json::Value>,
    pub context: ExecutionContext,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub step_executions: Vec<StepExecution>,
    pub checkpoints: Vec<Checkpoint>,
    pub human_tasks: Vec<HumanTask>,
    pub resource_allocations: Vec<ResourceAllocation>,
    pub current_step: usize,
    pub retry_count: u32,
    pub results: Option<serde_json::Value>,
    pub error: Option<OrchestratorErrorRecord>,
}

impl Execution {
    pub fn new(
        id: impl Into<String>,
        workflow_id: impl Into<String>,
        workflow_version: impl Into<String>,
        inputs: HashMap<String, serde_json::Value>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            workflow_id: workflow_id.into(),
            workflow_version: workflow_version.into(),
            status: ExecutionStatus::Initializing,
            inputs,
            context: ExecutionContext::default(),
            started_at,
            ended_at: None,
            duration_ms: None,
            step_executions: Vec::new(),
            checkpoints: Vec::new(),
            human_tasks: Vec::new(),
            resource_allocations: Vec::new(),
            current_step: 0,
            retry_count: 0,
            results: None,
            error: None,
        }
    }

    pub fn latest_checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoints.last()
    }

    /// §3 invariant: once terminal, no further StepExecutions or Checkpoints.
    pub fn can_append(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn finish(&mut self, status: ExecutionStatus, now: DateTime<Utc>) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.ended_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds().max(0) as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_block_append() {
        let mut exec = Execution::new("e1", "w1", "1.0.0", HashMap::new(), Utc::now());
        assert!(exec.can_append());
        exec.finish(ExecutionStatus::Completed, Utc::now());
        assert!(!exec.can_append());
    }

    #[test]
    fn step_execution_records_duration() {
        let start = Utc::now();
        let mut step = StepExecution::start(0, "ingest", "data_pipeline", start);
        let end = start + chrono::Duration::milliseconds(50);
        step.finish_ok(serde_json::json!({"rows": 10}), end);
        assert_eq!(step.status, StepExecutionStatus::Completed);
        assert_eq!(step.duration_ms, Some(50));
    }
}
