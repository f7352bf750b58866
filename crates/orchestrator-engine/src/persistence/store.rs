//! `PersistenceStore` trait — durable, transactionally consistent storage
//! of WorkflowDefinitions, Executions, Checkpoints, and state snapshots
//! (§4.1). Mirrors the shape of `durable::persistence::WorkflowEventStore`:
//! one async trait, implemented once for tests (in-memory) and once for
//! the real backing store (sqlite).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orchestrator_contracts::{Checkpoint, Execution, ExecutionStatus, WorkflowDefinition};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("workflow definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("checkpoint not found for execution {0}")]
    CheckpointNotFound(String),

    #[error("checkpoint corrupted: checksum mismatch for {0}")]
    CorruptedRecord(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("store not initialized")]
    Uninitialized,

    #[error("backup failed: {0}")]
    Backup(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Filters accepted by `queryExecutions` (§4.1). Default order is by start
/// time descending.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub workflow_id: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub started_after: Option<DateTime<Utc>>,
    pub started_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct CleanupOptions {
    pub retention_days: u32,
    pub prune_definitions: bool,
    pub prune_executions: bool,
    pub prune_checkpoints: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CleanupCounts {
    pub definitions_deleted: u64,
    pub executions_deleted: u64,
    pub checkpoints_deleted: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PersistenceMetrics {
    pub definitions_count: u64,
    pub executions_count: u64,
    pub checkpoints_count: u64,
    pub store_size_bytes: u64,
    pub cache_hit_ratio: f64,
}

/// A versioned workflow-state snapshot, distinct from a `Checkpoint`: this
/// is the raw FSM state blob saved on every transition (`saveWorkflowState`),
/// while checkpoints are the coarser, retention-pruned recovery points.
#[derive(Debug, Clone)]
pub struct WorkflowStateRecord {
    pub version: u32,
    pub state: serde_json::Value,
    pub saved_at: DateTime<Utc>,
}

#[async_trait]
pub trait PersistenceStore: Send + Sync + 'static {
    async fn save_workflow_state(
        &self,
        workflow_id: &str,
        execution_id: &str,
        state: serde_json::Value,
    ) -> Result<u32, StoreError>;

    async fn load_workflow_state(
        &self,
        workflow_id: &str,
        execution_id: &str,
        version: Option<u32>,
    ) -> Result<Option<WorkflowStateRecord>, StoreError>;

    /// Prunes checkpoints for (workflow_id, execution_id) beyond the newest
    /// `max_versions` when `Some`.
    async fn save_checkpoint(
        &self,
        workflow_id: &str,
        execution_id: &str,
        checkpoint: Checkpoint,
        max_versions: Option<usize>,
    ) -> Result<String, StoreError>;

    /// `checkpoint_id = None` loads the newest checkpoint for the execution.
    async fn load_checkpoint(
        &self,
        workflow_id: &str,
        execution_id: &str,
        checkpoint_id: Option<&str>,
    ) -> Result<Option<Checkpoint>, StoreError>;

    async fn save_execution(&self, execution: &Execution) -> Result<(), StoreError>;

    async fn load_execution(&self, id: &str) -> Result<Option<Execution>, StoreError>;

    async fn query_executions(&self, filter: ExecutionFilter) -> Result<Vec<Execution>, StoreError>;

    async fn save_workflow_definition(&self, def: &WorkflowDefinition) -> Result<(), StoreError>;

    async fn load_workflow_definition(
        &self,
        id: &str,
        version: Option<&str>,
    ) -> Result<Option<WorkflowDefinition>, StoreError>;

    async fn create_backup(&self) -> Result<String, StoreError>;

    async fn restore_from_backup(&self, path: &str) -> Result<(), StoreError>;

    async fn cleanup(&self, options: CleanupOptions) -> Result<CleanupCounts, StoreError>;

    async fn metrics(&self) -> Result<PersistenceMetrics, StoreError>;
}
