//! In-memory `PersistenceStore`, used by unit/integration tests in place of
//! the sqlite backend. Keeps the same single-writer-queue contract (§4.1)
//! via a `tokio::sync::Mutex` guarding all mutating operations; reads go
//! through `dashmap` directly and are never blocked by a writer holding the
//! queue, matching "readers may run without blocking writers".

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use orchestrator_contracts::{Checkpoint, Execution, WorkflowDefinition};
use tokio::sync::Mutex;

use super::store::{
    CleanupCounts, CleanupOptions, ExecutionFilter, PersistenceMetrics, PersistenceStore,
    StoreError, WorkflowStateRecord,
};

#[derive(Default)]
struct Tables {
    definitions: DashMap<(String, String), WorkflowDefinition>,
    executions: DashMap<String, Execution>,
    states: DashMap<(String, String), Vec<WorkflowStateRecord>>,
    checkpoints: DashMap<(String, String), Vec<Checkpoint>>,
}

pub struct InMemoryStore {
    tables: Arc<Tables>,
    write_queue: Mutex<()>,
    state_version: AtomicU32,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(Tables::default()),
            write_queue: Mutex::new(()),
            state_version: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl PersistenceStore for InMemoryStore {
    async fn save_workflow_state(
        &self,
        workflow_id: &str,
        execution_id: &str,
        state: serde_json::Value,
    ) -> Result<u32, StoreError> {
        let _guard = self.write_queue.lock().await;
        let version = self.state_version.fetch_add(1, Ordering::SeqCst) + 1;
        let key = (workflow_id.to_string(), execution_id.to_string());
        self.tables.states.entry(key).or_default().push(WorkflowStateRecord {
            version,
            state,
            saved_at: Utc::now(),
        });
        Ok(version)
    }

    async fn load_workflow_state(
        &self,
        workflow_id: &str,
        execution_id: &str,
        version: Option<u32>,
    ) -> Result<Option<WorkflowStateRecord>, StoreError> {
        let key = (workflow_id.to_string(), execution_id.to_string());
        let Some(records) = self.tables.states.get(&key) else {
            return Ok(None);
        };
        let found = match version {
            Some(v) => records.iter().find(|r| r.version == v).cloned(),
            None => records.last().cloned(),
        };
        Ok(found)
    }

    async fn save_checkpoint(
        &self,
        workflow_id: &str,
        execution_id: &str,
        checkpoint: Checkpoint,
        max_versions: Option<usize>,
    ) -> Result<String, StoreError> {
        let _guard = self.write_queue.lock().await;
        let key = (workflow_id.to_string(), execution_id.to_string());
        let id = checkpoint.id.clone();
        let mut entry = self.tables.checkpoints.entry(key).or_default();
        entry.push(checkpoint);
        entry.sort_by_key(|c| c.timestamp);
        if let Some(max) = max_versions {
            if entry.len() > max {
                let excess = entry.len() - max;
                entry.drain(0..excess);
            }
        }
        Ok(id)
    }

    async fn load_checkpoint(
        &self,
        workflow_id: &str,
        execution_id: &str,
        checkpoint_id: Option<&str>,
    ) -> Result<Option<Checkpoint>, StoreError> {
        let key = (workflow_id.to_string(), execution_id.to_string());
        let Some(list) = self.tables.checkpoints.get(&key) else {
            return Ok(None);
        };
        let found = match checkpoint_id {
            Some(id) => list.iter().find(|c| c.id == id).cloned(),
            None => list.last().cloned(),
        };
        match found {
            Some(cp) if !cp.verify() => Err(StoreError::CorruptedRecord(cp.id)),
            other => Ok(other),
        }
    }

    async fn save_execution(&self, execution: &Execution) -> Result<(), StoreError> {
        let _guard = self.write_queue.lock().await;
        self.tables.executions.insert(execution.id.clone(), execution.clone());
        Ok(())
    }

    async fn load_execution(&self, id: &str) -> Result<Option<Execution>, StoreError> {
        Ok(self.tables.executions.get(id).map(|e| e.clone()))
    }

    async fn query_executions(&self, filter: ExecutionFilter) -> Result<Vec<Execution>, StoreError> {
        let mut results: Vec<Execution> = self
            .tables
            .executions
            .iter()
            .map(|e| e.value().clone())
            .filter(|e| {
                filter.workflow_id.as_deref().map_or(true, |wid| e.workflow_id == wid)
                    && filter.status.map_or(true, |s| std::mem::discriminant(&e.status) == std::mem::discriminant(&s))
                    && filter.started_after.map_or(true, |t| e.started_at >= t)
                    && filter.started_before.map_or(true, |t| e.started_at <= t)
            })
            .collect();

        results.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        if let Some(limit) = filter.limit {
            results.truncate(limit);
        }
        Ok(results)
    }

    async fn save_workflow_definition(&self, def: &WorkflowDefinition) -> Result<(), StoreError> {
        let _guard = self.write_queue.lock().await;
        self.tables
            .definitions
            .insert((def.id.clone(), def.version.clone()), def.clone());
        Ok(())
    }

    async fn load_workflow_definition(
        &self,
        id: &str,
        version: Option<&str>,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        match version {
            Some(v) => Ok(self.tables.definitions.get(&(id.to_string(), v.to_string())).map(|d| d.clone())),
            None => {
                let mut candidates: Vec<WorkflowDefinition> = self
                    .tables
                    .definitions
                    .iter()
                    .filter(|kv| kv.key().0 == id)
                    .map(|kv| kv.value().clone())
                    .collect();
                candidates.sort_by(|a, b| a.version.cmp(&b.version));
                Ok(candidates.pop())
            }
        }
    }

    async fn create_backup(&self) -> Result<String, StoreError> {
        Ok(format!("memory-backup-{}", Utc::now().to_rfc3339()))
    }

    async fn restore_from_backup(&self, _path: &str) -> Result<(), StoreError> {
        Ok(())
    }

    async fn cleanup(&self, options: CleanupOptions) -> Result<CleanupCounts, StoreError> {
        let _guard = self.write_queue.lock().await;
        let cutoff = Utc::now() - chrono::Duration::days(options.retention_days as i64);
        let mut counts = CleanupCounts::default();

        if options.prune_executions {
            let stale: Vec<String> = self
                .tables
                .executions
                .iter()
                .filter(|e| e.value().started_at < cutoff && e.value().status.is_terminal())
                .map(|e| e.key().clone())
                .collect();
            for id in stale {
                self.tables.executions.remove(&id);
                counts.executions_deleted += 1;
            }
        }

        if options.prune_checkpoints {
            for mut entry in self.tables.checkpoints.iter_mut() {
                let before = entry.len();
                entry.retain(|c| c.timestamp >= cutoff);
                counts.checkpoints_deleted += (before - entry.len()) as u64;
            }
        }

        Ok(counts)
    }

    async fn metrics(&self) -> Result<PersistenceMetrics, StoreError> {
        Ok(PersistenceMetrics {
            definitions_count: self.tables.definitions.len() as u64,
            executions_count: self.tables.executions.len() as u64,
            checkpoints_count: self.tables.checkpoints.iter().map(|e| e.value().len() as u64).sum(),
            store_size_bytes: 0,
            cache_hit_ratio: 1.0,
        })
    }
}

/// Clone impl needed by the filter/lookup helpers above; `WorkflowStateRecord`
/// has no derive since it is rarely copied wholesale outside this module.
impl Clone for WorkflowStateRecord {
    fn clone(&self) -> Self {
        Self {
            version: self.version,
            state: self.state.clone(),
            saved_at: self.saved_at,
        }
    }
}
