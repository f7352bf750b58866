//! Sqlite-backed `PersistenceStore` (§4.1, §6). The engine owns a single
//! file-backed store rather than a network database, so this swaps the
//! teacher's Postgres pool for `sqlx::SqlitePool` with WAL journaling;
//! everything else — runtime `query`/`query_as` over `FromRow` structs,
//! upsert-by-key, explicit transactions — follows `everruns-storage`'s
//! `Database` repository shape.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orchestrator_contracts::{Checkpoint, Execution, WorkflowDefinition};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, Row, SqlitePool};

use super::store::{
    CleanupCounts, CleanupOptions, ExecutionFilter, PersistenceMetrics, PersistenceStore,
    StoreError, WorkflowStateRecord,
};

pub struct SqliteStore {
    pool: SqlitePool,
    file_path: PathBuf,
}

impl SqliteStore {
    pub async fn connect(file_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let file_path = file_path.as_ref().to_path_buf();
        let options = SqliteConnectOptions::new()
            .filename(&file_path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Full);

        let pool = SqlitePoolOptions::new().max_connections(8).connect_with(options).await?;

        let store = Self { pool, file_path };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_definitions (
                id TEXT NOT NULL,
                version TEXT NOT NULL,
                data TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (id, version)
            );

            CREATE TABLE IF NOT EXISTS workflow_executions (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                data TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_executions_workflow ON workflow_executions (workflow_id);
            CREATE INDEX IF NOT EXISTS idx_executions_status ON workflow_executions (status);
            CREATE INDEX IF NOT EXISTS idx_executions_started_at ON workflow_executions (started_at);

            CREATE TABLE IF NOT EXISTS workflow_checkpoints (
                id TEXT NOT NULL,
                workflow_id TEXT NOT NULL,
                execution_id TEXT NOT NULL,
                step_index INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                checksum INTEGER NOT NULL,
                state BLOB NOT NULL,
                PRIMARY KEY (id)
            );
            CREATE INDEX IF NOT EXISTS idx_checkpoints_exec ON workflow_checkpoints (workflow_id, execution_id);

            CREATE TABLE IF NOT EXISTS workflow_states (
                workflow_id TEXT NOT NULL,
                execution_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                data TEXT NOT NULL,
                saved_at TEXT NOT NULL,
                PRIMARY KEY (workflow_id, execution_id, version)
            );

            CREATE TABLE IF NOT EXISTS latest_states (
                workflow_id TEXT NOT NULL,
                execution_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                PRIMARY KEY (workflow_id, execution_id)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[derive(FromRow)]
struct DefinitionRow {
    data: String,
}

#[derive(FromRow)]
struct ExecutionRow {
    data: String,
}

#[derive(FromRow)]
struct CheckpointRow {
    id: String,
    step_index: i64,
    timestamp: String,
    checksum: i64,
    state: Vec<u8>,
}

impl CheckpointRow {
    fn into_checkpoint(self, execution_id: &str) -> Result<Checkpoint, StoreError> {
        let timestamp: DateTime<Utc> = self
            .timestamp
            .parse()
            .map_err(|e: chrono::ParseError| StoreError::Database(e.to_string()))?;
        Ok(Checkpoint {
            id: self.id,
            execution_id: execution_id.to_string(),
            step_index: self.step_index as usize,
            timestamp,
            size_bytes: self.state.len(),
            checksum: self.checksum as u32,
            state: self.state,
        })
    }
}

#[async_trait]
impl PersistenceStore for SqliteStore {
    async fn save_workflow_state(
        &self,
        workflow_id: &str,
        execution_id: &str,
        state: serde_json::Value,
    ) -> Result<u32, StoreError> {
        let mut tx = self.pool.begin().await?;

        let next_version: i64 = sqlx::query(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM workflow_states WHERE workflow_id = ? AND execution_id = ?",
        )
        .bind(workflow_id)
        .bind(execution_id)
        .fetch_one(&mut *tx)
        .await?
        .get(0);

        let now = Utc::now().to_rfc3339();
        let data = serde_json::to_string(&state)?;

        sqlx::query(
            "INSERT INTO workflow_states (workflow_id, execution_id, version, data, saved_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(workflow_id)
        .bind(execution_id)
        .bind(next_version)
        .bind(&data)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO latest_states (workflow_id, execution_id, version) VALUES (?, ?, ?)
             ON CONFLICT (workflow_id, execution_id) DO UPDATE SET version = excluded.version",
        )
        .bind(workflow_id)
        .bind(execution_id)
        .bind(next_version)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(next_version as u32)
    }

    async fn load_workflow_state(
        &self,
        workflow_id: &str,
        execution_id: &str,
        version: Option<u32>,
    ) -> Result<Option<WorkflowStateRecord>, StoreError> {
        let version = match version {
            Some(v) => v as i64,
            None => {
                let row = sqlx::query(
                    "SELECT version FROM latest_states WHERE workflow_id = ? AND execution_id = ?",
                )
                .bind(workflow_id)
                .bind(execution_id)
                .fetch_optional(&self.pool)
                .await?;
                match row {
                    Some(r) => r.get::<i64, _>(0),
                    None => return Ok(None),
                }
            }
        };

        let row = sqlx::query(
            "SELECT version, data, saved_at FROM workflow_states WHERE workflow_id = ? AND execution_id = ? AND version = ?",
        )
        .bind(workflow_id)
        .bind(execution_id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let data: String = row.get("data");
        let saved_at: String = row.get("saved_at");
        Ok(Some(WorkflowStateRecord {
            version: version as u32,
            state: serde_json::from_str(&data)?,
            saved_at: saved_at
                .parse()
                .map_err(|e: chrono::ParseError| StoreError::Database(e.to_string()))?,
        }))
    }

    async fn save_checkpoint(
        &self,
        workflow_id: &str,
        execution_id: &str,
        checkpoint: Checkpoint,
        max_versions: Option<usize>,
    ) -> Result<String, StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO workflow_checkpoints (id, workflow_id, execution_id, step_index, timestamp, checksum, state)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&checkpoint.id)
        .bind(workflow_id)
        .bind(execution_id)
        .bind(checkpoint.step_index as i64)
        .bind(checkpoint.timestamp.to_rfc3339())
        .bind(checkpoint.checksum as i64)
        .bind(&checkpoint.state)
        .execute(&mut *tx)
        .await?;

        if let Some(max) = max_versions {
            sqlx::query(
                "DELETE FROM workflow_checkpoints WHERE workflow_id = ? AND execution_id = ? AND id NOT IN (
                    SELECT id FROM workflow_checkpoints WHERE workflow_id = ? AND execution_id = ?
                    ORDER BY timestamp DESC LIMIT ?
                )",
            )
            .bind(workflow_id)
            .bind(execution_id)
            .bind(workflow_id)
            .bind(execution_id)
            .bind(max as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(checkpoint.id)
    }

    async fn load_checkpoint(
        &self,
        workflow_id: &str,
        execution_id: &str,
        checkpoint_id: Option<&str>,
    ) -> Result<Option<Checkpoint>, StoreError> {
        let row = match checkpoint_id {
            Some(id) => {
                sqlx::query_as::<_, CheckpointRow>(
                    "SELECT id, step_index, timestamp, checksum, state FROM workflow_checkpoints WHERE workflow_id = ? AND execution_id = ? AND id = ?",
                )
                .bind(workflow_id)
                .bind(execution_id)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, CheckpointRow>(
                    "SELECT id, step_index, timestamp, checksum, state FROM workflow_checkpoints WHERE workflow_id = ? AND execution_id = ? ORDER BY timestamp DESC LIMIT 1",
                )
                .bind(workflow_id)
                .bind(execution_id)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        let Some(row) = row else { return Ok(None) };
        let id = row.id.clone();
        let checkpoint = row.into_checkpoint(execution_id)?;
        if !checkpoint.verify() {
            return Err(StoreError::CorruptedRecord(id));
        }
        Ok(Some(checkpoint))
    }

    async fn save_execution(&self, execution: &Execution) -> Result<(), StoreError> {
        let data = serde_json::to_string(execution)?;
        let status = serde_json::to_value(execution.status)?
            .as_str()
            .unwrap_or_default()
            .to_string();

        sqlx::query(
            "INSERT INTO workflow_executions (id, workflow_id, status, started_at, data) VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (id) DO UPDATE SET status = excluded.status, data = excluded.data",
        )
        .bind(&execution.id)
        .bind(&execution.workflow_id)
        .bind(&status)
        .bind(execution.started_at.to_rfc3339())
        .bind(&data)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_execution(&self, id: &str) -> Result<Option<Execution>, StoreError> {
        let row = sqlx::query_as::<_, ExecutionRow>("SELECT data FROM workflow_executions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(serde_json::from_str(&row.data)?)),
            None => Ok(None),
        }
    }

    async fn query_executions(&self, filter: ExecutionFilter) -> Result<Vec<Execution>, StoreError> {
        let mut sql = String::from("SELECT data FROM workflow_executions WHERE 1=1");
        if filter.workflow_id.is_some() {
            sql.push_str(" AND workflow_id = ?");
        }
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filter.started_after.is_some() {
            sql.push_str(" AND started_at >= ?");
        }
        if filter.started_before.is_some() {
            sql.push_str(" AND started_at <= ?");
        }
        sql.push_str(" ORDER BY started_at DESC");
        if filter.limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut query = sqlx::query_as::<_, ExecutionRow>(&sql);
        if let Some(wid) = &filter.workflow_id {
            query = query.bind(wid);
        }
        if let Some(status) = filter.status {
            let s = serde_json::to_value(status)?.as_str().unwrap_or_default().to_string();
            query = query.bind(s);
        }
        if let Some(t) = filter.started_after {
            query = query.bind(t.to_rfc3339());
        }
        if let Some(t) = filter.started_before {
            query = query.bind(t.to_rfc3339());
        }
        if let Some(limit) = filter.limit {
            query = query.bind(limit as i64);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|row| serde_json::from_str(&row.data).map_err(StoreError::from))
            .collect()
    }

    async fn save_workflow_definition(&self, def: &WorkflowDefinition) -> Result<(), StoreError> {
        let data = serde_json::to_string(def)?;
        sqlx::query(
            "INSERT INTO workflow_definitions (id, version, data, created_at) VALUES (?, ?, ?, ?)
             ON CONFLICT (id, version) DO UPDATE SET data = excluded.data",
        )
        .bind(&def.id)
        .bind(&def.version)
        .bind(&data)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_workflow_definition(
        &self,
        id: &str,
        version: Option<&str>,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        let row = match version {
            Some(v) => {
                sqlx::query_as::<_, DefinitionRow>(
                    "SELECT data FROM workflow_definitions WHERE id = ? AND version = ?",
                )
                .bind(id)
                .bind(v)
                .fetch_optional(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, DefinitionRow>(
                    "SELECT data FROM workflow_definitions WHERE id = ? ORDER BY version DESC LIMIT 1",
                )
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        match row {
            Some(row) => Ok(Some(serde_json::from_str(&row.data)?)),
            None => Ok(None),
        }
    }

    async fn create_backup(&self) -> Result<String, StoreError> {
        let suffix = Utc::now().to_rfc3339().replace(':', "-");
        let backup_path = self.file_path.with_extension(format!("backup-{suffix}"));
        tokio::fs::copy(&self.file_path, &backup_path)
            .await
            .map_err(|e| StoreError::Backup(e.to_string()))?;
        Ok(backup_path.to_string_lossy().into_owned())
    }

    async fn restore_from_backup(&self, path: &str) -> Result<(), StoreError> {
        self.pool.close().await;
        tokio::fs::copy(path, &self.file_path)
            .await
            .map_err(|e| StoreError::Backup(e.to_string()))?;
        Ok(())
    }

    async fn cleanup(&self, options: CleanupOptions) -> Result<CleanupCounts, StoreError> {
        let cutoff = (Utc::now() - chrono::Duration::days(options.retention_days as i64)).to_rfc3339();
        let mut counts = CleanupCounts::default();

        if options.prune_executions {
            let result = sqlx::query(
                "DELETE FROM workflow_executions WHERE started_at < ? AND status IN ('completed', 'cancelled', 'failed')",
            )
            .bind(&cutoff)
            .execute(&self.pool)
            .await?;
            counts.executions_deleted = result.rows_affected();
        }

        if options.prune_checkpoints {
            let result = sqlx::query("DELETE FROM workflow_checkpoints WHERE timestamp < ?")
                .bind(&cutoff)
                .execute(&self.pool)
                .await?;
            counts.checkpoints_deleted = result.rows_affected();
        }

        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(counts)
    }

    async fn metrics(&self) -> Result<PersistenceMetrics, StoreError> {
        let definitions: i64 = sqlx::query("SELECT COUNT(*) FROM workflow_definitions")
            .fetch_one(&self.pool)
            .await?
            .get(0);
        let executions: i64 = sqlx::query("SELECT COUNT(*) FROM workflow_executions")
            .fetch_one(&self.pool)
            .await?
            .get(0);
        let checkpoints: i64 = sqlx::query("SELECT COUNT(*) FROM workflow_checkpoints")
            .fetch_one(&self.pool)
            .await?
            .get(0);

        let store_size_bytes = tokio::fs::metadata(&self.file_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);

        Ok(PersistenceMetrics {
            definitions_count: definitions as u64,
            executions_count: executions as u64,
            checkpoints_count: checkpoints as u64,
            store_size_bytes,
            cache_hit_ratio: 1.0,
        })
    }
}
