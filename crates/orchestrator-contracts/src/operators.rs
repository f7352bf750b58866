//! Contracts for the external collaborators the engine drives but does not
//! implement: data-source readers, model math, training agents, and model
//! servers (§1 "deliberately out of scope", §6).
//!
//! Unlike the `Activity`/`Workflow` traits these are object-safe — the
//! engine holds a registry of boxed operators looked up by id, the same way
//! it looks up workflow types, but without the associated-type input/output
//! pair (operator payloads are exchanged as `serde_json::Value` at this
//! boundary since they cross into adapter code the engine never compiles
//! against).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::pipeline_config::DataSourceSpec;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperatorError {
    pub message: String,
    pub retryable: bool,
}

impl OperatorError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl std::fmt::Display for OperatorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for OperatorError {}

/// Output of ingesting one declared source (§4.5 step 1).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Dataset {
    pub id: String,
    pub source_id: String,
    pub rows: Vec<serde_json::Value>,
    pub metadata: serde_json::Value,
    /// Field name -> inferred type name ("string", "number", "bool", "null").
    pub schema: std::collections::HashMap<String, String>,
}

/// Reads one configured source into a `Dataset`. Implementations own file,
/// database, API, and stream I/O; the engine only calls `read`.
#[async_trait]
pub trait DataSourceAdapter: Send + Sync {
    async fn read(&self, spec: &DataSourceSpec) -> Result<Dataset, OperatorError>;
}

/// The actual neural-network math (§1 non-goal): forward pass / predict.
#[async_trait]
pub trait ModelOperator: Send + Sync {
    async fn predict(&self, input: serde_json::Value) -> Result<serde_json::Value, OperatorError>;

    /// Average latency in milliseconds over `trials` predict calls, used by
    /// the deployment engine's pre-deploy performance check (§4.7).
    async fn measure_latency_ms(&self, trials: u32) -> Result<f64, OperatorError> {
        let start = std::time::Instant::now();
        for _ in 0..trials.max(1) {
            self.predict(serde_json::json!({})).await?;
        }
        Ok(start.elapsed().as_secs_f64() * 1000.0 / trials.max(1) as f64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrainStepResult {
    pub agent_id: String,
    pub loss: f64,
    pub accuracy: f64,
    pub samples: u64,
    pub duration_ms: u64,
}

/// One compute unit participating in a distributed training job (§4.6).
#[async_trait]
pub trait TrainingAgentOperator: Send + Sync {
    async fn train_step(&self, job_id: &str, epoch: u32) -> Result<TrainStepResult, OperatorError>;
    async fn save_checkpoint(&self, job_id: &str) -> Result<Vec<u8>, OperatorError>;
    async fn restore_checkpoint(&self, job_id: &str, state: &[u8]) -> Result<(), OperatorError>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AbTestResult {
    pub candidate_wins: bool,
    pub significance: f64,
    pub candidate_metric: f64,
    pub baseline_metric: f64,
}

/// Traffic-routing/serving side of deployment (§4.7): deploy a version,
/// shift traffic between two live versions, and undeploy.
#[async_trait]
pub trait ModelServerOperator: Send + Sync {
    async fn deploy(&self, version: &str, model: serde_json::Value) -> Result<(), OperatorError>;
    async fn undeploy(&self, version: &str) -> Result<(), OperatorError>;
    async fn route_traffic(&self, version_weights: &[(String, f64)]) -> Result<(), OperatorError>;
    async fn ab_test_result(&self, candidate: &str, baseline: &str) -> Result<AbTestResult, OperatorError>;
}
