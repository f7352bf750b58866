// End-to-end scenarios driving the orchestration engine through its nested
// data pipeline, training, and deployment engines rather than bare script
// steps, the way a caller assembling a real workflow would.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use orchestrator_contracts::{
    AbTestResult, DataPipelineConfig, DataSourceAdapter, DataSourceSpec, DataSourceType, Dataset,
    DeploymentConfig, DeploymentStrategy, ModelOperator, ModelServerOperator, OperatorError,
    ResourceRequirement, Step, StepKind, TrainStepResult, TrainingAgentOperator, TrainingConfig,
    WorkflowDefinition,
};
use orchestrator_engine::{
    DeploymentEngine, EventBus, InMemoryStore, OrchestrationEngine, PipelineEngine, ResourcePool,
    TrainingCoordinator,
};
use serde_json::Value;

struct FakeAdapter;

#[async_trait]
impl DataSourceAdapter for FakeAdapter {
    async fn read(&self, spec: &DataSourceSpec) -> Result<Dataset, OperatorError> {
        Ok(Dataset {
            id: "d1".to_string(),
            source_id: spec.id.clone(),
            rows: vec![
                serde_json::json!({"value": 1}),
                serde_json::json!({"value": 2}),
                serde_json::json!({"value": 3}),
            ],
            metadata: serde_json::json!({}),
            schema: HashMap::new(),
        })
    }
}

struct SlowAdapter {
    delay: Duration,
}

#[async_trait]
impl DataSourceAdapter for SlowAdapter {
    async fn read(&self, spec: &DataSourceSpec) -> Result<Dataset, OperatorError> {
        tokio::time::sleep(self.delay).await;
        Ok(Dataset {
            id: "d1".to_string(),
            source_id: spec.id.clone(),
            rows: vec![serde_json::json!({"value": 1})],
            metadata: serde_json::json!({}),
            schema: HashMap::new(),
        })
    }
}

struct NoopModelServer;

#[async_trait]
impl ModelServerOperator for NoopModelServer {
    async fn deploy(&self, _version: &str, _model: Value) -> Result<(), OperatorError> {
        Ok(())
    }
    async fn undeploy(&self, _version: &str) -> Result<(), OperatorError> {
        Ok(())
    }
    async fn route_traffic(&self, _w: &[(String, f64)]) -> Result<(), OperatorError> {
        Ok(())
    }
    async fn ab_test_result(&self, _c: &str, _b: &str) -> Result<AbTestResult, OperatorError> {
        Ok(AbTestResult { candidate_wins: true, significance: 0.99, candidate_metric: 1.0, baseline_metric: 0.5 })
    }
}

fn pipeline_source() -> DataSourceSpec {
    DataSourceSpec { id: "s1".to_string(), source_type: DataSourceType::File, fields: serde_json::json!({}) }
}

fn pipeline_config(batch_size: usize) -> DataPipelineConfig {
    DataPipelineConfig {
        sources: vec![pipeline_source()],
        preprocessing: vec![],
        validation: vec![],
        strict_validation: false,
        augmentation: None,
        batch_size,
        shuffle: false,
        caching: None,
    }
}

fn engine_with(pipelines: Arc<PipelineEngine>, training: Arc<TrainingCoordinator>, deployments: Arc<DeploymentEngine>) -> OrchestrationEngine {
    OrchestrationEngine::new(
        Arc::new(InMemoryStore::new()),
        Arc::new(ResourcePool::new(ResourceRequirement::new(8.0, 8192.0, 2.0, 1000.0))),
        EventBus::new(Duration::from_millis(10), 100),
        pipelines,
        training,
        deployments,
    )
}

fn default_engine() -> OrchestrationEngine {
    let pipelines = Arc::new(PipelineEngine::new());
    pipelines.register_adapter("File", Arc::new(FakeAdapter));
    engine_with(pipelines, Arc::new(TrainingCoordinator::new(8)), Arc::new(DeploymentEngine::new(Arc::new(NoopModelServer))))
}

// S1: a linear workflow whose only step is a real data pipeline batches
// three ingested rows into two batches and completes.
#[tokio::test]
async fn s1_linear_pipeline_batches_and_completes() {
    let engine = default_engine();
    let step = Step::new(
        "ingest",
        StepKind::DataPipeline { config: serde_json::to_value(pipeline_config(2)).unwrap() },
    );
    let def = WorkflowDefinition::new("wf-s1", "ingest-only", "1.0.0", vec![step]);
    engine.register_workflow(def).await.unwrap();

    let execution_id = engine.execute_workflow("wf-s1", "1.0.0", HashMap::new()).await.unwrap();
    let execution = engine.get_execution(&execution_id).unwrap();

    assert_eq!(execution.status, orchestrator_contracts::ExecutionStatus::Completed);
    let output = execution.context.outputs.get("ingest").unwrap();
    assert_eq!(output["status"], "completed");
    assert_eq!(output["batch_count"], 2);
}

// S2: a step whose resource request exceeds the pool's total capacity can
// never be admitted and the execution fails once the wait deadline passes,
// without ever touching the first step's already-released allocation.
#[tokio::test]
async fn s2_resource_starvation_fails_execution_after_timeout() {
    let small = ResourceRequirement::new(1.0, 256.0, 0.0, 0.0);
    let huge = ResourceRequirement::new(1_000.0, 0.0, 0.0, 0.0);

    let pipelines = Arc::new(PipelineEngine::new());
    pipelines.register_adapter("File", Arc::new(FakeAdapter));
    let engine = engine_with(pipelines, Arc::new(TrainingCoordinator::new(8)), Arc::new(DeploymentEngine::new(Arc::new(NoopModelServer))))
        .with_resource_wait_timeout(Duration::from_millis(50));

    let cheap = Step::new(
        "fits",
        StepKind::DataPipeline { config: serde_json::to_value(pipeline_config(10)).unwrap() },
    )
    .with_resource_request(small);
    let starved = Step::new("starved", StepKind::Script { config: serde_json::json!({}) }).with_resource_request(huge);

    let def = WorkflowDefinition::new("wf-s2", "starves", "1.0.0", vec![cheap, starved]);
    engine.register_workflow(def).await.unwrap();

    let execution_id = engine.execute_workflow("wf-s2", "1.0.0", HashMap::new()).await.unwrap();
    let execution = engine.get_execution(&execution_id).unwrap();

    assert_eq!(execution.status, orchestrator_contracts::ExecutionStatus::Failed);
    assert!(execution.context.outputs.contains_key("fits"));
    assert!(!execution.context.outputs.contains_key("starved"));
    assert_eq!(engine.metrics().resource_utilization.cpu, 0.0);
}

// S4: a fan-out step with three slow data-pipeline children completes in
// roughly the time of one child, not the sum of all three, proving the
// concurrency-safe children actually run concurrently.
#[tokio::test]
async fn s4_parallel_fan_out_runs_concurrently() {
    let delay = Duration::from_millis(60);
    let pipelines = Arc::new(PipelineEngine::new());
    pipelines.register_adapter("File", Arc::new(SlowAdapter { delay }));
    let engine = engine_with(pipelines, Arc::new(TrainingCoordinator::new(8)), Arc::new(DeploymentEngine::new(Arc::new(NoopModelServer))));

    let children: Vec<Step> = (0..3)
        .map(|i| Step::new(format!("branch-{i}"), StepKind::DataPipeline { config: serde_json::to_value(pipeline_config(10)).unwrap() }))
        .collect();
    let fan_out = Step::new("fan-out", StepKind::Parallel { children });
    let def = WorkflowDefinition::new("wf-s4", "fan-out", "1.0.0", vec![fan_out]);
    engine.register_workflow(def).await.unwrap();

    let started = tokio::time::Instant::now();
    let execution_id = engine.execute_workflow("wf-s4", "1.0.0", HashMap::new()).await.unwrap();
    let elapsed = started.elapsed();

    let execution = engine.get_execution(&execution_id).unwrap();
    assert_eq!(execution.status, orchestrator_contracts::ExecutionStatus::Completed);
    // Sequential execution of three 60ms children would take >= 180ms; a
    // generous 150ms ceiling still leaves room for scheduler noise while
    // clearly ruling out the sequential case.
    assert!(elapsed < Duration::from_millis(150), "fan-out took {elapsed:?}, expected roughly one child's delay");
}

// S5: a canary that loses its A/B test against the baseline is retired
// rather than promoted, and the baseline version is the one left serving.
#[tokio::test]
async fn s5_losing_canary_is_retired_and_baseline_kept() {
    struct RecordingServer {
        canary_wins: bool,
        undeployed: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ModelServerOperator for RecordingServer {
        async fn deploy(&self, _version: &str, _model: Value) -> Result<(), OperatorError> {
            Ok(())
        }
        async fn undeploy(&self, version: &str) -> Result<(), OperatorError> {
            self.undeployed.lock().unwrap().push(version.to_string());
            Ok(())
        }
        async fn route_traffic(&self, _w: &[(String, f64)]) -> Result<(), OperatorError> {
            Ok(())
        }
        async fn ab_test_result(&self, _c: &str, _b: &str) -> Result<AbTestResult, OperatorError> {
            Ok(AbTestResult { candidate_wins: self.canary_wins, significance: 0.99, candidate_metric: 0.4, baseline_metric: 0.9 })
        }
    }

    struct FastModel;
    #[async_trait]
    impl ModelOperator for FastModel {
        async fn predict(&self, _input: Value) -> Result<Value, OperatorError> {
            Ok(serde_json::json!([0.1]))
        }
    }

    let server = Arc::new(RecordingServer { canary_wins: false, undeployed: std::sync::Mutex::new(Vec::new()) });
    let deployment_engine = DeploymentEngine::new(server.clone());

    let config = DeploymentConfig {
        model_id: "m1".to_string(),
        version: Some("5.0.0".to_string()),
        semver_enabled: false,
        strategy: DeploymentStrategy::Canary {
            traffic_percentage: 0.1,
            duration_ms: 1,
            success_metric: "accuracy".to_string(),
            significance_threshold: 0.9,
        },
        performance_threshold_ms: 500,
        input_shape: vec![4],
    };

    let deployment_id = deployment_engine.deploy_model(Arc::new(FastModel), config).await.unwrap();

    assert_eq!(deployment_engine.get_deployment_status(&deployment_id), Some(orchestrator_engine::DeploymentStatus::Completed));
    assert_eq!(deployment_engine.get_deployment_recommendation(&deployment_id), Some("rollback".to_string()));
    let undeployed = server.undeployed.lock().unwrap();
    assert!(undeployed.iter().any(|v| v.contains("5.0.0") && !v.contains("baseline")));
    assert!(!undeployed.iter().any(|v| v.contains("baseline")));
}

// S6: an agent that fails mid-job is replaced by an idle spare and the job
// still reaches its target epoch count.
#[tokio::test]
async fn s6_training_agent_failure_recovers_onto_spare_agent() {
    struct FlakyAgent {
        fail_at_epoch: u32,
    }

    #[async_trait]
    impl TrainingAgentOperator for FlakyAgent {
        async fn train_step(&self, _job_id: &str, epoch: u32) -> Result<TrainStepResult, OperatorError> {
            if epoch == self.fail_at_epoch {
                return Err(OperatorError::retryable("agent crashed"));
            }
            Ok(TrainStepResult { agent_id: "flaky".to_string(), loss: 0.5, accuracy: 0.8, samples: 10, duration_ms: 1 })
        }
        async fn save_checkpoint(&self, _job_id: &str) -> Result<Vec<u8>, OperatorError> {
            Ok(vec![])
        }
        async fn restore_checkpoint(&self, _job_id: &str, _state: &[u8]) -> Result<(), OperatorError> {
            Ok(())
        }
    }

    struct ReliableAgent;
    #[async_trait]
    impl TrainingAgentOperator for ReliableAgent {
        async fn train_step(&self, _job_id: &str, _epoch: u32) -> Result<TrainStepResult, OperatorError> {
            Ok(TrainStepResult { agent_id: "reliable".to_string(), loss: 0.3, accuracy: 0.9, samples: 10, duration_ms: 1 })
        }
        async fn save_checkpoint(&self, _job_id: &str) -> Result<Vec<u8>, OperatorError> {
            Ok(vec![])
        }
        async fn restore_checkpoint(&self, _job_id: &str, _state: &[u8]) -> Result<(), OperatorError> {
            Ok(())
        }
    }

    let coordinator = TrainingCoordinator::new(8);
    let minima = ResourceRequirement::new(1.0, 512.0, 0.0, 0.0);
    let reliable_resources = ResourceRequirement::new(2.0, 1024.0, 0.0, 0.0);
    // Scored higher than the reliable agents on resources alone, so it is
    // always one of the two agents selected regardless of the other two's
    // (tied) relative order.
    let flaky_resources = ResourceRequirement::new(8.0, 4096.0, 0.0, 0.0);

    coordinator.register_agent(Arc::new(FlakyAgent { fail_at_epoch: 2 }), flaky_resources);
    coordinator.register_agent(Arc::new(ReliableAgent), reliable_resources);
    // Idle spare, not selected initially since job_max_agents caps at 2.
    coordinator.register_agent(Arc::new(ReliableAgent), reliable_resources);

    let config = TrainingConfig {
        job_id: "job-s6".to_string(),
        total_epochs: 3,
        resource_minima: minima,
        job_max_agents: 2,
        load_balancing: false,
        checkpointing_enabled: false,
        checkpoint_interval_epochs: 5,
        auto_recovery: true,
        heartbeat_interval_ms: 5000,
    };

    let result = coordinator.start_distributed_training("job-s6", config).await;
    assert!(result.is_ok(), "training should recover onto the spare agent: {result:?}");

    let metrics = coordinator.coordinator_metrics();
    assert_eq!(metrics.failed_agents, 1);
    assert_eq!(metrics.idle_agents, 2);
}
