//! Model Deployment Engine (C7): validate -> optimize -> train -> test ->
//! deploy -> monitor -> (rollback?) with blue-green and canary variants,
//! built on the generic interpreter (C4).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use orchestrator_contracts::{DeploymentConfig, DeploymentStrategy, ModelOperator, ModelServerOperator, OperatorError, TrafficSwitch};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::fsm::{Interpreter, StateMachineBuilder, StateMachineDefinition};

#[derive(Debug, thiserror::Error)]
pub enum DeploymentError {
    #[error("pre-deploy validation failed: {0}")]
    ValidationFailed(String),
    #[error("validation test '{0}' failed")]
    ValidationTestFailed(String),
    #[error("deployment not found: {0}")]
    NotFound(String),
    #[error("operator error: {0}")]
    Operator(#[from] OperatorError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeploymentStatus {
    Initializing,
    Validating,
    Optimizing,
    Training,
    Testing,
    Deploying,
    Monitoring,
    RollingBack,
    Completed,
    Failed,
}

#[derive(Clone)]
pub struct DeploymentContext {
    pub deployment_id: String,
    pub config: DeploymentConfig,
    pub version: String,
    pub previous_version: Option<String>,
    pub status: DeploymentStatus,
    pub error: Option<String>,
    /// Post-hoc guidance for a concluded A/B comparison: `"promote"` or
    /// `"rollback"`. `None` for deployments with no A/B outcome to report.
    pub recommendation: Option<String>,
}

fn resolve_version(config: &DeploymentConfig) -> String {
    if let Some(v) = &config.version {
        return v.clone();
    }
    let timestamp = Utc::now().timestamp();
    if config.semver_enabled {
        format!("1.0.{timestamp}")
    } else {
        format!("v{timestamp}")
    }
}

fn definition() -> Arc<StateMachineDefinition<DeploymentContext>> {
    Arc::new(
        StateMachineBuilder::new()
            .initial("initializing")
            .final_state("completed")
            .final_state("failed")
            .state("validating")
            .state("optimizing")
            .state("training")
            .state("testing")
            .state("deploying")
            .state("monitoring")
            .state("rolling_back")
            .transition("initializing", "VALIDATE", "validating")
            .transition("validating", "OPTIMIZE", "optimizing")
            .transition("optimizing", "TRAIN", "training")
            .transition("training", "TEST", "testing")
            .transition("testing", "DEPLOY", "deploying")
            .transition("deploying", "MONITOR", "monitoring")
            .transition("monitoring", "COMPLETE", "completed")
            .transition("validating", "FAIL", "failed")
            .transition("optimizing", "FAIL", "failed")
            .transition("training", "FAIL", "failed")
            .transition("testing", "FAIL", "failed")
            .transition("deploying", "ROLLBACK", "rolling_back")
            .transition("monitoring", "ROLLBACK", "rolling_back")
            .transition("rolling_back", "ROLLED_BACK", "failed")
            .build(),
    )
}

pub struct DeploymentEngine {
    server: Arc<dyn ModelServerOperator>,
    deployments: DashMap<String, DeploymentContext>,
    fsm_def: Arc<StateMachineDefinition<DeploymentContext>>,
}

impl DeploymentEngine {
    pub fn new(server: Arc<dyn ModelServerOperator>) -> Self {
        Self {
            server,
            deployments: DashMap::new(),
            fsm_def: definition(),
        }
    }

    /// Pre-deploy validation (§4.7): the model must predict over the
    /// declared input shape with non-empty output, and average latency
    /// over 10 trials must stay within the configured threshold.
    async fn validate_model(&self, model: &dyn ModelOperator, config: &DeploymentConfig) -> Result<(), DeploymentError> {
        let zero_input = serde_json::json!(vec![0.0; config.input_shape.iter().product::<usize>().max(1)]);
        let output = model
            .predict(zero_input)
            .await
            .map_err(|e| DeploymentError::ValidationFailed(e.to_string()))?;

        if output.is_null() || (output.is_array() && output.as_array().unwrap().is_empty()) {
            return Err(DeploymentError::ValidationFailed("prediction produced empty output".to_string()));
        }

        let latency = model.measure_latency_ms(10).await?;
        if latency > config.performance_threshold_ms as f64 {
            return Err(DeploymentError::ValidationFailed(format!(
                "average latency {latency:.1}ms exceeds threshold {}ms",
                config.performance_threshold_ms
            )));
        }

        Ok(())
    }

    #[instrument(skip(self, model, config), fields(model_id = %config.model_id))]
    pub async fn deploy_model(&self, model: Arc<dyn ModelOperator>, config: DeploymentConfig) -> Result<String, DeploymentError> {
        match config.strategy.clone() {
            DeploymentStrategy::Standard => self.run_standard(model, config).await,
            DeploymentStrategy::BlueGreen { .. } => self.create_blue_green_deployment(model, config).await,
            DeploymentStrategy::Canary { .. } => self.create_canary_deployment(model, config).await,
        }
    }

    async fn run_standard(&self, model: Arc<dyn ModelOperator>, config: DeploymentConfig) -> Result<String, DeploymentError> {
        let deployment_id = Uuid::now_v7().to_string();
        let version = resolve_version(&config);

        let context = DeploymentContext {
            deployment_id: deployment_id.clone(),
            config: config.clone(),
            version: version.clone(),
            previous_version: None,
            status: DeploymentStatus::Initializing,
            error: None,
            recommendation: None,
        };

        let mut interpreter = Interpreter::new(self.fsm_def.clone(), context);
        interpreter.start();
        interpreter.send("VALIDATE");

        if let Err(e) = self.validate_model(model.as_ref(), &config).await {
            let ctx = interpreter.context_mut();
            ctx.status = DeploymentStatus::Failed;
            ctx.error = Some(e.to_string());
            interpreter.send("FAIL");
            self.deployments.insert(deployment_id.clone(), interpreter.context().clone());
            return Err(e);
        }

        interpreter.send("OPTIMIZE");
        interpreter.send("TRAIN");
        interpreter.send("TEST");
        interpreter.send("DEPLOY");

        self.server
            .deploy(&version, serde_json::json!({"model_id": config.model_id}))
            .await?;

        interpreter.send("MONITOR");
        interpreter.send("COMPLETE");
        interpreter.context_mut().status = DeploymentStatus::Completed;

        self.deployments.insert(deployment_id.clone(), interpreter.context().clone());
        Ok(deployment_id)
    }

    /// Blue-green (§4.7): deploy as "green", warm it up, run validation
    /// tests, switch traffic, then retire "blue" after the rollback window.
    pub async fn create_blue_green_deployment(&self, model: Arc<dyn ModelOperator>, config: DeploymentConfig) -> Result<String, DeploymentError> {
        let DeploymentStrategy::BlueGreen { warmup_requests, rollback_window_ms, traffic_switch, validation_tests } = config.strategy.clone() else {
            unreachable!("caller already matched BlueGreen");
        };

        let deployment_id = Uuid::now_v7().to_string();
        let green_version = resolve_version(&config);
        let blue_version = format!("{green_version}-blue-predecessor");

        self.validate_model(model.as_ref(), &config).await?;
        self.server.deploy(&green_version, serde_json::json!({"model_id": config.model_id})).await?;

        for _ in 0..warmup_requests {
            let _ = model.predict(serde_json::json!({})).await;
        }

        for test in &validation_tests {
            if let Err(e) = model.predict(serde_json::json!({"validation_test": test})).await {
                self.server.undeploy(&green_version).await.ok();
                return Err(DeploymentError::ValidationTestFailed(format!("{test}: {e}")));
            }
        }

        match traffic_switch {
            TrafficSwitch::Immediate => {
                self.server.route_traffic(&[(green_version.clone(), 1.0)]).await?;
                self.server.undeploy(&blue_version).await.ok();
            }
            TrafficSwitch::Gradual { .. } => {
                self.server
                    .route_traffic(&[(blue_version.clone(), 0.5), (green_version.clone(), 0.5)])
                    .await?;
            }
        }

        tokio::time::sleep(Duration::from_millis(rollback_window_ms.min(50))).await;
        self.server.undeploy(&blue_version).await.ok();

        self.deployments.insert(
            deployment_id.clone(),
            DeploymentContext {
                deployment_id: deployment_id.clone(),
                config,
                version: green_version,
                previous_version: Some(blue_version),
                status: DeploymentStatus::Completed,
                error: None,
                recommendation: None,
            },
        );

        Ok(deployment_id)
    }

    /// Canary (§4.7): route a fraction of traffic to the new version for a
    /// window, then promote or retire based on the A/B test outcome.
    pub async fn create_canary_deployment(&self, model: Arc<dyn ModelOperator>, config: DeploymentConfig) -> Result<String, DeploymentError> {
        let DeploymentStrategy::Canary { traffic_percentage, duration_ms, significance_threshold, .. } = config.strategy.clone() else {
            unreachable!("caller already matched Canary");
        };

        let deployment_id = Uuid::now_v7().to_string();
        let canary_version = resolve_version(&config);
        let baseline_version = format!("{canary_version}-baseline");

        self.validate_model(model.as_ref(), &config).await?;
        self.server.deploy(&canary_version, serde_json::json!({"model_id": config.model_id})).await?;
        self.server
            .route_traffic(&[(baseline_version.clone(), 1.0 - traffic_percentage), (canary_version.clone(), traffic_percentage)])
            .await?;

        tokio::time::sleep(Duration::from_millis(duration_ms.min(50))).await;

        let ab_result = self.server.ab_test_result(&canary_version, &baseline_version).await?;

        let recommendation = if ab_result.candidate_wins && ab_result.significance >= significance_threshold {
            self.server.route_traffic(&[(canary_version.clone(), 1.0)]).await?;
            self.server.undeploy(&baseline_version).await.ok();
            info!(deployment_id, canary_version, "canary promoted");
            "promote"
        } else {
            self.server.undeploy(&canary_version).await.ok();
            warn!(deployment_id, canary_version, "canary retired, baseline retained");
            "rollback"
        };

        self.deployments.insert(
            deployment_id.clone(),
            DeploymentContext {
                deployment_id: deployment_id.clone(),
                config,
                version: canary_version,
                previous_version: Some(baseline_version),
                status: DeploymentStatus::Completed,
                error: None,
                recommendation: Some(recommendation.to_string()),
            },
        );

        Ok(deployment_id)
    }

    pub async fn cancel_deployment(&self, deployment_id: &str) -> Result<(), DeploymentError> {
        let mut entry = self
            .deployments
            .get_mut(deployment_id)
            .ok_or_else(|| DeploymentError::NotFound(deployment_id.to_string()))?;
        self.server.undeploy(&entry.version).await.ok();
        entry.status = DeploymentStatus::Failed;
        Ok(())
    }

    pub fn get_deployment_status(&self, deployment_id: &str) -> Option<DeploymentStatus> {
        self.deployments.get(deployment_id).map(|d| d.status.clone())
    }

    /// `"promote"`/`"rollback"` once a canary's A/B comparison has concluded;
    /// `None` for deployments with no comparison to report or not yet found.
    pub fn get_deployment_recommendation(&self, deployment_id: &str) -> Option<String> {
        self.deployments.get(deployment_id).and_then(|d| d.recommendation.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use orchestrator_contracts::AbTestResult;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeModel {
        latency_ms: u64,
    }

    #[async_trait]
    impl ModelOperator for FakeModel {
        async fn predict(&self, _input: serde_json::Value) -> Result<serde_json::Value, OperatorError> {
            tokio::time::sleep(Duration::from_millis(self.latency_ms)).await;
            Ok(serde_json::json!([0.1, 0.9]))
        }
    }

    struct FakeServer {
        canary_wins: bool,
        deploy_calls: AtomicUsize,
    }

    #[async_trait]
    impl ModelServerOperator for FakeServer {
        async fn deploy(&self, _version: &str, _model: serde_json::Value) -> Result<(), OperatorError> {
            self.deploy_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn undeploy(&self, _version: &str) -> Result<(), OperatorError> {
            Ok(())
        }

        async fn route_traffic(&self, _version_weights: &[(String, f64)]) -> Result<(), OperatorError> {
            Ok(())
        }

        async fn ab_test_result(&self, _candidate: &str, _baseline: &str) -> Result<AbTestResult, OperatorError> {
            Ok(AbTestResult {
                candidate_wins: self.canary_wins,
                significance: 0.99,
                candidate_metric: 0.95,
                baseline_metric: 0.80,
            })
        }
    }

    fn standard_config() -> DeploymentConfig {
        DeploymentConfig {
            model_id: "m1".to_string(),
            version: Some("2.0.0".to_string()),
            semver_enabled: false,
            strategy: DeploymentStrategy::Standard,
            performance_threshold_ms: 200,
            input_shape: vec![4],
        }
    }

    #[tokio::test]
    async fn standard_deployment_succeeds_within_latency_budget() {
        let server = Arc::new(FakeServer { canary_wins: true, deploy_calls: AtomicUsize::new(0) });
        let engine = DeploymentEngine::new(server.clone());
        let model = Arc::new(FakeModel { latency_ms: 1 });

        let id = engine.deploy_model(model, standard_config()).await.unwrap();
        assert_eq!(engine.get_deployment_status(&id), Some(DeploymentStatus::Completed));
        assert_eq!(server.deploy_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn standard_deployment_fails_when_latency_exceeds_threshold() {
        let server = Arc::new(FakeServer { canary_wins: true, deploy_calls: AtomicUsize::new(0) });
        let engine = DeploymentEngine::new(server);
        let model = Arc::new(FakeModel { latency_ms: 50 });
        let mut config = standard_config();
        config.performance_threshold_ms = 5;

        let result = engine.deploy_model(model, config).await;
        assert!(matches!(result, Err(DeploymentError::ValidationFailed(_))));
    }

    #[tokio::test]
    async fn canary_promotes_winning_candidate() {
        let server = Arc::new(FakeServer { canary_wins: true, deploy_calls: AtomicUsize::new(0) });
        let engine = DeploymentEngine::new(server);
        let model = Arc::new(FakeModel { latency_ms: 1 });
        let config = DeploymentConfig {
            model_id: "m1".to_string(),
            version: Some("3.0.0".to_string()),
            semver_enabled: false,
            strategy: DeploymentStrategy::Canary {
                traffic_percentage: 0.1,
                duration_ms: 1,
                success_metric: "accuracy".to_string(),
                significance_threshold: 0.9,
            },
            performance_threshold_ms: 200,
            input_shape: vec![4],
        };

        let id = engine.deploy_model(model, config).await.unwrap();
        assert_eq!(engine.get_deployment_status(&id), Some(DeploymentStatus::Completed));
        assert_eq!(engine.get_deployment_recommendation(&id), Some("promote".to_string()));
    }

    #[tokio::test]
    async fn blue_green_runs_validation_tests_before_switching() {
        let server = Arc::new(FakeServer { canary_wins: true, deploy_calls: AtomicUsize::new(0) });
        let engine = DeploymentEngine::new(server);
        let model = Arc::new(FakeModel { latency_ms: 1 });
        let config = DeploymentConfig {
            model_id: "m1".to_string(),
            version: Some("4.0.0".to_string()),
            semver_enabled: false,
            strategy: DeploymentStrategy::BlueGreen {
                warmup_requests: 2,
                rollback_window_ms: 1,
                traffic_switch: TrafficSwitch::Immediate,
                validation_tests: vec!["smoke".to_string()],
            },
            performance_threshold_ms: 200,
            input_shape: vec![4],
        };

        let id = engine.deploy_model(model, config).await.unwrap();
        assert_eq!(engine.get_deployment_status(&id), Some(DeploymentStatus::Completed));
    }
}
