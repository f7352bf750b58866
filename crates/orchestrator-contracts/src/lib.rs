//! Shared data model for the workflow orchestration engine.
//!
//! This crate holds plain, serde-derived types with no business logic —
//! the workflow/step/execution/checkpoint/human-task/resource entities
//! described in the orchestration spec, plus the operator traits that the
//! engine calls out to (data sources, models, training agents, model
//! servers). Behavior lives in `orchestrator-engine`; this crate only
//! defines shapes.

pub mod checkpoint;
pub mod definition;
pub mod deployment_config;
pub mod error;
pub mod execution;
pub mod human_task;
pub mod operators;
pub mod pipeline_config;
pub mod resource;
pub mod retry;
pub mod step;
pub mod training_config;

pub use checkpoint::Checkpoint;
pub use definition::WorkflowDefinition;
pub use deployment_config::{DeploymentConfig, DeploymentStrategy, TrafficSwitch};
pub use error::{ErrorKind, OrchestratorErrorRecord};
pub use execution::{Execution, ExecutionContext, ExecutionStatus, StepExecution, StepExecutionStatus};
pub use human_task::{HumanGateConfig, HumanTask, HumanTaskResponse, HumanTaskStatus, HumanTaskType};
pub use operators::{
    AbTestResult, DataSourceAdapter, Dataset, ModelOperator, ModelServerOperator, OperatorError,
    TrainStepResult, TrainingAgentOperator,
};
pub use pipeline_config::{
    AugmentationConfig, CachingConfig, DataPipelineConfig, DataSourceSpec, DataSourceType,
    FilterOp, FilterPredicate, NoiseConfig, PreprocessStep, ValidationRule,
};
pub use resource::{ResourceAllocation, ResourceRequirement};
pub use retry::RetryPolicy;
pub use step::{ScriptConfig, Step, StepKind, StepKindTag};
pub use training_config::TrainingConfig;
