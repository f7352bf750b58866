//! Hierarchical workflow orchestration engine.
//!
//! Wires together the persistence store (C1), resource pool (C2), event bus
//! (C3), the generic FSM interpreter (C4) and the three nested engines it
//! drives (C5-C7) behind the top-level orchestration engine (C8). See each
//! module for the component it implements.

pub mod condition;
pub mod deployment;
pub mod error;
pub mod eventbus;
pub mod fsm;
pub mod orchestration;
pub mod persistence;
pub mod pipeline;
pub mod resources;
pub mod training;

pub use deployment::{DeploymentContext, DeploymentEngine, DeploymentError, DeploymentStatus};
pub use error::OrchestratorError;
pub use eventbus::EventBus;
pub use fsm::{Interpreter, StateMachineBuilder, StateMachineDefinition};
pub use orchestration::{DispatchError, OrchestrationEngine, OrchestrationMetrics};
pub use persistence::{InMemoryStore, PersistenceStore, SqliteStore, StoreError};
pub use pipeline::{PipelineEngine, PipelineError};
pub use resources::{ResourceError, ResourcePool, Utilization};
pub use training::{TrainingCoordinator, TrainingError};
