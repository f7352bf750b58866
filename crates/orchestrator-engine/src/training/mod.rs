//! Distributed Training Coordinator (C6): simulated multi-agent training
//! with agent selection, topology assignment, heartbeat monitoring, and
//! failure recovery, built on the generic interpreter (C4).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use orchestrator_contracts::{OperatorError, ResourceRequirement, TrainingAgentOperator, TrainingConfig};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::fsm::{Interpreter, StateMachineBuilder, StateMachineDefinition};

#[derive(Debug, thiserror::Error)]
pub enum TrainingError {
    #[error("no agents meet the job's resource minima")]
    NoCompatibleAgents,
    #[error("recovery needs {needed} replacement agent(s), only {available} available")]
    InsufficientReplacements { needed: usize, available: usize },
    #[error("training job not found: {0}")]
    JobNotFound(String),
    #[error("operator error: {0}")]
    Operator(#[from] OperatorError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Idle,
    Training,
    Failed,
}

pub struct RegisteredAgent {
    pub id: String,
    pub operator: Arc<dyn TrainingAgentOperator>,
    pub resources: ResourceRequirement,
    pub status: AgentStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub jobs_count: u32,
    pub successes: u32,
    pub attempts: u32,
}

impl RegisteredAgent {
    fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            1.0
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }

    fn score(&self) -> f64 {
        0.7 * self.success_rate()
            + 0.3 * (self.resources.cpu + self.resources.memory_mb / 1024.0 + self.resources.gpu * 10.0) / 30.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    ParameterServer,
    AllReduceRing,
    HierarchicalTree,
}

fn topology_for(agent_count: usize) -> Topology {
    if agent_count <= 2 {
        Topology::ParameterServer
    } else if agent_count <= 8 {
        Topology::AllReduceRing
    } else {
        Topology::HierarchicalTree
    }
}

#[derive(Clone)]
pub struct TrainingJobContext {
    pub job_id: String,
    pub config: TrainingConfig,
    pub agent_ids: Vec<String>,
    pub master_id: Option<String>,
    pub topology: Option<Topology>,
    pub epoch: u32,
    pub loss: f64,
    pub accuracy: f64,
    pub last_checkpoint_epoch: Option<u32>,
    pub latest_checkpoint: Option<Vec<u8>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CoordinatorMetrics {
    pub registered_agents: usize,
    pub idle_agents: usize,
    pub failed_agents: usize,
    pub active_jobs: usize,
}

fn definition() -> Arc<StateMachineDefinition<TrainingJobContext>> {
    Arc::new(
        StateMachineBuilder::new()
            .initial("initializing")
            .final_state("completed")
            .final_state("failed")
            .state("coordinating")
            .state("training")
            .state("synchronizing")
            .state("checkpointing")
            .state("recovery")
            .state("paused")
            .state("finalizing")
            .transition("initializing", "COORDINATE", "coordinating")
            .transition("coordinating", "BEGIN_TRAINING", "training")
            .transition("training", "SYNC", "synchronizing")
            .transition("synchronizing", "NEXT_EPOCH", "training")
            .transition("training", "CHECKPOINT_DUE", "checkpointing")
            .transition("checkpointing", "NEXT_EPOCH", "training")
            .transition("training", "ALL_EPOCHS_DONE", "finalizing")
            .transition("finalizing", "FINALIZED", "completed")
            .transition("training", "AGENT_FAILED", "recovery")
            .transition("synchronizing", "AGENT_FAILED", "recovery")
            .transition("recovery", "RECOVERED", "training")
            .transition("recovery", "MANUAL_INTERVENTION", "paused")
            .transition("recovery", "RECOVERY_FAILED", "failed")
            .transition("paused", "RESUME", "training")
            .transition("paused", "CANCEL", "failed")
            .build(),
    )
}

pub struct TrainingCoordinator {
    agents: DashMap<String, RegisteredAgent>,
    jobs: DashMap<String, TrainingJobContext>,
    global_max_agents_per_job: u32,
    fsm_def: Arc<StateMachineDefinition<TrainingJobContext>>,
}

impl TrainingCoordinator {
    pub fn new(global_max_agents_per_job: u32) -> Self {
        Self {
            agents: DashMap::new(),
            jobs: DashMap::new(),
            global_max_agents_per_job,
            fsm_def: definition(),
        }
    }

    pub fn register_agent(&self, operator: Arc<dyn TrainingAgentOperator>, resources: ResourceRequirement) -> String {
        let id = Uuid::now_v7().to_string();
        self.agents.insert(
            id.clone(),
            RegisteredAgent {
                id: id.clone(),
                operator,
                resources,
                status: AgentStatus::Idle,
                last_heartbeat: Utc::now(),
                jobs_count: 0,
                successes: 0,
                attempts: 0,
            },
        );
        id
    }

    pub fn unregister_agent(&self, agent_id: &str) {
        self.agents.remove(agent_id);
    }

    pub fn heartbeat(&self, agent_id: &str) {
        if let Some(mut agent) = self.agents.get_mut(agent_id) {
            agent.last_heartbeat = Utc::now();
        }
    }

    /// Inspects every agent's last heartbeat; agents silent for longer than
    /// `2 * heartbeat_interval` are marked failed and returned so the caller
    /// can fire `AGENT_FAILED` into the jobs that agent participates in.
    pub fn check_heartbeats(&self, heartbeat_interval: Duration) -> Vec<String> {
        let threshold = chrono::Duration::from_std(heartbeat_interval * 2).unwrap_or(chrono::Duration::zero());
        let now = Utc::now();
        let mut newly_failed = Vec::new();

        for mut agent in self.agents.iter_mut() {
            if agent.status != AgentStatus::Failed && now - agent.last_heartbeat > threshold {
                agent.status = AgentStatus::Failed;
                newly_failed.push(agent.id.clone());
            }
        }
        newly_failed
    }

    fn select_agents(&self, config: &TrainingConfig) -> Vec<String> {
        // `fits_within` checks self <= capacity, so "agent meets job minima"
        // is `minima.fits_within(agent.resources)`, not the other way round.
        let mut candidates: Vec<String> = self
            .agents
            .iter()
            .filter(|a| a.status == AgentStatus::Idle && config.resource_minima.fits_within(&a.resources))
            .map(|a| a.id.clone())
            .collect();

        let limit = config
            .job_max_agents
            .min(self.global_max_agents_per_job)
            .min(candidates.len() as u32) as usize;

        if config.load_balancing {
            candidates.sort_by_key(|id| self.agents.get(id).map(|a| a.jobs_count).unwrap_or(u32::MAX));
        } else {
            candidates.sort_by(|a, b| {
                let score_a = self.agents.get(a).map(|a| a.score()).unwrap_or(0.0);
                let score_b = self.agents.get(b).map(|a| a.score()).unwrap_or(0.0);
                score_b.partial_cmp(&score_a).unwrap_or(std::cmp::Ordering::Equal)
            });
        }

        candidates.truncate(limit);
        candidates
    }

    #[instrument(skip(self, config), fields(job_id = %job_id))]
    pub async fn start_distributed_training(&self, job_id: impl Into<String>, config: TrainingConfig) -> Result<(), TrainingError> {
        let job_id = job_id.into();
        let agent_ids = self.select_agents(&config);
        if agent_ids.is_empty() {
            return Err(TrainingError::NoCompatibleAgents);
        }

        for id in &agent_ids {
            if let Some(mut agent) = self.agents.get_mut(id) {
                agent.status = AgentStatus::Training;
                agent.jobs_count += 1;
            }
        }

        let master_id = agent_ids.first().cloned();
        let topology = topology_for(agent_ids.len());

        let context = TrainingJobContext {
            job_id: job_id.clone(),
            config: config.clone(),
            agent_ids: agent_ids.clone(),
            master_id,
            topology: Some(topology),
            epoch: 0,
            loss: 0.0,
            accuracy: 0.0,
            last_checkpoint_epoch: None,
            latest_checkpoint: None,
            error: None,
        };

        let mut interpreter = Interpreter::new(self.fsm_def.clone(), context);
        interpreter.start();
        interpreter.send("COORDINATE");
        interpreter.send("BEGIN_TRAINING");

        self.run_epochs(&mut interpreter, &config).await?;

        for id in &agent_ids {
            if let Some(mut agent) = self.agents.get_mut(id) {
                agent.status = AgentStatus::Idle;
            }
        }

        self.jobs.insert(job_id, interpreter.context().clone());

        Ok(())
    }

    async fn run_epochs(&self, interpreter: &mut Interpreter<TrainingJobContext>, config: &TrainingConfig) -> Result<(), TrainingError> {
        while interpreter.context().epoch < config.total_epochs {
            let epoch = interpreter.context().epoch + 1;
            let agent_ids = interpreter.context().agent_ids.clone();

            let mut losses = Vec::new();
            let mut accuracies = Vec::new();
            let mut total_samples = 0u64;
            let mut failed_agent: Option<String> = None;

            for id in &agent_ids {
                let Some(agent) = self.agents.get(id) else { continue };
                if agent.status == AgentStatus::Failed {
                    failed_agent = Some(id.clone());
                    break;
                }
                match agent.operator.train_step(&interpreter.context().job_id, epoch).await {
                    Ok(result) => {
                        losses.push(result.loss);
                        accuracies.push(result.accuracy);
                        total_samples += result.samples;
                    }
                    Err(_) => {
                        failed_agent = Some(id.clone());
                        break;
                    }
                }
            }

            if let Some(failed_id) = failed_agent {
                interpreter.send("AGENT_FAILED");
                let recovered = self.recover(interpreter, &failed_id).await;
                match recovered {
                    Ok(()) => {
                        interpreter.send("RECOVERED");
                        continue;
                    }
                    Err(e) => {
                        warn!(job_id = %interpreter.context().job_id, error = %e, "recovery failed");
                        if config.auto_recovery {
                            interpreter.send("RECOVERY_FAILED");
                        } else {
                            interpreter.send("MANUAL_INTERVENTION");
                        }
                        return Err(e);
                    }
                }
            }

            let ctx = interpreter.context_mut();
            ctx.epoch = epoch;
            ctx.loss = losses.iter().sum::<f64>() / losses.len().max(1) as f64;
            ctx.accuracy = accuracies.iter().sum::<f64>() / accuracies.len().max(1) as f64;
            let _ = total_samples;

            let checkpoint_due = config.checkpointing_enabled
                && epoch.saturating_sub(ctx.last_checkpoint_epoch.unwrap_or(0)) >= config.checkpoint_interval_epochs;

            if checkpoint_due {
                interpreter.send("CHECKPOINT_DUE");
                if let Some(master_id) = ctx.master_id.clone() {
                    if let Some(master) = self.agents.get(&master_id) {
                        if let Ok(state) = master.operator.save_checkpoint(&ctx.job_id).await {
                            ctx.latest_checkpoint = Some(state);
                            ctx.last_checkpoint_epoch = Some(epoch);
                        }
                    }
                }
                interpreter.send("NEXT_EPOCH");
            } else if epoch < config.total_epochs {
                interpreter.send("SYNC");
                interpreter.send("NEXT_EPOCH");
            }
        }

        interpreter.send("ALL_EPOCHS_DONE");
        interpreter.send("FINALIZED");
        Ok(())
    }

    async fn recover(&self, interpreter: &mut Interpreter<TrainingJobContext>, failed_id: &str) -> Result<(), TrainingError> {
        if let Some(mut agent) = self.agents.get_mut(failed_id) {
            agent.status = AgentStatus::Failed;
        }

        let ctx = interpreter.context_mut();
        ctx.agent_ids.retain(|id| id != failed_id);

        let replacement = self
            .agents
            .iter()
            .find(|a| a.status == AgentStatus::Idle && ctx.config.resource_minima.fits_within(&a.resources))
            .map(|a| a.id.clone());

        let Some(replacement_id) = replacement else {
            return Err(TrainingError::InsufficientReplacements { needed: 1, available: 0 });
        };

        if let Some(mut agent) = self.agents.get_mut(&replacement_id) {
            agent.status = AgentStatus::Training;
        }
        ctx.agent_ids.push(replacement_id.clone());

        if ctx.master_id.as_deref() == Some(failed_id) {
            ctx.master_id = ctx.agent_ids.first().cloned();
        }

        if let (Some(checkpoint), Some(replacement)) = (ctx.latest_checkpoint.clone(), self.agents.get(&replacement_id)) {
            replacement.operator.restore_checkpoint(&ctx.job_id, &checkpoint).await?;
        }

        info!(job_id = %ctx.job_id, failed_id, replacement_id, "recovered training agent");
        Ok(())
    }

    pub fn coordinator_metrics(&self) -> CoordinatorMetrics {
        let idle = self.agents.iter().filter(|a| a.status == AgentStatus::Idle).count();
        let failed = self.agents.iter().filter(|a| a.status == AgentStatus::Failed).count();
        CoordinatorMetrics {
            registered_agents: self.agents.len(),
            idle_agents: idle,
            failed_agents: failed,
            active_jobs: self.jobs.len(),
        }
    }
}
