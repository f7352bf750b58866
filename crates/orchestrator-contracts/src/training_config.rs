//! Declarative configuration for the distributed training coordinator (C6).

use serde::{Deserialize, Serialize};

use crate::resource::ResourceRequirement;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrainingConfig {
    pub job_id: String,
    pub total_epochs: u32,

    /// Minimum resources an agent must have free to be selected for this job.
    pub resource_minima: ResourceRequirement,

    /// Upper bound on agents for this job; actual count is also capped by
    /// the coordinator's global `max_agents_per_job` and by how many
    /// compatible agents are available.
    pub job_max_agents: u32,

    #[serde(default)]
    pub load_balancing: bool,

    #[serde(default)]
    pub checkpointing_enabled: bool,

    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval_epochs: u32,

    #[serde(default)]
    pub auto_recovery: bool,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
}

fn default_checkpoint_interval() -> u32 {
    5
}

fn default_heartbeat_interval_ms() -> u64 {
    5000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_on_deserialize() {
        let json = serde_json::json!({
            "job_id": "job-1",
            "total_epochs": 10,
            "resource_minima": { "cpu": 1.0, "memory_mb": 512.0, "gpu": 0.0, "storage_mb": 0.0 },
            "job_max_agents": 4,
        });

        let cfg: TrainingConfig = serde_json::from_value(json).unwrap();
        assert_eq!(cfg.checkpoint_interval_epochs, 5);
        assert_eq!(cfg.heartbeat_interval_ms, 5000);
        assert!(!cfg.load_balancing);
    }
}
