//! Step shapes that make up a `WorkflowDefinition` (§3, §4.8).

use serde::{Deserialize, Serialize};

use crate::human_task::HumanGateConfig;
use crate::resource::ResourceRequirement;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepKindTag {
    DataPipeline,
    Training,
    ModelDeployment,
    Validation,
    Parallel,
    Conditional,
    Script,
    HumanTask,
}

/// Opaque per-type configuration, dispatched on by the orchestration engine.
/// `Parallel`/`Conditional` carry child steps directly rather than an
/// opaque blob since their structure is load-bearing for the FSM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    DataPipeline { config: serde_json::Value },
    Training { config: serde_json::Value },
    ModelDeployment { config: serde_json::Value },
    Validation { config: serde_json::Value },
    Parallel { children: Vec<Step> },
    Conditional {
        condition: String,
        then_branch: Vec<Step>,
        else_branch: Vec<Step>,
    },
    Script { config: serde_json::Value },
    HumanTask { gate: HumanGateConfig },
}

impl StepKind {
    pub fn tag(&self) -> StepKindTag {
        match self {
            StepKind::DataPipeline { .. } => StepKindTag::DataPipeline,
            StepKind::Training { .. } => StepKindTag::Training,
            StepKind::ModelDeployment { .. } => StepKindTag::ModelDeployment,
            StepKind::Validation { .. } => StepKindTag::Validation,
            StepKind::Parallel { .. } => StepKindTag::Parallel,
            StepKind::Conditional { .. } => StepKindTag::Conditional,
            StepKind::Script { .. } => StepKindTag::Script,
            StepKind::HumanTask { .. } => StepKindTag::HumanTask,
        }
    }
}

/// Opaque config for a `script` step. Kept separate from `StepKind::Script`'s
/// `serde_json::Value` so callers that know the shape can deserialize it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScriptConfig {
    pub handler: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    /// Unique within the owning definition.
    pub name: String,
    pub kind: StepKind,
    #[serde(default)]
    pub resource_request: Option<ResourceRequirement>,
    /// Only meaningful when `kind` is not already `HumanTask`; lets any step
    /// require a validation gate after it runs.
    #[serde(default)]
    pub requires_human_validation: Option<HumanGateConfig>,
    /// Optional wall-clock timeout for this step's own execution (§3).
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub can_run_in_parallel: bool,
}

impl Step {
    pub fn new(name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            name: name.into(),
            kind,
            resource_request: None,
            requires_human_validation: None,
            timeout_ms: None,
            can_run_in_parallel: false,
        }
    }

    pub fn with_resource_request(mut self, req: ResourceRequirement) -> Self {
        self.resource_request = Some(req);
        self
    }

    pub fn with_human_gate(mut self, gate: HumanGateConfig) -> Self {
        self.requires_human_validation = Some(gate);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_matches_kind() {
        let step = Step::new(
            "fan-out",
            StepKind::Parallel {
                children: vec![Step::new(
                    "leaf",
                    StepKind::Script {
                        config: serde_json::json!({}),
                    },
                )],
            },
        );
        assert_eq!(step.kind.tag(), StepKindTag::Parallel);
    }

    #[test]
    fn round_trips_through_json() {
        let step = Step::new(
            "branch",
            StepKind::Conditional {
                condition: "outputs.score > 0.5".into(),
                then_branch: vec![],
                else_branch: vec![],
            },
        );
        let json = serde_json::to_string(&step).unwrap();
        let back: Step = serde_json::from_str(&json).unwrap();
        assert_eq!(step, back);
    }
}
