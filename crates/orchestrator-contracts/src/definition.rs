//! `WorkflowDefinition` (§3): the immutable, versioned blueprint a
//! `WorkflowDefinition` execution is driven against.

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;
use crate::step::Step;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    /// Semantic version, e.g. "1.2.0". New versions are separate records;
    /// a definition is never mutated once registered.
    pub version: String,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub default_retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>, version: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: version.into(),
            steps,
            default_retry_policy: None,
            timeout_ms: None,
        }
    }

    pub fn step(&self, index: usize) -> Option<&Step> {
        self.steps.get(index)
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Name must be unique within the definition (§3 invariant).
    pub fn has_unique_step_names(&self) -> bool {
        let mut names: Vec<&str> = self.steps.iter().map(|s| s.name.as_str()).collect();
        let before = names.len();
        names.sort_unstable();
        names.dedup();
        names.len() == before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::StepKind;

    fn step(name: &str) -> Step {
        Step::new(
            name,
            StepKind::Script {
                config: serde_json::json!({}),
            },
        )
    }

    #[test]
    fn detects_duplicate_step_names() {
        let def = WorkflowDefinition::new("d1", "demo", "1.0.0", vec![step("a"), step("a")]);
        assert!(!def.has_unique_step_names());

        let def = WorkflowDefinition::new("d1", "demo", "1.0.0", vec![step("a"), step("b")]);
        assert!(def.has_unique_step_names());
    }

    #[test]
    fn step_lookup_is_bounds_checked() {
        let def = WorkflowDefinition::new("d1", "demo", "1.0.0", vec![step("a")]);
        assert!(def.step(0).is_some());
        assert!(def.step(1).is_none());
    }
}
