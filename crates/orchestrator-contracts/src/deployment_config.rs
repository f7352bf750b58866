//! Declarative configuration for the model deployment engine (C7).

use serde::{Deserialize, Serialize};

/// Open question (spec.md §9) resolved here: a `gradual` traffic switch
/// ramps linearly rather than staying at an unspecified 50/50 split
/// forever. `ramp_percent_per_minute` is the percentage of traffic moved
/// to the new version per minute until it reaches 100%.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrafficSwitch {
    Immediate,
    Gradual { ramp_percent_per_minute: f64 },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeploymentStrategy {
    Standard,
    BlueGreen {
        warmup_requests: u32,
        rollback_window_ms: u64,
        traffic_switch: TrafficSwitch,
        validation_tests: Vec<String>,
    },
    Canary {
        traffic_percentage: f64,
        duration_ms: u64,
        success_metric: String,
        significance_threshold: f64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentConfig {
    pub model_id: String,

    /// Explicit version wins over SemVer-derived or `v<timestamp>` naming.
    #[serde(default)]
    pub version: Option<String>,

    #[serde(default)]
    pub semver_enabled: bool,

    pub strategy: DeploymentStrategy,

    pub performance_threshold_ms: u64,

    /// Predict over a zero-input request must succeed with non-empty output.
    pub input_shape: Vec<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_strategy_round_trips() {
        let cfg = DeploymentConfig {
            model_id: "m1".into(),
            version: None,
            semver_enabled: true,
            strategy: DeploymentStrategy::Standard,
            performance_threshold_ms: 200,
            input_shape: vec![1, 28, 28],
        };

        let json = serde_json::to_string(&cfg).unwrap();
        let back: DeploymentConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg, back);
    }

    #[test]
    fn canary_strategy_tag_shape() {
        let strategy = DeploymentStrategy::Canary {
            traffic_percentage: 0.2,
            duration_ms: 60_000,
            success_metric: "accuracy".into(),
            significance_threshold: 0.95,
        };
        let json = serde_json::to_value(&strategy).unwrap();
        assert_eq!(json["type"], "canary");
    }
}
