//! Declarative configuration for the data pipeline engine (C5).
//!
//! These are the typed, statically-checked per-step config records called
//! for in the design notes' "dynamic/untyped step configs" section — one
//! shape per pipeline phase, instead of an opaque blob interpreted at
//! runtime.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DataSourceType {
    File,
    Database,
    Api,
    Stream,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataSourceSpec {
    pub id: String,
    pub source_type: DataSourceType,
    /// Type-specific fields (path, connection string, endpoint, topic, ...),
    /// validated by the owning `DataSourceAdapter`, not by the engine.
    pub fields: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilterPredicate {
    pub field: String,
    pub operator: FilterOp,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PreprocessStep {
    Normalize {
        fields: Vec<String>,
    },
    /// Conjunction (AND) of predicates; a record survives only if all match.
    Filter {
        predicates: Vec<FilterPredicate>,
    },
    Transform {
        /// `(source_field, dest_field)` straight copies.
        #[serde(default)]
        copy: Vec<(String, String)>,
        /// `(dest_field, expression)` computed values, evaluated by the
        /// sandboxed expression evaluator shared with condition expressions.
        #[serde(default)]
        computed: Vec<(String, String)>,
    },
    Clean {
        #[serde(default = "default_true")]
        remove_nulls: bool,
        #[serde(default = "default_true")]
        trim_strings: bool,
    },
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValidationRule {
    Required { field: String },
    Range { field: String, min: f64, max: f64 },
    Pattern { field: String, pattern: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NoiseConfig {
    pub level: f64,
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AugmentationConfig {
    pub duplicate_factor: Option<u32>,
    pub noise: Option<NoiseConfig>,
    pub synthetic_count: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachingConfig {
    pub enabled: bool,
    pub max_cache_size_bytes: usize,
    pub data_retention_days: u32,
}

impl Default for CachingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_cache_size_bytes: 50 * 1024 * 1024,
            data_retention_days: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataPipelineConfig {
    pub sources: Vec<DataSourceSpec>,
    #[serde(default)]
    pub preprocessing: Vec<PreprocessStep>,
    #[serde(default)]
    pub validation: Vec<ValidationRule>,
    #[serde(default)]
    pub strict_validation: bool,
    #[serde(default)]
    pub augmentation: Option<AugmentationConfig>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub shuffle: bool,
    #[serde(default)]
    pub caching: Option<CachingConfig>,
}

fn default_batch_size() -> usize {
    32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let cfg = DataPipelineConfig {
            sources: vec![DataSourceSpec {
                id: "s1".into(),
                source_type: DataSourceType::File,
                fields: serde_json::json!({ "path": "in.json" }),
            }],
            preprocessing: vec![PreprocessStep::Clean {
                remove_nulls: true,
                trim_strings: true,
            }],
            validation: vec![ValidationRule::Required { field: "id".into() }],
            strict_validation: true,
            augmentation: None,
            batch_size: 10,
            shuffle: false,
            caching: None,
        };

        let json = serde_json::to_string(&cfg).unwrap();
        let back: DataPipelineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg, back);
    }
}
