//! Data Pipeline Engine (C5): ingest -> preprocess -> validate -> augment ->
//! batch -> cache, built on the generic interpreter (C4).
//!
//! Each call to `execute_pipeline` drives one execution straight through;
//! there is no external event that advances a running pipeline, so the FSM
//! here exists mainly to record states for observability rather than to
//! block on external input, unlike C8's human-gated executing state.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use orchestrator_contracts::{
    AugmentationConfig, CachingConfig, DataPipelineConfig, DataSourceAdapter, Dataset, FilterOp,
    FilterPredicate, OperatorError, PreprocessStep, ValidationRule,
};
use rand::seq::SliceRandom;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::condition;
use crate::fsm::{Interpreter, StateMachineBuilder, StateMachineDefinition};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("pipeline definition must configure at least one source")]
    NoSources,
    #[error("unsupported data source format: {0}")]
    UnsupportedFormat(String),
    #[error("no source adapter registered for type {0:?}")]
    NoAdapter(String),
    #[error("strict validation failed: {0} record(s) with errors")]
    StrictValidationFailed(usize),
    #[error("operator error: {0}")]
    Operator(#[from] OperatorError),
    #[error("pipeline execution not found: {0}")]
    ExecutionNotFound(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Batch {
    pub id: String,
    pub index: usize,
    pub data: Vec<Value>,
    pub size: usize,
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub record_errors: Vec<(usize, Vec<String>)>,
    pub total_records: usize,
    pub failed_records: usize,
}

#[derive(Clone)]
struct CacheEntry {
    batches: Vec<Batch>,
    cached_at: chrono::DateTime<Utc>,
}

#[derive(Clone)]
pub struct PipelineContext {
    pub execution_id: String,
    pub pipeline_id: String,
    pub config: DataPipelineConfig,
    pub datasets: Vec<Dataset>,
    pub validation: Option<ValidationResult>,
    pub batches: Vec<Batch>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineExecution {
    pub execution_id: String,
    pub pipeline_id: String,
    pub status: String,
    pub batch_count: usize,
    pub error: Option<String>,
}

fn definition() -> Arc<StateMachineDefinition<PipelineContext>> {
    Arc::new(
        StateMachineBuilder::new()
            .initial("initializing")
            .final_state("completed")
            .final_state("failed")
            .state("ingesting")
            .state("preprocessing")
            .state("validating")
            .state("augmenting")
            .state("batching")
            .state("caching")
            .transition("initializing", "START", "ingesting")
            .transition("ingesting", "INGESTED", "preprocessing")
            .transition("preprocessing", "PREPROCESSED", "validating")
            .transition("validating", "AUGMENT", "augmenting")
            .transition("validating", "SKIP_AUGMENT", "batching")
            .transition("augmenting", "AUGMENTED", "batching")
            .transition("batching", "BATCHED", "caching")
            .transition("caching", "CACHED", "completed")
            .transition("ingesting", "FAIL", "failed")
            .transition("preprocessing", "FAIL", "failed")
            .transition("validating", "FAIL", "failed")
            .transition("augmenting", "FAIL", "failed")
            .transition("batching", "FAIL", "failed")
            .build(),
    )
}

pub struct PipelineEngine {
    definitions: DashMap<String, DataPipelineConfig>,
    adapters: DashMap<String, Arc<dyn DataSourceAdapter>>,
    executions: DashMap<String, PipelineContext>,
    cache: DashMap<String, CacheEntry>,
    fsm_def: Arc<StateMachineDefinition<PipelineContext>>,
}

impl Default for PipelineEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineEngine {
    pub fn new() -> Self {
        Self {
            definitions: DashMap::new(),
            adapters: DashMap::new(),
            executions: DashMap::new(),
            cache: DashMap::new(),
            fsm_def: definition(),
        }
    }

    pub fn register_adapter(&self, source_type: impl Into<String>, adapter: Arc<dyn DataSourceAdapter>) {
        self.adapters.insert(source_type.into(), adapter);
    }

    pub fn create_pipeline(&self, id: impl Into<String>, def: DataPipelineConfig) -> Result<(), PipelineError> {
        if def.sources.is_empty() {
            return Err(PipelineError::NoSources);
        }
        self.definitions.insert(id.into(), def);
        Ok(())
    }

    #[instrument(skip(self), fields(pipeline_id = %id))]
    pub async fn execute_pipeline(&self, id: &str) -> Result<String, PipelineError> {
        let config = self
            .definitions
            .get(id)
            .map(|r| r.clone())
            .ok_or_else(|| PipelineError::NoAdapter(id.to_string()))?;

        let execution_id = Uuid::now_v7().to_string();
        let context = PipelineContext {
            execution_id: execution_id.clone(),
            pipeline_id: id.to_string(),
            config: config.clone(),
            datasets: Vec::new(),
            validation: None,
            batches: Vec::new(),
            error: None,
        };

        let mut interpreter = Interpreter::new(self.fsm_def.clone(), context);
        interpreter.start();
        interpreter.send("START");

        let result = self.run_phases(interpreter.context_mut()).await;

        match result {
            Ok(()) => {
                interpreter.send("INGESTED");
                interpreter.send("PREPROCESSED");
                if interpreter.context().config.augmentation.is_some() {
                    interpreter.send("AUGMENT");
                    interpreter.send("AUGMENTED");
                } else {
                    interpreter.send("SKIP_AUGMENT");
                }
                interpreter.send("BATCHED");
                interpreter.send("CACHED");
            }
            Err(err) => {
                interpreter.context_mut().error = Some(err.to_string());
                interpreter.send("FAIL");
            }
        }

        self.executions.insert(execution_id.clone(), interpreter.context().clone());
        Ok(execution_id)
    }

    async fn run_phases(&self, ctx: &mut PipelineContext) -> Result<(), PipelineError> {
        // 1. ingest
        for source in &ctx.config.sources {
            let adapter = self
                .adapters
                .get(&format!("{:?}", source.source_type))
                .ok_or_else(|| PipelineError::NoAdapter(format!("{:?}", source.source_type)))?;
            let dataset = adapter.read(source).await?;
            ctx.datasets.push(dataset);
        }

        // 2. preprocess
        let mut rows: Vec<Value> = ctx.datasets.iter().flat_map(|d| d.rows.clone()).collect();
        for step in &ctx.config.preprocessing {
            rows = apply_preprocess_step(step, rows);
        }

        // 3. validate
        let validation = validate_rows(&rows, &ctx.config.validation);
        if ctx.config.strict_validation && validation.failed_records > 0 {
            ctx.validation = Some(validation.clone());
            return Err(PipelineError::StrictValidationFailed(validation.failed_records));
        }
        ctx.validation = Some(validation);

        // 4. augment
        if let Some(aug) = &ctx.config.augmentation {
            rows = augment_rows(rows, aug);
        }

        // 5. batch
        if ctx.config.shuffle {
            rows.shuffle(&mut rand::thread_rng());
        }
        ctx.batches = batch_rows(rows, ctx.config.batch_size);

        // 6. cache (non-critical: a caching failure still completes, §4.5)
        if let Some(caching) = &ctx.config.caching {
            if caching.enabled {
                if let Err(e) = self.try_cache(&ctx.execution_id, &ctx.batches, caching) {
                    warn!(execution_id = %ctx.execution_id, error = %e, "caching failed, continuing as completed");
                }
            }
        }

        Ok(())
    }

    fn try_cache(&self, execution_id: &str, batches: &[Batch], caching: &CachingConfig) -> Result<(), String> {
        let serialized = serde_json::to_vec(batches).map_err(|e| e.to_string())?;
        if serialized.len() > caching.max_cache_size_bytes {
            return Err(format!(
                "serialized size {} exceeds max_cache_size_bytes {}",
                serialized.len(),
                caching.max_cache_size_bytes
            ));
        }
        self.cache.insert(
            execution_id.to_string(),
            CacheEntry {
                batches: batches.to_vec(),
                cached_at: Utc::now(),
            },
        );
        Ok(())
    }

    /// Evicts cache entries older than `retention_days`. Intended to be
    /// driven by a periodic sweep owned by the caller.
    pub fn evict_expired_cache(&self, retention_days: u32) {
        let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
        self.cache.retain(|_, entry| entry.cached_at > cutoff);
    }

    pub fn cancel(&self, execution_id: &str) -> Result<(), PipelineError> {
        self.executions
            .remove(execution_id)
            .map(|_| ())
            .ok_or_else(|| PipelineError::ExecutionNotFound(execution_id.to_string()))
    }

    pub fn get_execution(&self, execution_id: &str) -> Option<PipelineExecution> {
        self.executions.get(execution_id).map(|ctx| PipelineExecution {
            execution_id: ctx.execution_id.clone(),
            pipeline_id: ctx.pipeline_id.clone(),
            status: if ctx.error.is_some() { "failed".to_string() } else { "completed".to_string() },
            batch_count: ctx.batches.len(),
            error: ctx.error.clone(),
        })
    }

    pub fn cached_result(&self, execution_id: &str) -> Option<Vec<Batch>> {
        self.cache.get(execution_id).map(|e| e.batches.clone())
    }
}

fn apply_preprocess_step(step: &PreprocessStep, rows: Vec<Value>) -> Vec<Value> {
    match step {
        PreprocessStep::Normalize { fields } => normalize(rows, fields),
        PreprocessStep::Filter { predicates } => rows
            .into_iter()
            .filter(|row| predicates.iter().all(|p| matches_predicate(row, p)))
            .collect(),
        PreprocessStep::Transform { copy, computed } => rows
            .into_iter()
            .map(|mut row| {
                for (src, dest) in copy {
                    if let Some(value) = row.get(src).cloned() {
                        insert_field(&mut row, dest, value);
                    }
                }
                for (dest, expr) in computed {
                    let flat = flatten_row(&row);
                    let value = condition::evaluate_value(expr, &flat);
                    insert_field(&mut row, dest, value);
                }
                row
            })
            .collect(),
        PreprocessStep::Clean { remove_nulls, trim_strings } => rows
            .into_iter()
            .map(|row| clean_row(row, *remove_nulls, *trim_strings))
            .collect(),
    }
}

fn flatten_row(row: &Value) -> HashMap<String, Value> {
    match row {
        Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        _ => HashMap::new(),
    }
}

fn insert_field(row: &mut Value, field: &str, value: Value) {
    if let Value::Object(map) = row {
        map.insert(field.to_string(), value);
    }
}

fn normalize(rows: Vec<Value>, fields: &[String]) -> Vec<Value> {
    let mut minmax: HashMap<&str, (f64, f64)> = HashMap::new();
    for field in fields {
        let values: Vec<f64> = rows.iter().filter_map(|r| r.get(field)).filter_map(Value::as_f64).collect();
        if values.is_empty() {
            continue;
        }
        let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        minmax.insert(field.as_str(), (min, max));
    }

    rows.into_iter()
        .map(|mut row| {
            for field in fields {
                if let Some((min, max)) = minmax.get(field.as_str()) {
                    if let Some(v) = row.get(field).and_then(Value::as_f64) {
                        let normalized = if (max - min).abs() < f64::EPSILON { 0.0 } else { (v - min) / (max - min) };
                        insert_field(&mut row, field, serde_json::json!(normalized));
                    }
                }
            }
            row
        })
        .collect()
}

fn matches_predicate(row: &Value, predicate: &FilterPredicate) -> bool {
    let Some(actual) = row.get(&predicate.field) else {
        return false;
    };
    match predicate.operator {
        FilterOp::Eq => actual == &predicate.value,
        FilterOp::Ne => actual != &predicate.value,
        FilterOp::Gt => compare_numeric(actual, &predicate.value, |a, b| a > b),
        FilterOp::Gte => compare_numeric(actual, &predicate.value, |a, b| a >= b),
        FilterOp::Lt => compare_numeric(actual, &predicate.value, |a, b| a < b),
        FilterOp::Lte => compare_numeric(actual, &predicate.value, |a, b| a <= b),
        FilterOp::Contains => actual
            .as_str()
            .zip(predicate.value.as_str())
            .map(|(a, b)| a.contains(b))
            .unwrap_or(false),
    }
}

fn compare_numeric(a: &Value, b: &Value, op: impl Fn(f64, f64) -> bool) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => op(a, b),
        _ => false,
    }
}

fn clean_row(row: Value, remove_nulls: bool, trim_strings: bool) -> Value {
    let Value::Object(map) = row else {
        return row;
    };
    let cleaned = map
        .into_iter()
        .filter(|(_, v)| !(remove_nulls && v.is_null()))
        .map(|(k, v)| {
            let v = if trim_strings {
                match v {
                    Value::String(s) => Value::String(s.trim().to_string()),
                    other => other,
                }
            } else {
                v
            };
            (k, v)
        })
        .collect();
    Value::Object(cleaned)
}

fn validate_rows(rows: &[Value], rules: &[ValidationRule]) -> ValidationResult {
    let mut record_errors = Vec::new();
    for (i, row) in rows.iter().enumerate() {
        let mut errors = Vec::new();
        for rule in rules {
            if let Some(message) = validate_rule(row, rule) {
                errors.push(message);
            }
        }
        if !errors.is_empty() {
            record_errors.push((i, errors));
        }
    }

    ValidationResult {
        failed_records: record_errors.len(),
        total_records: rows.len(),
        record_errors,
    }
}

fn validate_rule(row: &Value, rule: &ValidationRule) -> Option<String> {
    match rule {
        ValidationRule::Required { field } => match row.get(field) {
            Some(v) if !v.is_null() => None,
            _ => Some(format!("missing required field '{field}'")),
        },
        ValidationRule::Range { field, min, max } => match row.get(field).and_then(Value::as_f64) {
            Some(v) if v >= *min && v <= *max => None,
            Some(v) => Some(format!("field '{field}' value {v} outside range [{min}, {max}]")),
            None => Some(format!("field '{field}' is not numeric")),
        },
        ValidationRule::Pattern { field, pattern } => {
            let Ok(re) = Regex::new(pattern) else {
                return Some(format!("invalid pattern for field '{field}'"));
            };
            match row.get(field).and_then(Value::as_str) {
                Some(v) if re.is_match(v) => None,
                _ => Some(format!("field '{field}' does not match pattern")),
            }
        }
    }
}

fn augment_rows(mut rows: Vec<Value>, config: &AugmentationConfig) -> Vec<Value> {
    if let Some(factor) = config.duplicate_factor {
        let original = rows.clone();
        for _ in 1..factor.max(1) {
            rows.extend(original.clone());
        }
    }

    if let Some(noise) = &config.noise {
        let mut rng = rand::thread_rng();
        rows = rows
            .into_iter()
            .map(|mut row| {
                for field in &noise.fields {
                    if let Some(v) = row.get(field).and_then(Value::as_f64) {
                        let delta = rng.gen_range(-noise.level..=noise.level);
                        insert_field(&mut row, field, serde_json::json!(v + v * delta));
                    }
                }
                row
            })
            .collect();
    }

    if let Some(count) = config.synthetic_count {
        if !rows.is_empty() {
            let mut rng = rand::thread_rng();
            for _ in 0..count {
                if let Some(template) = rows.choose(&mut rng) {
                    rows.push(template.clone());
                }
            }
        }
    }

    rows
}

fn batch_rows(rows: Vec<Value>, batch_size: usize) -> Vec<Batch> {
    let batch_size = batch_size.max(1);
    rows.chunks(batch_size)
        .enumerate()
        .map(|(index, chunk)| {
            let start = index * batch_size;
            Batch {
                id: Uuid::now_v7().to_string(),
                index,
                data: chunk.to_vec(),
                size: chunk.len(),
                start,
                end: start + chunk.len(),
            }
        })
        .collect()
}
