//! Sandboxed condition/expression evaluator (§4.8, §4.5, §9 design note).
//!
//! Expressions reference `variables` and prior-step `outputs` by (dotted)
//! name without touching the host environment. This never shells out to a
//! language `eval`: numeric expressions are parsed and evaluated by
//! `fasteval` against a flattened, read-only snapshot of the execution
//! context; a handful of string equality/inequality comparisons
//! (`field == "literal"`) are recognized by a small regex since `fasteval`
//! is numeric-only. `evaluate` collapses the result to a boolean for branch
//! conditions; `evaluate_value` instead keeps the produced value (number or
//! bool) for data-pipeline computed fields. Anything that fails to parse,
//! references an unknown name, or isn't one of these two shapes evaluates to
//! `false`, matching "an expression that fails to parse or throws evaluates
//! to false".

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

fn string_equality_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"^\s*([A-Za-z_][A-Za-z0-9_.]*)\s*(==|!=)\s*"([^"]*)"\s*$"#).unwrap())
}

fn bool_literal_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\btrue\b|\bfalse\b").unwrap())
}

fn identifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_.]*").unwrap())
}

/// Flattens nested JSON objects into dotted-path entries, e.g.
/// `{"outputs": {"step1": {"ok": true}}}` -> `"outputs.step1.ok" -> true`.
/// Top-level `variables` keys are additionally exposed unprefixed so a
/// condition can say `retryCount > 2` instead of `variables.retryCount > 2`.
pub fn flatten_context(variables: &HashMap<String, Value>, outputs: &HashMap<String, Value>) -> HashMap<String, Value> {
    let mut flat = HashMap::new();
    for (k, v) in variables {
        flatten_into(&mut flat, k, v);
    }
    for (k, v) in outputs {
        flatten_into(&mut flat, &format!("outputs.{k}"), v);
    }
    flat
}

fn flatten_into(flat: &mut HashMap<String, Value>, prefix: &str, value: &Value) {
    flat.insert(prefix.to_string(), value.clone());
    if let Value::Object(map) = value {
        for (k, v) in map {
            flatten_into(flat, &format!("{prefix}.{k}"), v);
        }
    }
}

/// Evaluates a condition expression to a boolean. Never panics; any failure
/// mode (unparseable expression, unknown identifier, non-boolean result)
/// yields `false`.
pub fn evaluate(expr: &str, context: &HashMap<String, Value>) -> bool {
    if let Some(captures) = string_equality_re().captures(expr) {
        let field = &captures[1];
        let op = &captures[2];
        let literal = &captures[3];
        let actual = context.get(field).and_then(Value::as_str).unwrap_or_default();
        return match op {
            "==" => actual == literal,
            _ => actual != literal,
        };
    }

    evaluate_number(expr, context).map(|n| n != 0.0).unwrap_or(false)
}

/// Evaluates an expression to its value as produced: a string-equality
/// comparison yields a bool, anything else yields the raw `fasteval`
/// numeric result (so `price * qty` stores a number, not a forced bool).
/// Falls back to `Value::Bool(false)` on the same failure modes `evaluate`
/// treats as `false`.
pub fn evaluate_value(expr: &str, context: &HashMap<String, Value>) -> Value {
    if let Some(captures) = string_equality_re().captures(expr) {
        let field = &captures[1];
        let op = &captures[2];
        let literal = &captures[3];
        let actual = context.get(field).and_then(Value::as_str).unwrap_or_default();
        return Value::Bool(match op {
            "==" => actual == literal,
            _ => actual != literal,
        });
    }

    match evaluate_number(expr, context) {
        Some(n) => serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::Bool(false)),
        None => Value::Bool(false),
    }
}

fn evaluate_number(expr: &str, context: &HashMap<String, Value>) -> Option<f64> {
    let with_bools = bool_literal_re().replace_all(expr, |caps: &regex::Captures| {
        if &caps[0] == "true" { "1" } else { "0" }
    });

    let rewritten = identifier_re().replace_all(&with_bools, |caps: &regex::Captures| caps[0].replace('.', "__"));

    let mut lookup: HashMap<String, f64> = HashMap::new();
    for cap in identifier_re().find_iter(&with_bools) {
        let name = cap.as_str();
        if let Some(value) = context.get(name).and_then(json_to_f64) {
            lookup.insert(name.replace('.', "__"), value);
        }
    }

    let mut namespace = move |name: &str, _args: Vec<f64>| -> Option<f64> { lookup.get(name).copied() };

    fasteval::ez_eval(&rewritten, &mut namespace).ok()
}

fn json_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn numeric_comparison() {
        let context = ctx(&[("outputs.score", serde_json::json!(0.8))]);
        assert!(evaluate("outputs.score > 0.5", &context));
        assert!(!evaluate("outputs.score > 0.9", &context));
    }

    #[test]
    fn string_equality() {
        let context = ctx(&[("outputs.status", serde_json::json!("approved"))]);
        assert!(evaluate(r#"outputs.status == "approved""#, &context));
        assert!(!evaluate(r#"outputs.status == "rejected""#, &context));
    }

    #[test]
    fn boolean_literal_and_logic() {
        let context = ctx(&[("retryCount", serde_json::json!(2))]);
        assert!(evaluate("retryCount > 1 && true", &context));
        assert!(!evaluate("retryCount > 1 && false", &context));
    }

    #[test]
    fn unparseable_expression_is_false() {
        let context = ctx(&[]);
        assert!(!evaluate("((( not an expression", &context));
    }

    #[test]
    fn unknown_identifier_is_false() {
        let context = ctx(&[]);
        assert!(!evaluate("missingField > 1", &context));
    }

    #[test]
    fn flatten_exposes_nested_outputs() {
        let variables = HashMap::new();
        let mut outputs = HashMap::new();
        outputs.insert("step1".to_string(), serde_json::json!({"ok": true, "score": 0.9}));
        let flat = flatten_context(&variables, &outputs);
        assert_eq!(flat.get("outputs.step1.score"), Some(&serde_json::json!(0.9)));
    }
}
