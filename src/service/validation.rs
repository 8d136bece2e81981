//! Field validation from declared column rules.

use crate::config::ValidationRule;
use crate::error::GraphError;
use crate::graph::{ColumnSpec, MutationSpec, Pattern};
use serde_json::Value;

pub struct FieldValidator;

impl FieldValidator {
    /// Validate every assigned field and every edge-scoped field against its column's rules.
    /// Unknown columns are left to the compiler, which reports them with full context.
    pub fn validate(m: &MutationSpec) -> Result<(), GraphError> {
        let node = &m.node;
        for f in &node.fields {
            if let Some(col) = node.column(&f.column) {
                validate_field(&node.entity, col, &f.value)?;
            }
        }
        for em in &m.edges {
            let Some(edge) = node.edge(&em.edge) else {
                continue;
            };
            for f in &em.fields {
                if let Some(col) = edge.join_fields().iter().find(|c| c.name == f.column) {
                    validate_field(&node.entity, col, &f.value)?;
                }
            }
        }
        Ok(())
    }
}

pub fn validate_field(entity: &str, col: &ColumnSpec, v: &Value) -> Result<(), GraphError> {
    if v.is_null() {
        return Ok(());
    }
    check_rule(&col.name, v, &col.validation, col.pattern.as_ref()).map_err(|msg| GraphError::validation(entity, msg))
}

fn check_rule(col: &str, v: &Value, rule: &ValidationRule, pattern: Option<&Pattern>) -> Result<(), String> {
    if let Some(format) = &rule.format {
        validate_format(col, v, format)?;
    }
    if let Some(max) = rule.max_length {
        if let Some(s) = v.as_str() {
            if s.chars().count() > max as usize {
                return Err(format!("{} must be at most {} characters", col, max));
            }
        }
    }
    if let Some(min) = rule.min_length {
        if let Some(s) = v.as_str() {
            if s.chars().count() < min as usize {
                return Err(format!("{} must be at least {} characters", col, min));
            }
        }
    }
    if let Some(re) = pattern {
        if let Some(s) = v.as_str() {
            if !re.is_match(s) {
                return Err(format!("{} does not match required pattern", col));
            }
        }
    }
    if let Some(ref allowed) = rule.allowed {
        if !allowed.iter().any(|a| value_eq(v, a)) {
            return Err(format!(
                "{} must be one of: {:?}",
                col,
                allowed.iter().take(5).collect::<Vec<_>>()
            ));
        }
    }
    if let Some(min) = rule.minimum {
        if let Some(n) = v.as_f64() {
            if n < min {
                return Err(format!("{} must be at least {}", col, min));
            }
        }
    }
    if let Some(max) = rule.maximum {
        if let Some(n) = v.as_f64() {
            if n > max {
                return Err(format!("{} must be at most {}", col, max));
            }
        }
    }
    Ok(())
}

fn value_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::String(s), Value::String(t)) => s == t,
        (Value::Number(n), Value::Number(m)) => n.as_f64() == m.as_f64(),
        _ => a == b,
    }
}

fn validate_format(col: &str, v: &Value, format: &str) -> Result<(), String> {
    let Some(s) = v.as_str() else {
        return Ok(());
    };
    match format.to_lowercase().as_str() {
        "email" if !s.contains('@') || s.len() < 3 => Err(format!("{} must be a valid email", col)),
        "uuid" if uuid::Uuid::parse_str(s).is_err() => Err(format!("{} must be a valid UUID", col)),
        _ => Ok(()),
    }
}
