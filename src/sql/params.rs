//! Convert serde_json::Value plus a declared storage type into a typed bind argument.

use crate::graph::FieldType;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// A value that can be bound to a statement. Null keeps its storage type so typed stores bind it correctly.
#[derive(Clone, Debug, PartialEq)]
pub enum Arg {
    Null(FieldType),
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Uuid(uuid::Uuid),
    Time(DateTime<Utc>),
    Json(Value),
}

impl Arg {
    /// Coerce a JSON value into the declared storage type. Err carries a human-readable reason.
    pub fn from_json(v: &Value, ty: FieldType) -> Result<Self, String> {
        if v.is_null() {
            return Ok(Arg::Null(ty));
        }
        let mismatch = || format!("expected {}, got {}", ty, type_name_of_json(v));
        Ok(match ty {
            FieldType::Bool => Arg::Bool(v.as_bool().ok_or_else(mismatch)?),
            FieldType::Int => match v {
                Value::Number(n) => Arg::Int(n.as_i64().ok_or_else(mismatch)?),
                Value::String(s) => Arg::Int(s.parse().map_err(|_| mismatch())?),
                _ => return Err(mismatch()),
            },
            FieldType::Float => Arg::Float(v.as_f64().ok_or_else(mismatch)?),
            FieldType::String | FieldType::Enum => Arg::Text(v.as_str().ok_or_else(mismatch)?.to_string()),
            FieldType::Uuid => {
                let s = v.as_str().ok_or_else(mismatch)?;
                Arg::Uuid(uuid::Uuid::parse_str(s).map_err(|_| format!("invalid uuid '{}'", s))?)
            }
            FieldType::Time => {
                let s = v.as_str().ok_or_else(mismatch)?;
                let t = DateTime::parse_from_rfc3339(s).map_err(|_| format!("invalid RFC 3339 time '{}'", s))?;
                Arg::Time(t.with_timezone(&Utc))
            }
            FieldType::Json => Arg::Json(v.clone()),
        })
    }

    /// Best-effort typing when no column type is known.
    pub fn infer(v: &Value) -> Self {
        match v {
            Value::Null => Arg::Null(FieldType::String),
            Value::Bool(b) => Arg::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Arg::Int(i),
                None => Arg::Float(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => Arg::Text(s.clone()),
            Value::Array(_) | Value::Object(_) => Arg::Json(v.clone()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Arg::Null(_))
    }
}

fn type_name_of_json(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
