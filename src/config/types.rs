//! Raw schema config types matching the JSON schema file.

use crate::graph::{FieldType, IdGeneration, OnDelete, Relation};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SchemaConfig {
    #[serde(default)]
    pub entities: Vec<EntityConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EntityConfig {
    pub name: String,
    /// Defaults to the snake_case plural of `name`.
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub id: IdConfig,
    #[serde(default)]
    pub fields: Vec<FieldConfig>,
    #[serde(default)]
    pub edges: Vec<EdgeConfig>,
    /// Named interceptor slots, bound with `EngineBuilder::register_interceptor`.
    #[serde(default)]
    pub hooks: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IdConfig {
    #[serde(default = "default_id_column")]
    pub column: String,
    #[serde(rename = "type", default = "default_id_type")]
    pub type_: FieldType,
    #[serde(default)]
    pub generation: IdGeneration,
}

impl Default for IdConfig {
    fn default() -> Self {
        IdConfig {
            column: default_id_column(),
            type_: default_id_type(),
            generation: IdGeneration::default(),
        }
    }
}

fn default_id_column() -> String {
    "id".into()
}

fn default_id_type() -> FieldType {
    FieldType::Int
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FieldConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub type_: FieldType,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub immutable: bool,
    #[serde(default)]
    pub default: Option<DefaultConfig>,
    #[serde(default)]
    pub update_default: Option<DefaultConfig>,
    /// Allowed values for `enum` fields.
    #[serde(default)]
    pub values: Vec<String>,
    #[serde(default)]
    pub validation: ValidationRule,
}

/// A bare JSON value is a literal; `{ "expression": "now" | "uuid" }` is computed per row.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum DefaultConfig {
    Literal(Value),
    Expression { expression: String },
}

impl<'de> Deserialize<'de> for DefaultConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let v = Value::deserialize(deserializer)?;
        match v {
            Value::Object(mut obj) => {
                if let Some(Value::String(s)) = obj.remove("expression") {
                    return Ok(DefaultConfig::Expression { expression: s });
                }
                if let Some(lit) = obj.remove("value").or_else(|| obj.remove("literal")) {
                    return Ok(DefaultConfig::Literal(lit));
                }
                Err(serde::de::Error::custom(format!(
                    "field default must be a value, {{ \"expression\": \"...\" }}, or {{ \"value\": ... }}; got object with keys: {:?}",
                    obj.keys().collect::<Vec<_>>()
                )))
            }
            other => Ok(DefaultConfig::Literal(other)),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EdgeConfig {
    pub name: String,
    /// Target entity name.
    pub target: String,
    /// Relation of the owning side; inverse edges take it from the edge they reference.
    #[serde(default)]
    pub relation: Option<Relation>,
    /// Makes this an inverse edge of `target`'s edge with this name.
    #[serde(default, rename = "ref")]
    pub ref_: Option<String>,
    #[serde(default)]
    pub column: Option<String>,
    #[serde(default)]
    pub join_table: Option<String>,
    #[serde(default)]
    pub columns: Option<[String; 2]>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub on_delete: Option<OnDelete>,
    /// Edge-scoped columns stored on the join table.
    #[serde(default)]
    pub fields: Vec<FieldConfig>,
}

/// Per-field value rules checked before any store I/O.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationRule {
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub max_length: Option<u32>,
    #[serde(default)]
    pub min_length: Option<u32>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub allowed: Option<Vec<Value>>,
    #[serde(default)]
    pub minimum: Option<f64>,
    #[serde(default)]
    pub maximum: Option<f64>,
}

impl ValidationRule {
    pub fn is_empty(&self) -> bool {
        *self == ValidationRule::default()
    }
}
