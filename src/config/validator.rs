//! Schema validation: names, references between entities, and edge consistency.

use crate::config::{DefaultConfig, EdgeConfig, EntityConfig, FieldConfig, SchemaConfig};
use crate::error::ConfigError;
use crate::graph::{FieldType, Relation};
use std::collections::{HashMap, HashSet};

fn invalid_edge(entity: &str, edge: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidEdge {
        entity: entity.to_string(),
        edge: edge.to_string(),
        reason: reason.into(),
    }
}

fn validate_fields(owner: &str, fields: &[FieldConfig], names: &mut HashSet<String>) -> Result<(), ConfigError> {
    for f in fields {
        if !names.insert(f.name.clone()) {
            return Err(ConfigError::Duplicate {
                kind: "field",
                name: format!("{}.{}", owner, f.name),
            });
        }
        if f.type_ == FieldType::Enum && f.values.is_empty() {
            return Err(ConfigError::Validation(format!("{}.{}: enum field needs values", owner, f.name)));
        }
        for d in [&f.default, &f.update_default].into_iter().flatten() {
            if let DefaultConfig::Expression { expression } = d {
                if !matches!(expression.as_str(), "now" | "uuid") {
                    return Err(ConfigError::Validation(format!(
                        "{}.{}: unknown default expression '{}'",
                        owner, f.name, expression
                    )));
                }
            }
        }
        if let Some(p) = &f.validation.pattern {
            regex::Regex::new(p)
                .map_err(|e| ConfigError::Validation(format!("{}.{}: invalid pattern: {}", owner, f.name, e)))?;
        }
    }
    Ok(())
}

fn validate_edge(e: &EntityConfig, edge: &EdgeConfig, entities: &HashMap<&str, &EntityConfig>) -> Result<(), ConfigError> {
    let target = entities.get(edge.target.as_str()).ok_or_else(|| ConfigError::MissingReference {
        kind: "entity",
        id: edge.target.clone(),
    })?;
    match &edge.ref_ {
        Some(r) => {
            let owning = target
                .edges
                .iter()
                .find(|o| &o.name == r)
                .ok_or_else(|| invalid_edge(&e.name, &edge.name, format!("{} has no edge '{}'", target.name, r)))?;
            if owning.ref_.is_some() {
                return Err(invalid_edge(&e.name, &edge.name, format!("{}.{} is itself an inverse edge", target.name, r)));
            }
            if owning.target != e.name {
                return Err(invalid_edge(
                    &e.name,
                    &edge.name,
                    format!("{}.{} points at {}, not {}", target.name, r, owning.target, e.name),
                ));
            }
            if edge.relation.is_some() || edge.column.is_some() || edge.join_table.is_some() || edge.columns.is_some() {
                return Err(invalid_edge(&e.name, &edge.name, "inverse edges share the owning edge's relation and linkage"));
            }
            if !edge.fields.is_empty() {
                return Err(invalid_edge(&e.name, &edge.name, "edge fields are declared on the owning edge"));
            }
        }
        None => {
            let rel = edge
                .relation
                .ok_or_else(|| invalid_edge(&e.name, &edge.name, "owning edges need a relation"))?;
            match rel {
                Relation::M2M => {
                    if edge.column.is_some() {
                        return Err(invalid_edge(&e.name, &edge.name, "many-to-many edges use a join table, not a column"));
                    }
                    if edge.required {
                        return Err(invalid_edge(&e.name, &edge.name, "many-to-many edges cannot be required"));
                    }
                    if let Some([a, b]) = &edge.columns {
                        if a == b {
                            return Err(invalid_edge(&e.name, &edge.name, "join columns must differ"));
                        }
                    }
                    let mut names = HashSet::new();
                    validate_fields(&format!("{}.{}", e.name, edge.name), &edge.fields, &mut names)?;
                }
                Relation::O2O | Relation::O2M => {
                    if edge.join_table.is_some() || edge.columns.is_some() || !edge.fields.is_empty() {
                        return Err(invalid_edge(&e.name, &edge.name, "only many-to-many edges have a join table"));
                    }
                }
            }
        }
    }
    Ok(())
}

pub fn validate(config: &SchemaConfig) -> Result<(), ConfigError> {
    let mut entities = HashMap::new();
    let mut tables = HashSet::new();
    for e in &config.entities {
        if entities.insert(e.name.as_str(), e).is_some() {
            return Err(ConfigError::Duplicate {
                kind: "entity",
                name: e.name.clone(),
            });
        }
        if let Some(t) = &e.table {
            if !tables.insert(t.as_str()) {
                return Err(ConfigError::Duplicate {
                    kind: "table",
                    name: t.clone(),
                });
            }
        }
    }

    for e in &config.entities {
        let mut names = HashSet::from([e.id.column.clone()]);
        validate_fields(&e.name, &e.fields, &mut names)?;
        let mut edge_names = HashSet::new();
        for edge in &e.edges {
            if !edge_names.insert(edge.name.as_str()) {
                return Err(ConfigError::Duplicate {
                    kind: "edge",
                    name: format!("{}.{}", e.name, edge.name),
                });
            }
            validate_edge(e, edge, &entities)?;
        }
        let mut hooks = HashSet::new();
        for h in &e.hooks {
            if !hooks.insert(h.as_str()) {
                return Err(ConfigError::Duplicate {
                    kind: "hook",
                    name: format!("{}.{}", e.name, h),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_schema_str;

    #[test]
    fn missing_edge_target_is_reported() {
        let err = load_schema_str(
            r#"{"entities": [{"name": "User", "edges": [{"name": "pets", "target": "Pet", "relation": "o2m"}]}]}"#,
        )
        .and_then(|c| validate(&c).map(|_| c))
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingReference { kind: "entity", .. }));
    }

    #[test]
    fn inverse_must_point_back() {
        let raw = r#"{"entities": [
            {"name": "User", "edges": [{"name": "pets", "target": "Pet", "relation": "o2m"}]},
            {"name": "Group"},
            {"name": "Pet", "edges": [{"name": "owner", "target": "Group", "ref": "pets"}]}
        ]}"#;
        let err = validate(&load_schema_str(raw).unwrap()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEdge { .. }));
    }

    #[test]
    fn duplicate_field_names_are_rejected() {
        let raw = r#"{"entities": [{"name": "User", "fields": [
            {"name": "name", "type": "string"},
            {"name": "name", "type": "string"}
        ]}]}"#;
        let err = validate(&load_schema_str(raw).unwrap()).unwrap_err();
        assert!(matches!(err, ConfigError::Duplicate { kind: "field", .. }));
    }
}
