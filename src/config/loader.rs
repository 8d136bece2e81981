//! Load schema config from JSON and resolve it into node templates.

use crate::case::{table_name, to_snake_case};
use crate::config::resolved::{ResolvedEntity, ResolvedSchema};
use crate::config::types::*;
use crate::config::validate;
use crate::error::ConfigError;
use crate::graph::{
    ColumnSpec, DefaultValue, EdgeSpec, EdgeTarget, FieldType, IdSpec, Linkage, NodeSpec, OnDelete, Relation,
};
use std::collections::HashMap;
use std::path::Path;

pub fn load_schema_str(raw: &str) -> Result<SchemaConfig, ConfigError> {
    serde_json::from_str(raw).map_err(|e| ConfigError::Load(format!("schema json: {}", e)))
}

pub fn load_schema_file(path: impl AsRef<Path>) -> Result<SchemaConfig, ConfigError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Load(format!("read {}: {}", path.display(), e)))?;
    load_schema_str(&raw)
}

/// Parse, validate and resolve in one step.
pub fn load_resolved(raw: &str) -> Result<ResolvedSchema, ConfigError> {
    resolve(&load_schema_str(raw)?)
}

fn default_value(d: &DefaultConfig) -> DefaultValue {
    match d {
        DefaultConfig::Expression { expression } if expression == "uuid" => DefaultValue::Uuid,
        DefaultConfig::Expression { .. } => DefaultValue::Now,
        DefaultConfig::Literal(v) => DefaultValue::Literal(v.clone()),
    }
}

fn column_spec(owner: &str, f: &FieldConfig) -> Result<ColumnSpec, ConfigError> {
    let mut validation = f.validation.clone();
    if f.type_ == FieldType::Enum && validation.allowed.is_none() {
        validation.allowed = Some(f.values.iter().cloned().map(Into::into).collect());
    }
    let mut col = ColumnSpec::new(f.name.clone(), f.type_)
        .with_validation(validation)
        .map_err(|e| ConfigError::Validation(format!("{}.{}: invalid pattern: {}", owner, f.name, e)))?;
    col.optional = f.optional;
    col.unique = f.unique;
    col.immutable = f.immutable;
    col.default = f.default.as_ref().map(default_value);
    col.update_default = f.update_default.as_ref().map(default_value);
    Ok(col)
}

/// Relation and linkage of an owning edge, seen from its owner.
fn owning_linkage(
    owner: &EntityConfig,
    edge: &EdgeConfig,
    target: &EntityConfig,
    inverse: Option<&EdgeConfig>,
) -> Result<(Relation, Linkage), ConfigError> {
    let rel = edge.relation.ok_or_else(|| ConfigError::InvalidEdge {
        entity: owner.name.clone(),
        edge: edge.name.clone(),
        reason: "owning edges need a relation".into(),
    })?;
    let owner_snake = to_snake_case(&owner.name);
    let linkage = match rel {
        Relation::M2M => {
            let self_ref = owner.name == target.name;
            let table = edge.join_table.clone().unwrap_or_else(|| {
                if self_ref {
                    format!("{}_{}", owner_snake, edge.name)
                } else {
                    format!("{}_{}", owner_snake, table_name(&target.name))
                }
            });
            let columns = edge.columns.clone().unwrap_or_else(|| {
                let second = if self_ref {
                    format!("{}_id", edge.name)
                } else {
                    format!("{}_id", to_snake_case(&target.name))
                };
                [format!("{}_id", owner_snake), second]
            });
            Linkage::JoinTable {
                table,
                columns,
                fields: edge
                    .fields
                    .iter()
                    .map(|f| column_spec(&owner.name, f))
                    .collect::<Result<_, _>>()?,
            }
        }
        Relation::O2O | Relation::O2M => Linkage::ForeignKey {
            column: edge
                .column
                .clone()
                .unwrap_or_else(|| format!("{}_{}", owner_snake, edge.name)),
            nullable: !inverse.is_some_and(|i| i.required),
        },
    };
    Ok((rel, linkage))
}

fn default_on_delete(linkage: &Linkage) -> OnDelete {
    match linkage {
        Linkage::ForeignKey { nullable: true, .. } => OnDelete::SetNull,
        _ => OnDelete::Restrict,
    }
}

/// Build the resolved schema (validates first).
pub fn resolve(config: &SchemaConfig) -> Result<ResolvedSchema, ConfigError> {
    validate(config)?;
    let by_name: HashMap<&str, &EntityConfig> = config.entities.iter().map(|e| (e.name.as_str(), e)).collect();
    let table_of = |e: &EntityConfig| e.table.clone().unwrap_or_else(|| table_name(&e.name));
    let lookup = |name: &str| {
        by_name.get(name).copied().ok_or_else(|| ConfigError::MissingReference {
            kind: "entity",
            id: name.to_string(),
        })
    };

    let mut entities = Vec::with_capacity(config.entities.len());
    for e in &config.entities {
        let mut node = NodeSpec::new(
            e.name.clone(),
            table_of(e),
            IdSpec {
                column: e.id.column.clone(),
                ty: e.id.type_,
                generation: e.id.generation,
            },
        );
        node.columns = e.fields.iter().map(|f| column_spec(&e.name, f)).collect::<Result<_, _>>()?;

        for edge in &e.edges {
            let target = lookup(&edge.target)?;
            let (rel, linkage, inverse) = match &edge.ref_ {
                None => {
                    let back = target
                        .edges
                        .iter()
                        .find(|b| b.target == e.name && b.ref_.as_deref() == Some(edge.name.as_str()));
                    let (rel, linkage) = owning_linkage(e, edge, target, back)?;
                    (rel, linkage, false)
                }
                Some(r) => {
                    let owning = target.edges.iter().find(|o| &o.name == r).ok_or_else(|| ConfigError::InvalidEdge {
                        entity: e.name.clone(),
                        edge: edge.name.clone(),
                        reason: format!("{} has no edge '{}'", target.name, r),
                    })?;
                    let (rel, linkage) = owning_linkage(target, owning, e, Some(edge))?;
                    (rel, linkage, true)
                }
            };
            let on_delete = edge.on_delete.unwrap_or_else(|| default_on_delete(&linkage));
            node.edges.push(EdgeSpec {
                name: edge.name.clone(),
                rel,
                inverse,
                target: EdgeTarget {
                    entity: target.name.clone(),
                    table: table_of(target),
                    id_column: target.id.column.clone(),
                    id_type: target.id.type_,
                },
                linkage,
                required: edge.required,
                on_delete,
            });
        }
        entities.push(ResolvedEntity {
            name: e.name.clone(),
            node,
            hooks: e.hooks.clone(),
        });
    }
    tracing::debug!(entities = entities.len(), "schema resolved");
    Ok(ResolvedSchema::new(entities))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMA: &str = r#"{
        "entities": [
            {
                "name": "User",
                "fields": [
                    {"name": "name", "type": "string"},
                    {"name": "created_at", "type": "time", "default": {"expression": "now"}, "immutable": true}
                ],
                "edges": [
                    {"name": "pets", "target": "Pet", "relation": "o2m"},
                    {"name": "groups", "target": "Group", "relation": "m2m",
                     "fields": [{"name": "joined_at", "type": "time", "default": {"expression": "now"}}]},
                    {"name": "friends", "target": "User", "relation": "m2m"}
                ]
            },
            {
                "name": "Pet",
                "fields": [{"name": "name", "type": "string"}],
                "edges": [{"name": "owner", "target": "User", "ref": "pets", "required": true}]
            },
            {
                "name": "Group",
                "id": {"type": "uuid", "generation": "uuid"},
                "edges": [{"name": "users", "target": "User", "ref": "groups"}]
            }
        ]
    }"#;

    #[test]
    fn naming_conventions() {
        let schema = load_resolved(SCHEMA).unwrap();
        let user = schema.node("User").unwrap();
        assert_eq!(user.table, "users");

        let pets = user.edge("pets").unwrap();
        assert!(!pets.fk_on_self());
        assert_eq!(pets.fk_column(), Some("user_pets"));
        assert!(!pets.fk_nullable());
        assert_eq!(pets.on_delete, OnDelete::Restrict);

        let groups = user.edge("groups").unwrap();
        assert_eq!(groups.join(), Some(("user_groups", "user_id", "group_id")));
        assert_eq!(groups.join_fields()[0].default, Some(DefaultValue::Now));

        let friends = user.edge("friends").unwrap();
        assert_eq!(friends.join(), Some(("user_friends", "user_id", "friends_id")));
    }

    #[test]
    fn inverse_edges_share_linkage() {
        let schema = load_resolved(SCHEMA).unwrap();
        let owner = schema.node("Pet").unwrap().edge("owner").cloned().unwrap();
        assert!(owner.inverse && owner.fk_on_self());
        assert_eq!(owner.fk_column(), Some("user_pets"));
        assert_eq!(owner.target.table, "users");

        let group = schema.node("Group").unwrap();
        assert_eq!(group.id.ty, FieldType::Uuid);
        assert_eq!(group.edge("users").unwrap().join(), Some(("user_groups", "group_id", "user_id")));
    }

    #[test]
    fn patterns_are_compiled_at_resolve() {
        let schema = load_resolved(
            r#"{"entities": [{"name": "Tag", "fields": [
                {"name": "slug", "type": "string", "validation": {"pattern": "^[a-z-]+$"}}
            ]}]}"#,
        )
        .unwrap();
        let tag = schema.node("Tag").unwrap();
        let slug = tag.column("slug").unwrap();
        assert!(slug.pattern.as_ref().is_some_and(|p| p.is_match("hello-world")));

        let err = load_resolved(
            r#"{"entities": [{"name": "Tag", "fields": [
                {"name": "slug", "type": "string", "validation": {"pattern": "(["}}
            ]}]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Tag.slug: invalid pattern"), "{}", err);
    }

    #[test]
    fn unknown_entity_is_a_validation_error() {
        let schema = load_resolved(SCHEMA).unwrap();
        assert!(schema.node("Nope").is_err());
    }
}
