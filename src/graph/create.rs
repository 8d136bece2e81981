use super::{arg, dedup, key, normalize, EdgeMutation, EdgeSpec, IdGeneration, MutationSpec, Node, NodeSpec, Relation};
use crate::context::Context;
use crate::driver::{self, Tx};
use crate::error::{ConstraintKind, GraphError};
use crate::predicate::Predicate;
use crate::sql::{Arg, Cond, InsertBuilder, UpdateBuilder};
use serde_json::{Map, Value};

/// Everything decided before the first statement runs.
struct Plan<'a> {
    columns: Vec<String>,
    values: Vec<Arg>,
    /// FK on the target table: linked by a follow-up UPDATE.
    linked: Vec<(&'a EdgeSpec, Vec<Value>)>,
    /// M2M: realized as join-table inserts.
    joined: Vec<(&'a EdgeSpec, &'a EdgeMutation)>,
}

fn plan<'a>(m: &'a MutationSpec) -> Result<Plan<'a>, GraphError> {
    let node = &m.node;
    let entity = node.entity.as_str();
    let mut plan = Plan {
        columns: Vec::new(),
        values: Vec::new(),
        linked: Vec::new(),
        joined: Vec::new(),
    };

    match (&node.id_value, node.id.generation) {
        (Some(id), _) => {
            plan.columns.push(node.id.column.clone());
            plan.values.push(arg(entity, &node.id.column, node.id.ty, id)?);
        }
        (None, IdGeneration::Uuid) => {
            plan.columns.push(node.id.column.clone());
            plan.values.push(Arg::Uuid(uuid::Uuid::new_v4()));
        }
        (None, IdGeneration::Client) => {
            return Err(GraphError::validation(entity, format!("missing required field \"{}\"", node.id.column)));
        }
        (None, IdGeneration::Store) => {}
    }

    for f in &node.fields {
        let col = node
            .column(&f.column)
            .ok_or_else(|| GraphError::validation(entity, format!("unknown field \"{}\"", f.column)))?;
        if f.value.is_null() && !col.optional {
            return Err(GraphError::validation(entity, format!("field \"{}\" is not nullable", f.column)));
        }
        plan.columns.push(f.column.clone());
        plan.values.push(arg(entity, &f.column, col.ty, &f.value)?);
    }
    for col in node.columns.iter().filter(|c| c.is_required()) {
        if node.field(&col.name).is_none() {
            return Err(GraphError::validation(entity, format!("missing required field \"{}\"", col.name)));
        }
    }

    for em in &m.edges {
        let edge = node
            .edge(&em.edge)
            .ok_or_else(|| GraphError::validation(entity, format!("unknown edge \"{}\"", em.edge)))?;
        if em.clear || !em.remove.is_empty() {
            return Err(GraphError::validation(entity, format!("edge \"{}\": nothing to remove on create", em.edge)));
        }
        let targets = dedup(&em.add);
        if targets.is_empty() {
            continue;
        }
        if edge.unique_target() && targets.len() > 1 {
            return Err(GraphError::validation(
                entity,
                format!("edge \"{}\" accepts a single target, got {}", edge.name, targets.len()),
            ));
        }
        if edge.rel == Relation::M2M {
            plan.joined.push((edge, em));
        } else if edge.fk_on_self() {
            let column = edge.fk_column().unwrap_or_default().to_string();
            plan.values.push(arg(entity, &column, edge.target.id_type, &targets[0])?);
            plan.columns.push(column);
        } else {
            plan.linked.push((edge, targets));
        }
    }
    for edge in node.edges.iter().filter(|e| e.required) {
        let set = m.edge_mutation(&edge.name).is_some_and(|em| !em.add.is_empty());
        if !set {
            return Err(GraphError::validation(entity, format!("missing required edge \"{}\"", edge.name)));
        }
    }
    Ok(plan)
}

/// Insert the node, then link FK-on-target edges and write join rows. Runs inside `tx`.
pub async fn create(ctx: &Context, tx: &mut dyn Tx, m: &MutationSpec) -> Result<Node, GraphError> {
    let node = &m.node;
    let plan = plan(m)?;

    let mut insert = InsertBuilder::new(node.table.clone()).returning(node.id.column.clone());
    if !plan.columns.is_empty() {
        insert = insert.columns(plan.columns.iter().cloned()).row(plan.values);
    }
    let rows = driver::query(ctx, tx, &insert.render()).await?;
    let id = rows
        .into_iter()
        .next()
        .and_then(|mut r| r.remove(&node.id.column))
        .map(|v| normalize(v, node.id.ty, tx.dialect()))
        .ok_or_else(|| GraphError::validation(&node.entity, "insert returned no id"))?;

    for (edge, targets) in &plan.linked {
        link_targets(ctx, tx, node, edge, &id, targets, false).await?;
    }
    for (edge, em) in &plan.joined {
        insert_join_rows(ctx, tx, node, edge, std::slice::from_ref(&id), em).await?;
    }

    let mut fields = Map::new();
    for c in &node.columns {
        let v = node.field(&c.name).cloned().unwrap_or(Value::Null);
        fields.insert(c.name.clone(), normalize(v, c.ty, tx.dialect()));
    }
    Ok(Node {
        entity: node.entity.clone(),
        id,
        fields,
        ..Default::default()
    })
}

/// Point the FK column on each target row at `owner`. Targets already linked to a
/// different node, or missing, fail the whole operation.
pub(super) async fn link_targets(
    ctx: &Context,
    tx: &mut dyn Tx,
    node: &NodeSpec,
    edge: &EdgeSpec,
    owner: &Value,
    targets: &[Value],
    relink: bool,
) -> Result<(), GraphError> {
    let column = edge.fk_column().unwrap_or_default().to_string();
    let mut scope = edge.target_selector(node.id.ty);
    Predicate::id_in(targets.iter().cloned()).apply(&mut scope);
    let free = Cond::Null {
        column: column.clone(),
        negate: false,
    };
    if relink {
        scope.where_(Cond::Or(vec![
            free,
            Cond::Cmp {
                column: column.clone(),
                op: crate::sql::CmpOp::Eq,
                value: owner.clone(),
            },
        ]));
    } else {
        scope.where_(free);
    }
    let q = UpdateBuilder::new(scope)
        .set(column, arg(&node.entity, &edge.name, node.id.ty, owner)?)
        .render()?;
    let affected = driver::exec(ctx, tx, &q).await?;
    if affected < targets.len() as u64 {
        return Err(GraphError::constraint(
            ConstraintKind::Edge,
            format!(
                "one of \"{}\" [{}] is missing or already connected to a different {}",
                edge.name,
                targets.iter().map(key).collect::<Vec<_>>().join(", "),
                node.entity
            ),
        ));
    }
    Ok(())
}

/// Insert (owner, target) pairs plus edge-scoped columns. Existing pairs are left as they are.
pub(super) async fn insert_join_rows(
    ctx: &Context,
    tx: &mut dyn Tx,
    node: &NodeSpec,
    edge: &EdgeSpec,
    owners: &[Value],
    em: &EdgeMutation,
) -> Result<(), GraphError> {
    let Some((table, own, other)) = edge.join() else {
        return Ok(());
    };
    let targets = dedup(&em.add);
    if targets.is_empty() || owners.is_empty() {
        return Ok(());
    }
    let mut columns = vec![own.to_string(), other.to_string()];
    let mut extra = Vec::new();
    for f in edge.join_fields() {
        let v = match em.fields.iter().find(|s| s.column == f.name) {
            Some(s) => s.value.clone(),
            None => match &f.default {
                Some(d) => d.produce(),
                None if f.optional => continue,
                None => {
                    return Err(GraphError::validation(
                        &node.entity,
                        format!("edge \"{}\": missing required field \"{}\"", edge.name, f.name),
                    ))
                }
            },
        };
        columns.push(f.name.clone());
        extra.push(arg(&node.entity, &f.name, f.ty, &v)?);
    }
    if let Some(unknown) = em.fields.iter().find(|s| !edge.join_fields().iter().any(|f| f.name == s.column)) {
        return Err(GraphError::validation(
            &node.entity,
            format!("edge \"{}\": unknown field \"{}\"", edge.name, unknown.column),
        ));
    }

    let mut insert = InsertBuilder::new(table).columns(columns).ignore_conflict();
    for owner in owners {
        let owner = arg(&node.entity, own, node.id.ty, owner)?;
        for target in &targets {
            let mut row = vec![owner.clone(), arg(&node.entity, other, edge.target.id_type, target)?];
            row.extend(extra.iter().cloned());
            insert = insert.row(row);
        }
    }
    driver::exec(ctx, tx, &insert.render()).await?;
    Ok(())
}
