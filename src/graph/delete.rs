use super::{key, select_ids, EdgeSpec, MutationSpec, NodeSpec, OnDelete, Relation};
use crate::config::ResolvedSchema;
use crate::context::Context;
use crate::driver::{self, Tx};
use crate::error::{ConstraintKind, GraphError};
use crate::hook::BoxFuture;
use crate::predicate::Predicate;
use crate::sql::{self, Arg, UpdateBuilder};
use serde_json::Value;
use std::collections::HashSet;

/// Delete every row matching the predicates after cleaning up declared edges.
/// Cascading edges delete their targets through the same path, so the targets' own
/// join rows and `on_delete` rules apply. Returns the number of primary rows deleted.
pub async fn delete(ctx: &Context, tx: &mut dyn Tx, schema: &ResolvedSchema, m: &MutationSpec) -> Result<u64, GraphError> {
    let node = &m.node;
    let ids = select_ids(ctx, tx, &m.selector()).await?;
    if ids.is_empty() {
        return Ok(0);
    }
    let mut visited = HashSet::new();
    delete_ids(ctx, tx, schema, node, ids, &mut visited).await
}

/// `visited` holds `(entity, id)` pairs already being deleted; cyclic cascades stop there.
fn delete_ids<'a>(
    ctx: &'a Context,
    tx: &'a mut dyn Tx,
    schema: &'a ResolvedSchema,
    node: &'a NodeSpec,
    ids: Vec<Value>,
    visited: &'a mut HashSet<(String, String)>,
) -> BoxFuture<'a, Result<u64, GraphError>> {
    Box::pin(async move {
        let ids: Vec<Value> = ids
            .into_iter()
            .filter(|id| visited.insert((node.entity.clone(), key(id))))
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }
        for edge in &node.edges {
            if edge.rel == Relation::M2M {
                let Some(mut scope) = edge.join_selector(node.id.ty) else {
                    continue;
                };
                Predicate::id_in(ids.iter().cloned()).apply(&mut scope);
                driver::exec(ctx, tx, &sql::delete(&scope)?).await?;
            } else if !edge.fk_on_self() {
                detach_referencing(ctx, &mut *tx, schema, node, edge, &ids, &mut *visited).await?;
            }
        }
        let mut scope = node.selector();
        Predicate::id_in(ids).apply(&mut scope);
        driver::exec(ctx, tx, &sql::delete(&scope)?).await
    })
}

/// Rows on the target side that point at the deleted ids: cascade, null out, or refuse.
async fn detach_referencing(
    ctx: &Context,
    tx: &mut dyn Tx,
    schema: &ResolvedSchema,
    node: &NodeSpec,
    edge: &EdgeSpec,
    ids: &[Value],
    visited: &mut HashSet<(String, String)>,
) -> Result<(), GraphError> {
    let Some(column) = edge.fk_column() else {
        return Ok(());
    };
    let mut scope = edge.target_selector(node.id.ty);
    Predicate::is_in(column, ids.iter().cloned()).apply(&mut scope);
    match edge.on_delete {
        OnDelete::Cascade => {
            let targets = select_ids(ctx, tx, &scope).await?;
            if !targets.is_empty() {
                let target = schema.node(&edge.target.entity)?;
                let n = delete_ids(ctx, tx, schema, &target, targets, visited).await?;
                tracing::debug!(entity = %node.entity, edge = %edge.name, target = %target.entity, rows = n, "cascaded delete");
            }
        }
        OnDelete::SetNull if edge.fk_nullable() => {
            let q = UpdateBuilder::new(scope).set(column, Arg::Null(node.id.ty)).render()?;
            driver::exec(ctx, tx, &q).await?;
        }
        OnDelete::SetNull | OnDelete::Restrict => {
            let mut counting = scope;
            counting.count();
            let rows = driver::query(ctx, tx, &counting.render()?).await?;
            let referenced = rows
                .first()
                .and_then(|r| r.get("count"))
                .and_then(Value::as_i64)
                .unwrap_or(0);
            if referenced > 0 {
                return Err(GraphError::Constraint(crate::error::ConstraintViolation {
                    kind: ConstraintKind::ForeignKey,
                    constraint: Some(format!("{}.{}", edge.target.table, column)),
                    message: format!(
                        "{} is still referenced by {} {} row(s) through \"{}\"",
                        node.entity, referenced, edge.target.entity, edge.name
                    ),
                }));
            }
        }
    }
    Ok(())
}
