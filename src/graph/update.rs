use super::create::{insert_join_rows, link_targets};
use super::{arg, dedup, select_ids, EdgeMutation, EdgeSpec, FieldType, MutationSpec, NodeSpec, Relation};
use crate::context::Context;
use crate::driver::{self, Tx};
use crate::error::GraphError;
use crate::predicate::Predicate;
use crate::sql::{self, Arg, Cond, UpdateBuilder};
use serde_json::Value;

/// Reject what can be rejected without touching the store.
fn check(m: &MutationSpec) -> Result<(), GraphError> {
    let node = &m.node;
    let entity = node.entity.as_str();
    for f in &node.fields {
        if f.column == node.id.column {
            return Err(GraphError::validation(entity, format!("field \"{}\" is immutable", f.column)));
        }
        let col = node
            .column(&f.column)
            .ok_or_else(|| GraphError::validation(entity, format!("unknown field \"{}\"", f.column)))?;
        if col.immutable {
            return Err(GraphError::validation(entity, format!("field \"{}\" is immutable", f.column)));
        }
        if f.value.is_null() && !col.optional {
            return Err(GraphError::validation(entity, format!("field \"{}\" is not nullable", f.column)));
        }
    }
    for c in &node.cleared {
        match node.column(c) {
            Some(col) if col.optional && !col.immutable => {}
            Some(_) => return Err(GraphError::validation(entity, format!("field \"{}\" cannot be cleared", c))),
            None => return Err(GraphError::validation(entity, format!("unknown field \"{}\"", c))),
        }
    }
    for em in &m.edges {
        let edge = node
            .edge(&em.edge)
            .ok_or_else(|| GraphError::validation(entity, format!("unknown edge \"{}\"", em.edge)))?;
        let detaches = em.clear || !em.remove.is_empty();
        if detaches {
            let required = if edge.fk_on_self() {
                // Replacing the single target in the same mutation keeps the edge set.
                (edge.required || !edge.fk_nullable()) && em.add.is_empty()
            } else {
                edge.rel != Relation::M2M && !edge.fk_nullable()
            };
            if required {
                return Err(GraphError::RequiredEdge {
                    entity: entity.to_string(),
                    edge: edge.name.clone(),
                });
            }
        }
        if edge.unique_target() && dedup(&em.add).len() > 1 {
            return Err(GraphError::validation(
                entity,
                format!("edge \"{}\" accepts a single target, got {}", edge.name, em.add.len()),
            ));
        }
    }
    Ok(())
}

/// Apply field assignments and edge deltas to every row matching the predicates.
/// Returns the number of primary rows matched; zero is not an error.
pub async fn update(ctx: &Context, tx: &mut dyn Tx, m: &MutationSpec) -> Result<u64, GraphError> {
    check(m)?;
    let node = &m.node;
    let ids = select_ids(ctx, tx, &m.selector()).await?;
    if ids.is_empty() {
        return Ok(0);
    }

    let mut scope = node.selector();
    Predicate::id_in(ids.iter().cloned()).apply(&mut scope);
    let mut stmt = UpdateBuilder::new(scope);
    for f in &node.fields {
        let ty = node.column(&f.column).map(|c| c.ty).unwrap_or(FieldType::Json);
        stmt = stmt.set(f.column.clone(), arg(&node.entity, &f.column, ty, &f.value)?);
    }
    for c in &node.cleared {
        let ty = node.column(c).map(|c| c.ty).unwrap_or(FieldType::Json);
        stmt = stmt.set(c.clone(), Arg::Null(ty));
    }
    for em in &m.edges {
        let Some(edge) = node.edge(&em.edge).filter(|e| e.fk_on_self()) else {
            continue;
        };
        let column = edge.fk_column().unwrap_or_default().to_string();
        match em.add.first() {
            Some(target) => stmt = stmt.set(column, arg(&node.entity, &edge.name, edge.target.id_type, target)?),
            None if em.clear => stmt = stmt.set(column, Arg::Null(edge.target.id_type)),
            None => {}
        }
    }
    if !stmt.is_empty() {
        driver::exec(ctx, tx, &stmt.render()?).await?;
    }

    for em in &m.edges {
        let Some(edge) = node.edge(&em.edge) else {
            continue;
        };
        if edge.rel == Relation::M2M {
            update_join(ctx, tx, node, edge, &ids, em).await?;
        } else if edge.fk_on_self() {
            if em.add.is_empty() && !em.clear && !em.remove.is_empty() {
                unset_own_fk(ctx, tx, node, edge, &ids, &em.remove).await?;
            }
        } else {
            update_target_fk(ctx, tx, node, edge, &ids, em).await?;
        }
    }
    Ok(ids.len() as u64)
}

/// Null the FK on matched rows whose current target is one of `removed`.
async fn unset_own_fk(
    ctx: &Context,
    tx: &mut dyn Tx,
    node: &NodeSpec,
    edge: &EdgeSpec,
    ids: &[Value],
    removed: &[Value],
) -> Result<(), GraphError> {
    let column = edge.fk_column().unwrap_or_default().to_string();
    let mut scope = node.selector();
    Predicate::id_in(ids.iter().cloned()).apply(&mut scope);
    Predicate::is_in(column.clone(), removed.iter().cloned()).apply(&mut scope);
    let q = UpdateBuilder::new(scope).set(column, Arg::Null(edge.target.id_type)).render()?;
    driver::exec(ctx, tx, &q).await?;
    Ok(())
}

/// Clear, remove, then add for an edge whose FK lives on the target table.
async fn update_target_fk(
    ctx: &Context,
    tx: &mut dyn Tx,
    node: &NodeSpec,
    edge: &EdgeSpec,
    ids: &[Value],
    em: &EdgeMutation,
) -> Result<(), GraphError> {
    let column = edge.fk_column().unwrap_or_default().to_string();
    let adds = dedup(&em.add);
    if !adds.is_empty() && ids.len() > 1 {
        return Err(GraphError::validation(
            &node.entity,
            format!("edge \"{}\": cannot link the same targets to {} nodes", edge.name, ids.len()),
        ));
    }
    // A unique target is replaced, so the previous one is detached first.
    let detach_all = em.clear || (edge.unique_target() && !adds.is_empty() && edge.fk_nullable());
    if detach_all || !em.remove.is_empty() {
        let mut scope = edge.target_selector(node.id.ty);
        Predicate::is_in(column.clone(), ids.iter().cloned()).apply(&mut scope);
        if !detach_all {
            Predicate::id_in(em.remove.iter().cloned()).apply(&mut scope);
        } else if !em.clear {
            Predicate::not_in(scope.id_column().to_string(), adds.iter().cloned()).apply(&mut scope);
        }
        let q = UpdateBuilder::new(scope).set(column, Arg::Null(node.id.ty)).render()?;
        driver::exec(ctx, tx, &q).await?;
    }
    if adds.is_empty() {
        return Ok(());
    }
    link_targets(ctx, tx, node, edge, &ids[0], &adds, true).await
}

/// Clear, remove, then add join rows. Adding an existing pair is a no-op.
async fn update_join(
    ctx: &Context,
    tx: &mut dyn Tx,
    node: &NodeSpec,
    edge: &EdgeSpec,
    ids: &[Value],
    em: &EdgeMutation,
) -> Result<(), GraphError> {
    let Some((_, _, other)) = edge.join() else {
        return Ok(());
    };
    if em.clear || !em.remove.is_empty() {
        let Some(mut scope) = edge.join_selector(node.id.ty) else {
            return Ok(());
        };
        Predicate::id_in(ids.iter().cloned()).apply(&mut scope);
        if !em.clear {
            scope.where_(Cond::In {
                column: other.to_string(),
                values: em.remove.clone(),
                negate: false,
            });
        }
        driver::exec(ctx, tx, &sql::delete(&scope)?).await?;
    }
    insert_join_rows(ctx, tx, node, edge, ids, em).await
}
