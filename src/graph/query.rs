use super::{column_values, key, EdgeLoad, EdgeSpec, FieldType, Node, NodeSpec, QuerySpec, Relation};
use crate::context::Context;
use crate::driver::{self, Dialect, Row, Tx};
use crate::error::GraphError;
use crate::predicate::{apply_all, Predicate};
use crate::sql::Selector;
use chrono::{DateTime, SecondsFormat};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Bring a decoded cell to the canonical JSON shape of its declared type, whatever the backend.
pub fn normalize(v: Value, ty: FieldType, dialect: Dialect) -> Value {
    match (ty, v) {
        (_, Value::Null) => Value::Null,
        (FieldType::Bool, Value::Number(n)) => Value::Bool(n.as_i64().unwrap_or(0) != 0),
        (FieldType::Float, Value::Number(n)) if !n.is_f64() => n
            .as_f64()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Number(n)),
        (FieldType::Time, Value::String(s)) => match DateTime::parse_from_rfc3339(&s) {
            Ok(t) => Value::String(t.with_timezone(&chrono::Utc).to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            Err(_) => Value::String(s),
        },
        (FieldType::Json, Value::String(s)) if dialect == Dialect::Sqlite => {
            serde_json::from_str(&s).unwrap_or(Value::String(s))
        }
        (_, v) => v,
    }
}

fn build_node(entity: &str, id: (&str, FieldType), columns: &[(String, FieldType)], row: &mut Row, dialect: Dialect) -> Node {
    let id_value = normalize(row.remove(id.0).unwrap_or(Value::Null), id.1, dialect);
    let mut fields = Map::new();
    for (c, ty) in columns {
        let v = row.remove(c).unwrap_or(Value::Null);
        fields.insert(c.clone(), normalize(v, *ty, dialect));
    }
    Node {
        entity: entity.to_string(),
        id: id_value,
        fields,
        ..Default::default()
    }
}

fn projection(q: &QuerySpec) -> Result<Vec<(String, FieldType)>, GraphError> {
    let spec = &q.node;
    match &q.fields {
        None => Ok(spec.columns.iter().map(|c| (c.name.clone(), c.ty)).collect()),
        Some(fields) => fields
            .iter()
            .filter(|f| **f != spec.id.column)
            .map(|f| {
                spec.column(f)
                    .map(|c| (c.name.clone(), c.ty))
                    .ok_or_else(|| GraphError::validation(&spec.entity, format!("unknown field \"{}\"", f)))
            })
            .collect(),
    }
}

/// The query's selector: predicates, order and paging applied, id projected.
fn scope(q: &QuerySpec) -> Result<Selector, GraphError> {
    let mut s = q.node.selector();
    apply_all(&mut s, &q.predicates);
    for (c, desc) in &q.order {
        if !s.has_column(c) {
            return Err(GraphError::validation(&q.node.entity, format!("unknown order field \"{}\"", c)));
        }
        s.order_by(c.clone(), *desc);
    }
    if let Some(n) = q.limit {
        s.limit(n);
    }
    if let Some(n) = q.offset {
        s.offset(n);
    }
    Ok(s)
}

/// Matching nodes with requested edges loaded.
pub async fn nodes(ctx: &Context, tx: &mut dyn Tx, q: &QuerySpec) -> Result<Vec<Node>, GraphError> {
    let spec = &q.node;
    let columns = projection(q)?;
    let mut select: Vec<String> = std::iter::once(spec.id.column.clone())
        .chain(columns.iter().map(|(c, _)| c.clone()))
        .collect();
    let mut loads = Vec::with_capacity(q.with_edges.len());
    for load in &q.with_edges {
        let edge = spec
            .edge(&load.edge)
            .ok_or_else(|| GraphError::validation(&spec.entity, format!("unknown edge \"{}\"", load.edge)))?;
        if let Some(fk) = edge.fk_column().filter(|_| edge.fk_on_self()) {
            if !select.iter().any(|c| c == fk) {
                select.push(fk.to_string());
            }
        }
        loads.push((edge, load));
    }

    let rendered = scope(q)?.select(select).render()?;
    let mut rows = driver::query(ctx, tx, &rendered).await?;
    let dialect = tx.dialect();
    let mut out: Vec<Node> = rows
        .iter_mut()
        .map(|row| build_node(&spec.entity, (&spec.id.column, spec.id.ty), &columns, row, dialect))
        .collect();
    if out.is_empty() {
        return Ok(out);
    }
    for (edge, load) in loads {
        load_edge(ctx, tx, spec, edge, load, &mut out, &rows).await?;
    }
    Ok(out)
}

fn target_columns(load: &EdgeLoad) -> Vec<(String, FieldType)> {
    load.target
        .as_ref()
        .map(|t| t.columns.iter().map(|c| (c.name.clone(), c.ty)).collect())
        .unwrap_or_default()
}

fn target_scope(spec: &NodeSpec, edge: &EdgeSpec, load: &EdgeLoad) -> Selector {
    let mut types: HashMap<String, FieldType> = load.target.as_ref().map(|t| (*t.types()).clone()).unwrap_or_default();
    types.insert(edge.target.id_column.clone(), edge.target.id_type);
    if let Some(fk) = edge.fk_column().filter(|_| !edge.fk_on_self()) {
        types.insert(fk.to_string(), spec.id.ty);
    }
    let mut s = Selector::new(edge.target.table.clone(), edge.target.id_column.clone(), Arc::new(types));
    apply_all(&mut s, &load.predicates);
    s
}

/// One batched IN-query per edge (two for M2M), grouped back onto the parents.
async fn load_edge(
    ctx: &Context,
    tx: &mut dyn Tx,
    spec: &NodeSpec,
    edge: &EdgeSpec,
    load: &EdgeLoad,
    parents: &mut [Node],
    parent_rows: &[Row],
) -> Result<(), GraphError> {
    let dialect = tx.dialect();
    let columns = target_columns(load);
    let target_id = (edge.target.id_column.as_str(), edge.target.id_type);
    let mut select: Vec<String> = std::iter::once(edge.target.id_column.clone())
        .chain(columns.iter().map(|(c, _)| c.clone()))
        .collect();
    let mut grouped: HashMap<String, Vec<Node>> = HashMap::new();

    if edge.fk_on_self() {
        let fk = edge.fk_column().unwrap_or_default();
        let fks: Vec<Value> = parent_rows
            .iter()
            .map(|r| normalize(r.get(fk).cloned().unwrap_or(Value::Null), edge.target.id_type, dialect))
            .collect();
        let wanted = super::dedup(&fks.iter().filter(|v| !v.is_null()).cloned().collect::<Vec<_>>());
        let mut by_id = HashMap::new();
        if !wanted.is_empty() {
            let mut s = target_scope(spec, edge, load);
            Predicate::id_in(wanted).apply(&mut s);
            let rows = driver::query(ctx, tx, &s.select(select).render()?).await?;
            for mut row in rows {
                let n = build_node(&edge.target.entity, target_id, &columns, &mut row, dialect);
                by_id.insert(key(&n.id), n);
            }
        }
        for (parent, fk) in parents.iter_mut().zip(fks) {
            let found = by_id.get(&key(&fk)).cloned().into_iter().collect();
            parent.edges.insert(edge.name.clone(), found);
        }
        return Ok(());
    }

    let parent_ids: Vec<Value> = parents.iter().map(|p| p.id.clone()).collect();
    if edge.rel == Relation::M2M {
        let Some((_, own, other)) = edge.join() else {
            return Ok(());
        };
        let Some(mut join) = edge.join_selector(spec.id.ty) else {
            return Ok(());
        };
        Predicate::id_in(parent_ids.iter().cloned()).apply(&mut join);
        let join_fields: Vec<(String, FieldType)> = edge.join_fields().iter().map(|f| (f.name.clone(), f.ty)).collect();
        let join_select: Vec<String> = [own.to_string(), other.to_string()]
            .into_iter()
            .chain(join_fields.iter().map(|(c, _)| c.clone()))
            .collect();
        let pairs = driver::query(ctx, tx, &join.select(join_select).render()?).await?;
        let others = super::dedup(&column_values(pairs.clone(), other));
        let mut by_id = HashMap::new();
        if !others.is_empty() {
            let mut s = target_scope(spec, edge, load);
            Predicate::id_in(others).apply(&mut s);
            let rows = driver::query(ctx, tx, &s.select(select).render()?).await?;
            for mut row in rows {
                let n = build_node(&edge.target.entity, target_id, &columns, &mut row, dialect);
                by_id.insert(key(&n.id), n);
            }
        }
        for mut pair in pairs {
            let owner = normalize(pair.remove(own).unwrap_or(Value::Null), spec.id.ty, dialect);
            let target = normalize(pair.remove(other).unwrap_or(Value::Null), edge.target.id_type, dialect);
            let Some(n) = by_id.get(&key(&target)) else {
                continue;
            };
            let mut n = n.clone();
            for (c, ty) in &join_fields {
                n.edge_fields.insert(c.clone(), normalize(pair.remove(c).unwrap_or(Value::Null), *ty, dialect));
            }
            grouped.entry(key(&owner)).or_default().push(n);
        }
    } else {
        let fk = edge.fk_column().unwrap_or_default().to_string();
        select.push(fk.clone());
        let mut s = target_scope(spec, edge, load);
        Predicate::is_in(fk.clone(), parent_ids).apply(&mut s);
        s.order_by(edge.target.id_column.clone(), false);
        let rows = driver::query(ctx, tx, &s.select(select).render()?).await?;
        for mut row in rows {
            let owner = normalize(row.remove(&fk).unwrap_or(Value::Null), spec.id.ty, dialect);
            let n = build_node(&edge.target.entity, target_id, &columns, &mut row, dialect);
            grouped.entry(key(&owner)).or_default().push(n);
        }
    }
    for parent in parents.iter_mut() {
        let found = grouped.get(&key(&parent.id)).cloned().unwrap_or_default();
        parent.edges.insert(edge.name.clone(), found);
    }
    Ok(())
}

/// Number of matching rows; paging is ignored.
pub async fn count(ctx: &Context, tx: &mut dyn Tx, q: &QuerySpec) -> Result<u64, GraphError> {
    let mut s = q.node.selector();
    apply_all(&mut s, &q.predicates);
    s.count();
    let rows = driver::query(ctx, tx, &s.render()?).await?;
    let n = rows
        .first()
        .and_then(|r| r.get("count"))
        .and_then(Value::as_i64)
        .unwrap_or(0);
    Ok(n.max(0) as u64)
}

pub async fn exists(ctx: &Context, tx: &mut dyn Tx, q: &QuerySpec) -> Result<bool, GraphError> {
    let mut s = q.node.selector();
    apply_all(&mut s, &q.predicates);
    s.limit(1);
    Ok(!super::select_ids(ctx, tx, &s).await?.is_empty())
}

/// Ids of matching rows, honoring order and paging.
pub async fn ids(ctx: &Context, tx: &mut dyn Tx, q: &QuerySpec) -> Result<Vec<Value>, GraphError> {
    let s = scope(q)?;
    let dialect = tx.dialect();
    let ids = super::select_ids(ctx, tx, &s).await?;
    Ok(ids.into_iter().map(|v| normalize(v, q.node.id.ty, dialect)).collect())
}
