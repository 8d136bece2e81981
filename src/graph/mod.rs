//! Graph specs and the compiler that turns them into ordered SQL inside one transaction.

mod create;
mod delete;
mod query;
mod spec;
mod update;

pub use create::create;
pub use delete::delete;
pub use query::{count, exists, ids, nodes, normalize};
pub use spec::*;
pub use update::update;

use crate::context::Context;
use crate::driver::{self, Row, Tx};
use crate::error::GraphError;
use crate::sql::{Arg, Selector};
use serde_json::Value;

/// Coerce a value for `column` of `entity`, reporting a validation error on mismatch.
pub(crate) fn arg(entity: &str, column: &str, ty: FieldType, v: &Value) -> Result<Arg, GraphError> {
    Arg::from_json(v, ty).map_err(|e| GraphError::validation(entity, format!("{}: {}", column, e)))
}

/// Ids matched by `scope`, in store order.
pub(crate) async fn select_ids(ctx: &Context, tx: &mut dyn Tx, scope: &Selector) -> Result<Vec<Value>, GraphError> {
    let id_column = scope.id_column().to_string();
    let q = scope.clone().select([id_column.as_str()]).render()?;
    let rows = driver::query(ctx, tx, &q).await?;
    Ok(column_values(rows, &id_column))
}

pub(crate) fn column_values(rows: Vec<Row>, column: &str) -> Vec<Value> {
    rows.into_iter()
        .filter_map(|mut r| r.remove(column))
        .filter(|v| !v.is_null())
        .collect()
}

/// Stable key for grouping ids that came back from different statements.
pub(crate) fn key(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Input order preserved, repeats dropped.
pub(crate) fn dedup(values: &[Value]) -> Vec<Value> {
    let mut seen = std::collections::HashSet::new();
    values.iter().filter(|v| seen.insert(key(v))).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dedup_keeps_first_occurrence() {
        let got = dedup(&[json!(3), json!(1), json!(3), json!("a"), json!("a")]);
        assert_eq!(got, vec![json!(3), json!(1), json!("a")]);
    }

    #[test]
    fn coercion_errors_name_the_column() {
        let err = arg("tenant", "name", FieldType::String, &json!(5)).unwrap_err();
        assert_eq!(err.to_string(), "validation: tenant: name: expected string, got number");
    }
}
