//! Composable boolean conditions applied to a [`Selector`] in place.

use crate::sql::{CmpOp, Cond, Selector};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// A condition over one table's columns. Applying several predicates ANDs them in order.
#[derive(Clone)]
pub struct Predicate(Arc<dyn Fn(&mut Selector) + Send + Sync>);

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Predicate(..)")
    }
}

impl Predicate {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&mut Selector) + Send + Sync + 'static,
    {
        Predicate(Arc::new(f))
    }

    pub fn apply(&self, s: &mut Selector) {
        (self.0)(s)
    }

    fn cond(cond: Cond) -> Self {
        Predicate::new(move |s| {
            s.where_(cond.clone());
        })
    }

    fn cmp(column: impl Into<String>, op: CmpOp, value: impl Into<Value>) -> Self {
        Predicate::cond(Cond::Cmp {
            column: column.into(),
            op,
            value: value.into(),
        })
    }

    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::cmp(column, CmpOp::Eq, value)
    }

    pub fn ne(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::cmp(column, CmpOp::Ne, value)
    }

    pub fn gt(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::cmp(column, CmpOp::Gt, value)
    }

    pub fn ge(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::cmp(column, CmpOp::Ge, value)
    }

    pub fn lt(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::cmp(column, CmpOp::Lt, value)
    }

    pub fn le(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::cmp(column, CmpOp::Le, value)
    }

    /// Substring match. `%` and `_` in `needle` match literally.
    pub fn contains(column: impl Into<String>, needle: &str) -> Self {
        let escaped = needle.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");
        Predicate::cmp(column, CmpOp::Like, format!("%{}%", escaped))
    }

    pub fn is_in<I, V>(column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Predicate::cond(Cond::In {
            column: column.into(),
            values: values.into_iter().map(Into::into).collect(),
            negate: false,
        })
    }

    pub fn not_in<I, V>(column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Predicate::cond(Cond::In {
            column: column.into(),
            values: values.into_iter().map(Into::into).collect(),
            negate: true,
        })
    }

    pub fn is_null(column: impl Into<String>) -> Self {
        Predicate::cond(Cond::Null {
            column: column.into(),
            negate: false,
        })
    }

    pub fn not_null(column: impl Into<String>) -> Self {
        Predicate::cond(Cond::Null {
            column: column.into(),
            negate: true,
        })
    }

    /// Match on the id column of whatever table the predicate is applied to.
    pub fn id_eq(id: impl Into<Value>) -> Self {
        let id = id.into();
        Predicate::new(move |s| {
            let column = s.id_column().to_string();
            s.where_(Cond::Cmp {
                column,
                op: CmpOp::Eq,
                value: id.clone(),
            });
        })
    }

    pub fn id_in<I, V>(ids: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let ids: Vec<Value> = ids.into_iter().map(Into::into).collect();
        Predicate::new(move |s| {
            let column = s.id_column().to_string();
            s.where_(Cond::In {
                column,
                values: ids.clone(),
                negate: false,
            });
        })
    }

    pub fn and<I>(preds: I) -> Self
    where
        I: IntoIterator<Item = Predicate>,
    {
        let preds: Vec<Predicate> = preds.into_iter().collect();
        Predicate::new(move |s| {
            let conds = isolated(s, &preds);
            s.where_(Cond::And(conds));
        })
    }

    pub fn or<I>(preds: I) -> Self
    where
        I: IntoIterator<Item = Predicate>,
    {
        let preds: Vec<Predicate> = preds.into_iter().collect();
        Predicate::new(move |s| {
            let conds = isolated(s, &preds);
            s.where_(Cond::Or(conds));
        })
    }

    pub fn not(pred: Predicate) -> Self {
        Predicate::new(move |s| {
            let mut scoped = s.scoped();
            pred.apply(&mut scoped);
            let inner = scoped.take_cond().unwrap_or(Cond::Const(true));
            s.where_(Cond::Not(Box::new(inner)));
        })
    }
}

/// Evaluate each predicate against a fresh selector over the same table and collect its condition.
fn isolated(s: &Selector, preds: &[Predicate]) -> Vec<Cond> {
    preds
        .iter()
        .filter_map(|p| {
            let mut scoped = s.scoped();
            p.apply(&mut scoped);
            scoped.take_cond()
        })
        .collect()
}

/// Apply all predicates in order (logical AND). An empty slice leaves the selector untouched.
pub fn apply_all(s: &mut Selector, preds: &[Predicate]) {
    for p in preds {
        p.apply(s);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::FieldType;
    use crate::sql::Arg;
    use std::collections::HashMap;

    fn pets() -> Selector {
        let types: HashMap<String, FieldType> = [
            ("id".to_string(), FieldType::Int),
            ("name".to_string(), FieldType::String),
            ("owner_id".to_string(), FieldType::Int),
        ]
        .into_iter()
        .collect();
        Selector::new("pets", "id", Arc::new(types))
    }

    #[test]
    fn empty_predicate_set_is_noop() {
        let mut s = pets();
        apply_all(&mut s, &[]);
        assert!(!s.has_conditions());
        assert_eq!(s.render().unwrap().sql, r#"SELECT "id" FROM "pets""#);
    }

    #[test]
    fn predicates_conjoin_in_insertion_order() {
        let mut s = pets();
        apply_all(
            &mut s,
            &[Predicate::eq("name", "pedro"), Predicate::id_in([1, 2])],
        );
        let q = s.render().unwrap();
        assert_eq!(
            q.sql,
            r#"SELECT "id" FROM "pets" WHERE "name" = $1 AND "id" IN ($2, $3)"#
        );
    }

    #[test]
    fn or_and_not_compose() {
        let mut s = pets();
        let p = Predicate::or([
            Predicate::eq("name", "xabi"),
            Predicate::not(Predicate::is_null("owner_id")),
        ]);
        p.apply(&mut s);
        let q = s.render().unwrap();
        assert_eq!(
            q.sql,
            r#"SELECT "id" FROM "pets" WHERE ("name" = $1 OR NOT ("owner_id" IS NULL))"#
        );
        assert_eq!(q.params, vec![Arg::Text("xabi".into())]);
    }

    #[test]
    fn contains_escapes_wildcards() {
        let mut s = pets();
        Predicate::contains("name", "50%").apply(&mut s);
        let q = s.render().unwrap();
        assert_eq!(q.params, vec![Arg::Text("%50\\%%".into())]);
        assert!(q.sql.ends_with(r#""name" LIKE $1 ESCAPE '\'"#));
    }
}
