//! Builds parameterized SELECT, INSERT, UPDATE, DELETE. Identifiers are quoted, values travel as `$n` params.

use crate::error::GraphError;
use crate::graph::FieldType;
use crate::sql::Arg;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Quote identifier (safe: only from specs/config).
pub fn quoted(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

/// Rendered statement: SQL text plus its bind arguments in placeholder order.
#[derive(Clone, Debug, Default)]
pub struct QueryBuf {
    pub sql: String,
    pub params: Vec<Arg>,
}

impl QueryBuf {
    pub fn new() -> Self {
        QueryBuf::default()
    }

    /// Push a param and return its placeholder.
    pub fn push_param(&mut self, v: Arg) -> String {
        self.params.push(v);
        format!("${}", self.params.len())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Like,
}

impl CmpOp {
    fn as_sql(self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "<>",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Like => "LIKE",
        }
    }
}

/// Boolean condition tree; rendered late so placeholder numbering follows the final statement.
#[derive(Clone, Debug)]
pub enum Cond {
    Cmp { column: String, op: CmpOp, value: Value },
    In { column: String, values: Vec<Value>, negate: bool },
    Null { column: String, negate: bool },
    InSelect { column: String, select: Box<Selector> },
    And(Vec<Cond>),
    Or(Vec<Cond>),
    Not(Box<Cond>),
    Const(bool),
}

/// Column-name to storage-type lookup shared by every selector over the same table.
pub type ColumnTypes = Arc<HashMap<String, FieldType>>;

/// SELECT over one table. Predicates narrow it in place through [`Selector::where_`].
#[derive(Clone, Debug)]
pub struct Selector {
    table: String,
    id_column: String,
    types: ColumnTypes,
    columns: Vec<String>,
    conds: Vec<Cond>,
    order: Vec<(String, bool)>,
    limit: Option<u64>,
    offset: Option<u64>,
    count: bool,
}

impl Selector {
    pub fn new(table: impl Into<String>, id_column: impl Into<String>, types: ColumnTypes) -> Self {
        Selector {
            table: table.into(),
            id_column: id_column.into(),
            types,
            columns: Vec::new(),
            conds: Vec::new(),
            order: Vec::new(),
            limit: None,
            offset: None,
            count: false,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn id_column(&self) -> &str {
        &self.id_column
    }

    pub fn column_type(&self, column: &str) -> Option<FieldType> {
        self.types.get(column).copied()
    }

    pub fn has_column(&self, column: &str) -> bool {
        column == self.id_column || self.types.contains_key(column)
    }

    /// Same table and types, no conditions. Used to evaluate a predicate in isolation.
    pub fn scoped(&self) -> Selector {
        Selector::new(self.table.clone(), self.id_column.clone(), self.types.clone())
    }

    pub fn select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// AND a condition onto the selector, preserving insertion order in the rendered text.
    pub fn where_(&mut self, cond: Cond) -> &mut Self {
        self.conds.push(cond);
        self
    }

    pub fn has_conditions(&self) -> bool {
        !self.conds.is_empty()
    }

    /// The accumulated conditions as one condition; `None` when nothing was added.
    pub fn take_cond(&mut self) -> Option<Cond> {
        match self.conds.len() {
            0 => None,
            1 => self.conds.pop(),
            _ => Some(Cond::And(std::mem::take(&mut self.conds))),
        }
    }

    pub fn order_by(&mut self, column: impl Into<String>, desc: bool) -> &mut Self {
        self.order.push((column.into(), desc));
        self
    }

    pub fn limit(&mut self, n: u64) -> &mut Self {
        self.limit = Some(n);
        self
    }

    pub fn offset(&mut self, n: u64) -> &mut Self {
        self.offset = Some(n);
        self
    }

    pub fn count(&mut self) -> &mut Self {
        self.count = true;
        self
    }

    pub fn render(&self) -> Result<QueryBuf, GraphError> {
        let mut q = QueryBuf::new();
        q.sql = self.render_into(&mut q.params)?;
        Ok(q)
    }

    fn render_into(&self, params: &mut Vec<Arg>) -> Result<String, GraphError> {
        let projection = if self.count {
            format!("COUNT(*) AS {}", quoted("count"))
        } else if self.columns.is_empty() {
            quoted(&self.id_column)
        } else {
            self.columns.iter().map(|c| quoted(c)).collect::<Vec<_>>().join(", ")
        };
        let mut sql = format!("SELECT {} FROM {}", projection, quoted(&self.table));
        sql.push_str(&self.render_where(params)?);
        if !self.count {
            if !self.order.is_empty() {
                let order: Vec<String> = self
                    .order
                    .iter()
                    .map(|(c, desc)| format!("{}{}", quoted(c), if *desc { " DESC" } else { "" }))
                    .collect();
                sql.push_str(&format!(" ORDER BY {}", order.join(", ")));
            }
            if let Some(n) = self.limit {
                sql.push_str(&format!(" LIMIT {}", n));
            }
            if let Some(n) = self.offset {
                sql.push_str(&format!(" OFFSET {}", n));
            }
        }
        Ok(sql)
    }

    /// " WHERE ..." for the accumulated conditions, or empty when there are none.
    pub fn render_where(&self, params: &mut Vec<Arg>) -> Result<String, GraphError> {
        if self.conds.is_empty() {
            return Ok(String::new());
        }
        let mut parts = Vec::with_capacity(self.conds.len());
        for c in &self.conds {
            parts.push(self.render_cond(c, params)?);
        }
        Ok(format!(" WHERE {}", parts.join(" AND ")))
    }

    fn arg_for(&self, column: &str, v: &Value) -> Result<Arg, GraphError> {
        if !self.has_column(column) {
            return Err(GraphError::validation(&self.table, format!("unknown column '{}'", column)));
        }
        match self.column_type(column) {
            Some(ty) => Arg::from_json(v, ty)
                .map_err(|e| GraphError::validation(&self.table, format!("{}: {}", column, e))),
            None => Ok(Arg::infer(v)),
        }
    }

    fn render_cond(&self, cond: &Cond, params: &mut Vec<Arg>) -> Result<String, GraphError> {
        let push = |params: &mut Vec<Arg>, a: Arg| {
            params.push(a);
            format!("${}", params.len())
        };
        Ok(match cond {
            Cond::Cmp { column, op, value } if value.is_null() => match op {
                CmpOp::Eq => format!("{} IS NULL", quoted(column)),
                CmpOp::Ne => format!("{} IS NOT NULL", quoted(column)),
                _ => "1 = 0".to_string(),
            },
            Cond::Cmp { column, op, value } => {
                let arg = match op {
                    CmpOp::Like if self.has_column(column) => {
                        Arg::Text(value.as_str().unwrap_or_default().to_string())
                    }
                    _ => self.arg_for(column, value)?,
                };
                let ph = push(params, arg);
                if *op == CmpOp::Like {
                    format!("{} LIKE {} ESCAPE '\\'", quoted(column), ph)
                } else {
                    format!("{} {} {}", quoted(column), op.as_sql(), ph)
                }
            }
            Cond::In { values, negate, .. } if values.is_empty() => {
                (if *negate { "1 = 1" } else { "1 = 0" }).to_string()
            }
            Cond::In { column, values, negate } => {
                let mut phs = Vec::with_capacity(values.len());
                for v in values {
                    let arg = self.arg_for(column, v)?;
                    phs.push(push(params, arg));
                }
                format!(
                    "{} {}IN ({})",
                    quoted(column),
                    if *negate { "NOT " } else { "" },
                    phs.join(", ")
                )
            }
            Cond::Null { column, negate } => {
                if !self.has_column(column) {
                    return Err(GraphError::validation(&self.table, format!("unknown column '{}'", column)));
                }
                format!("{} IS {}NULL", quoted(column), if *negate { "NOT " } else { "" })
            }
            Cond::InSelect { column, select } => {
                let sub = select.render_into(params)?;
                format!("{} IN ({})", quoted(column), sub)
            }
            Cond::And(cs) | Cond::Or(cs) if cs.is_empty() => {
                (if matches!(cond, Cond::And(_)) { "1 = 1" } else { "1 = 0" }).to_string()
            }
            Cond::And(cs) => self.render_group(cs, " AND ", params)?,
            Cond::Or(cs) => self.render_group(cs, " OR ", params)?,
            Cond::Not(c) => format!("NOT ({})", self.render_cond(c, params)?),
            Cond::Const(b) => (if *b { "1 = 1" } else { "1 = 0" }).to_string(),
        })
    }

    fn render_group(&self, cs: &[Cond], sep: &str, params: &mut Vec<Arg>) -> Result<String, GraphError> {
        let mut parts = Vec::with_capacity(cs.len());
        for c in cs {
            parts.push(self.render_cond(c, params)?);
        }
        Ok(format!("({})", parts.join(sep)))
    }
}

/// INSERT of one or more rows with identical column lists.
#[derive(Clone, Debug)]
pub struct InsertBuilder {
    table: String,
    columns: Vec<String>,
    rows: Vec<Vec<Arg>>,
    returning: Option<String>,
    ignore_conflict: bool,
}

impl InsertBuilder {
    pub fn new(table: impl Into<String>) -> Self {
        InsertBuilder {
            table: table.into(),
            columns: Vec::new(),
            rows: Vec::new(),
            returning: None,
            ignore_conflict: false,
        }
    }

    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn row(mut self, values: Vec<Arg>) -> Self {
        self.rows.push(values);
        self
    }

    pub fn returning(mut self, column: impl Into<String>) -> Self {
        self.returning = Some(column.into());
        self
    }

    /// `ON CONFLICT DO NOTHING`: rows that already exist are skipped.
    pub fn ignore_conflict(mut self) -> Self {
        self.ignore_conflict = true;
        self
    }

    pub fn render(&self) -> QueryBuf {
        let mut q = QueryBuf::new();
        let table = quoted(&self.table);
        if self.columns.is_empty() {
            q.sql = format!("INSERT INTO {} DEFAULT VALUES", table);
        } else {
            let mut tuples = Vec::with_capacity(self.rows.len());
            for row in &self.rows {
                let phs: Vec<String> = row.iter().map(|a| q.push_param(a.clone())).collect();
                tuples.push(format!("({})", phs.join(", ")));
            }
            let cols: Vec<String> = self.columns.iter().map(|c| quoted(c)).collect();
            q.sql = format!("INSERT INTO {} ({}) VALUES {}", table, cols.join(", "), tuples.join(", "));
        }
        if self.ignore_conflict {
            q.sql.push_str(" ON CONFLICT DO NOTHING");
        }
        if let Some(r) = &self.returning {
            q.sql.push_str(&format!(" RETURNING {}", quoted(r)));
        }
        q
    }
}

/// UPDATE scoped by a selector's conditions.
#[derive(Clone, Debug)]
pub struct UpdateBuilder {
    scope: Selector,
    sets: Vec<(String, Arg)>,
}

impl UpdateBuilder {
    pub fn new(scope: Selector) -> Self {
        UpdateBuilder { scope, sets: Vec::new() }
    }

    pub fn set(mut self, column: impl Into<String>, value: Arg) -> Self {
        self.sets.push((column.into(), value));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn render(&self) -> Result<QueryBuf, GraphError> {
        let mut q = QueryBuf::new();
        let mut sets = Vec::with_capacity(self.sets.len());
        for (c, v) in &self.sets {
            let ph = q.push_param(v.clone());
            sets.push(format!("{} = {}", quoted(c), ph));
        }
        let where_clause = self.scope.render_where(&mut q.params)?;
        q.sql = format!("UPDATE {} SET {}{}", quoted(self.scope.table()), sets.join(", "), where_clause);
        Ok(q)
    }
}

/// DELETE scoped by a selector's conditions.
pub fn delete(scope: &Selector) -> Result<QueryBuf, GraphError> {
    let mut q = QueryBuf::new();
    let where_clause = scope.render_where(&mut q.params)?;
    q.sql = format!("DELETE FROM {}{}", quoted(scope.table()), where_clause);
    Ok(q)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn users() -> Selector {
        let types: HashMap<String, FieldType> = [
            ("id".to_string(), FieldType::Int),
            ("name".to_string(), FieldType::String),
            ("age".to_string(), FieldType::Int),
            ("tenant_id".to_string(), FieldType::Int),
        ]
        .into_iter()
        .collect();
        Selector::new("users", "id", Arc::new(types))
    }

    #[test]
    fn select_renders_conditions_in_order() {
        let mut s = users().select(["id", "name"]);
        s.where_(Cond::Cmp { column: "name".into(), op: CmpOp::Eq, value: json!("a8m") });
        s.where_(Cond::In { column: "age".into(), values: vec![json!(30), json!(31)], negate: false });
        s.order_by("id", true).limit(10);
        let q = s.render().unwrap();
        assert_eq!(
            q.sql,
            r#"SELECT "id", "name" FROM "users" WHERE "name" = $1 AND "age" IN ($2, $3) ORDER BY "id" DESC LIMIT 10"#
        );
        assert_eq!(q.params, vec![Arg::Text("a8m".into()), Arg::Int(30), Arg::Int(31)]);
    }

    #[test]
    fn empty_in_and_null_comparisons() {
        let mut s = users();
        s.where_(Cond::In { column: "id".into(), values: vec![], negate: false });
        s.where_(Cond::Cmp { column: "tenant_id".into(), op: CmpOp::Eq, value: Value::Null });
        let q = s.render().unwrap();
        assert_eq!(q.sql, r#"SELECT "id" FROM "users" WHERE 1 = 0 AND "tenant_id" IS NULL"#);
        assert!(q.params.is_empty());
    }

    #[test]
    fn unknown_column_is_rejected() {
        let mut s = users();
        s.where_(Cond::Cmp { column: "nope".into(), op: CmpOp::Eq, value: json!(1) });
        assert!(s.render().is_err());
    }

    #[test]
    fn update_numbers_set_params_before_where() {
        let mut scope = users();
        scope.where_(Cond::Cmp { column: "id".into(), op: CmpOp::Eq, value: json!(5) });
        let q = UpdateBuilder::new(scope)
            .set("name", Arg::Text("X".into()))
            .render()
            .unwrap();
        assert_eq!(q.sql, r#"UPDATE "users" SET "name" = $1 WHERE "id" = $2"#);
        assert_eq!(q.params, vec![Arg::Text("X".into()), Arg::Int(5)]);
    }

    #[test]
    fn insert_multi_row_ignoring_conflicts() {
        let q = InsertBuilder::new("user_groups")
            .columns(["user_id", "group_id"])
            .row(vec![Arg::Int(1), Arg::Int(2)])
            .row(vec![Arg::Int(1), Arg::Int(3)])
            .ignore_conflict()
            .render();
        assert_eq!(
            q.sql,
            r#"INSERT INTO "user_groups" ("user_id", "group_id") VALUES ($1, $2), ($3, $4) ON CONFLICT DO NOTHING"#
        );
        assert_eq!(q.params.len(), 4);
    }

    #[test]
    fn subselect_shares_placeholder_sequence() {
        let mut inner = users();
        inner.where_(Cond::Cmp { column: "tenant_id".into(), op: CmpOp::Eq, value: json!(7) });
        let mut outer = users();
        outer.where_(Cond::Cmp { column: "age".into(), op: CmpOp::Gt, value: json!(18) });
        outer.where_(Cond::InSelect { column: "id".into(), select: Box::new(inner) });
        let q = delete(&outer).unwrap();
        assert_eq!(
            q.sql,
            r#"DELETE FROM "users" WHERE "age" > $1 AND "id" IN (SELECT "id" FROM "users" WHERE "tenant_id" = $2)"#
        );
    }
}
