//! SQLite backend over sqlx, used for in-memory stores in tests and demos.

use super::{Dialect, Driver, ExecQuerier, Row, Tx};
use crate::error::GraphError;
use crate::sql::{Arg, QueryBuf};
use async_trait::async_trait;
use chrono::SecondsFormat;
use serde_json::Value;
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Sqlite, SqlitePool};
use std::str::FromStr;

#[derive(Clone)]
pub struct SqliteDriver {
    pool: SqlitePool,
}

impl SqliteDriver {
    pub fn new(pool: SqlitePool) -> Self {
        SqliteDriver { pool }
    }

    /// Private in-memory database with foreign keys enforced. A single connection
    /// that never expires keeps the database alive for the driver's lifetime.
    pub async fn memory() -> Result<Self, GraphError> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;
        Ok(SqliteDriver { pool })
    }

    pub async fn connect(url: &str) -> Result<Self, GraphError> {
        let opts = SqliteConnectOptions::from_str(url)?
            .foreign_keys(true)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(opts).await?;
        Ok(SqliteDriver { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Driver for SqliteDriver {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn begin(&self) -> Result<Box<dyn Tx>, GraphError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqliteTx { tx }))
    }
}

struct SqliteTx {
    tx: sqlx::Transaction<'static, Sqlite>,
}

/// SQLite has no uuid, timestamp or json storage class: those travel as text.
fn bind<'q>(q: Query<'q, Sqlite, SqliteArguments<'q>>, arg: &Arg) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match arg {
        Arg::Null(_) => q.bind(None::<String>),
        Arg::Bool(b) => q.bind(*b),
        Arg::Int(i) => q.bind(*i),
        Arg::Float(f) => q.bind(*f),
        Arg::Text(s) => q.bind(s.clone()),
        Arg::Uuid(u) => q.bind(u.to_string()),
        Arg::Time(t) => q.bind(t.to_rfc3339_opts(SecondsFormat::Micros, true)),
        Arg::Json(v) => q.bind(v.to_string()),
    }
}

fn prepare(buf: &QueryBuf) -> Query<'_, Sqlite, SqliteArguments<'_>> {
    buf.params.iter().fold(sqlx::query(&buf.sql), bind)
}

#[async_trait]
impl ExecQuerier for SqliteTx {
    async fn exec(&mut self, q: &QueryBuf) -> Result<u64, GraphError> {
        let done = prepare(q).execute(&mut *self.tx).await?;
        Ok(done.rows_affected())
    }

    async fn query(&mut self, q: &QueryBuf) -> Result<Vec<Row>, GraphError> {
        let rows = prepare(q).fetch_all(&mut *self.tx).await?;
        Ok(rows.iter().map(row_to_json).collect())
    }
}

#[async_trait]
impl Tx for SqliteTx {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn commit(self: Box<Self>) -> Result<(), GraphError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), GraphError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

fn row_to_json(row: &SqliteRow) -> Row {
    use sqlx::Column;
    use sqlx::Row as _;
    row.columns()
        .iter()
        .map(|col| (col.name().to_string(), cell_to_value(row, col.name())))
        .collect()
}

/// Decode by the value's storage class; callers re-type by declared field type.
fn cell_to_value(row: &SqliteRow, name: &str) -> Value {
    use sqlx::Row as _;
    if let Ok(Some(n)) = row.try_get::<Option<i64>, _>(name) {
        return Value::Number(n.into());
    }
    if let Ok(Some(n)) = row.try_get::<Option<f64>, _>(name) {
        if let Some(n) = serde_json::Number::from_f64(n) {
            return Value::Number(n);
        }
    }
    if let Ok(Some(s)) = row.try_get::<Option<String>, _>(name) {
        return Value::String(s);
    }
    Value::Null
}
