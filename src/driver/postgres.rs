//! PostgreSQL backend over sqlx.

use super::{Dialect, Driver, ExecQuerier, Row, Tx};
use crate::error::{ConfigError, GraphError};
use crate::graph::FieldType;
use crate::sql::{Arg, QueryBuf};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{ConnectOptions, PgPool, Postgres};
use std::str::FromStr;

#[derive(Clone)]
pub struct PgDriver {
    pool: PgPool,
}

impl PgDriver {
    pub fn new(pool: PgPool) -> Self {
        PgDriver { pool }
    }

    /// Create the database if missing, then open a pool.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, GraphError> {
        ensure_database_exists(database_url).await?;
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        tracing::info!(max_connections, "postgres pool ready");
        Ok(PgDriver { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Driver for PgDriver {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn begin(&self) -> Result<Box<dyn Tx>, GraphError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTx { tx }))
    }
}

struct PgTx {
    tx: sqlx::Transaction<'static, Postgres>,
}

fn bind<'q>(q: Query<'q, Postgres, PgArguments>, arg: &Arg) -> Query<'q, Postgres, PgArguments> {
    match arg {
        Arg::Null(ty) => match ty {
            FieldType::Bool => q.bind(None::<bool>),
            FieldType::Int => q.bind(None::<i64>),
            FieldType::Float => q.bind(None::<f64>),
            FieldType::String | FieldType::Enum => q.bind(None::<String>),
            FieldType::Uuid => q.bind(None::<uuid::Uuid>),
            FieldType::Time => q.bind(None::<DateTime<Utc>>),
            FieldType::Json => q.bind(None::<Value>),
        },
        Arg::Bool(b) => q.bind(*b),
        Arg::Int(i) => q.bind(*i),
        Arg::Float(f) => q.bind(*f),
        Arg::Text(s) => q.bind(s.clone()),
        Arg::Uuid(u) => q.bind(*u),
        Arg::Time(t) => q.bind(*t),
        Arg::Json(v) => q.bind(v.clone()),
    }
}

fn prepare(buf: &QueryBuf) -> Query<'_, Postgres, PgArguments> {
    buf.params.iter().fold(sqlx::query(&buf.sql), bind)
}

#[async_trait]
impl ExecQuerier for PgTx {
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
impl Tx for PgTx {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
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

fn row_to_json(row: &PgRow) -> Row {
    use sqlx::Column;
    use sqlx::Row as _;
    row.columns()
        .iter()
        .map(|col| (col.name().to_string(), cell_to_value(row, col.name())))
        .collect()
}

fn cell_to_value(row: &PgRow, name: &str) -> Value {
    use sqlx::Row as _;
    if let Ok(Some(n)) = row.try_get::<Option<i16>, _>(name) {
        return Value::Number(n.into());
    }
    if let Ok(Some(n)) = row.try_get::<Option<i32>, _>(name) {
        return Value::Number(n.into());
    }
    if let Ok(Some(n)) = row.try_get::<Option<i64>, _>(name) {
        return Value::Number(n.into());
    }
    if let Ok(Some(n)) = row.try_get::<Option<f32>, _>(name) {
        if let Some(n) = serde_json::Number::from_f64(n as f64) {
            return Value::Number(n);
        }
    }
    if let Ok(Some(n)) = row.try_get::<Option<f64>, _>(name) {
        if let Some(n) = serde_json::Number::from_f64(n) {
            return Value::Number(n);
        }
    }
    if let Ok(Some(b)) = row.try_get::<Option<bool>, _>(name) {
        return Value::Bool(b);
    }
    if let Ok(Some(u)) = row.try_get::<Option<uuid::Uuid>, _>(name) {
        return Value::String(u.to_string());
    }
    if let Ok(Some(d)) = row.try_get::<Option<DateTime<Utc>>, _>(name) {
        return Value::String(d.to_rfc3339());
    }
    if let Ok(Some(d)) = row.try_get::<Option<chrono::NaiveDateTime>, _>(name) {
        return Value::String(d.format("%Y-%m-%dT%H:%M:%S%.f").to_string());
    }
    if let Ok(Some(s)) = row.try_get::<Option<String>, _>(name) {
        return Value::String(s);
    }
    if let Ok(Some(j)) = row.try_get::<Option<Value>, _>(name) {
        return j;
    }
    Value::Null
}

/// Ensure the database named in `database_url` exists, creating it through the
/// `postgres` maintenance database if not. Call before opening the main pool.
pub async fn ensure_database_exists(database_url: &str) -> Result<(), GraphError> {
    let (admin_url, db_name) = split_database_url(database_url)?;
    if db_name.is_empty() || db_name == "postgres" {
        return Ok(());
    }
    let opts = sqlx::postgres::PgConnectOptions::from_str(&admin_url)
        .map_err(|e| ConfigError::Load(format!("invalid DATABASE_URL: {}", e)))?;
    let mut conn: sqlx::PgConnection = opts.connect().await?;
    let exists: (bool,) = sqlx::query_as("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
        .bind(&db_name)
        .fetch_one(&mut conn)
        .await?;
    if !exists.0 {
        tracing::info!(database = %db_name, "creating database");
        sqlx::query(&format!("CREATE DATABASE {}", crate::sql::quoted(&db_name)))
            .execute(&mut conn)
            .await?;
    }
    Ok(())
}

/// (maintenance url, database name) from a connection url.
fn split_database_url(url: &str) -> Result<(String, String), ConfigError> {
    let path_start = url
        .rfind('/')
        .ok_or_else(|| ConfigError::Load("DATABASE_URL: no path".into()))?
        + 1;
    let db_name = url[path_start..].split('?').next().unwrap_or("").trim();
    Ok((format!("{}postgres", &url[..path_start]), db_name.to_string()))
}
