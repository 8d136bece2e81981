//! Store seam: the compiler talks to a [`Tx`], never to a concrete pool.

mod postgres;
mod sqlite;

pub use postgres::{ensure_database_exists, PgDriver};
pub use sqlite::SqliteDriver;

use crate::context::Context;
use crate::error::GraphError;
use crate::sql::QueryBuf;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;

/// One decoded result row, column name to JSON value.
pub type Row = Map<String, Value>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

#[async_trait]
pub trait ExecQuerier: Send {
    /// Run a statement and return the number of rows it touched.
    async fn exec(&mut self, q: &QueryBuf) -> Result<u64, GraphError>;
    async fn query(&mut self, q: &QueryBuf) -> Result<Vec<Row>, GraphError>;
}

/// An open store transaction. Dropping it without commit rolls back.
#[async_trait]
pub trait Tx: ExecQuerier {
    fn dialect(&self) -> Dialect;
    async fn commit(self: Box<Self>) -> Result<(), GraphError>;
    async fn rollback(self: Box<Self>) -> Result<(), GraphError>;
}

#[async_trait]
pub trait Driver: Send + Sync {
    fn dialect(&self) -> Dialect;
    async fn begin(&self) -> Result<Box<dyn Tx>, GraphError>;
}

/// Execute `q` inside `tx`, aborting on cancellation or deadline.
pub async fn exec(ctx: &Context, tx: &mut dyn Tx, q: &QueryBuf) -> Result<u64, GraphError> {
    tracing::debug!(sql = %q.sql, params = ?q.params, "exec");
    ctx.run(tx.exec(q)).await
}

pub async fn query(ctx: &Context, tx: &mut dyn Tx, q: &QueryBuf) -> Result<Vec<Row>, GraphError> {
    tracing::debug!(sql = %q.sql, params = ?q.params, "query");
    ctx.run(tx.query(q)).await
}

/// Transaction scope of one logical operation. The transaction opens on first use.
pub struct Session {
    driver: Arc<dyn Driver>,
    tx: Option<Box<dyn Tx>>,
}

impl Session {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Session { driver, tx: None }
    }

    pub fn dialect(&self) -> Dialect {
        self.driver.dialect()
    }

    pub fn is_open(&self) -> bool {
        self.tx.is_some()
    }

    pub async fn tx(&mut self, ctx: &Context) -> Result<&mut dyn Tx, GraphError> {
        let tx = match self.tx.take() {
            Some(tx) => tx,
            None => ctx.run(self.driver.begin()).await?,
        };
        Ok(self.tx.insert(tx).as_mut())
    }

    /// Commit if a transaction was opened. A cancelled context rolls back instead.
    pub async fn commit(mut self, ctx: &Context) -> Result<(), GraphError> {
        let Some(tx) = self.tx.take() else {
            return Ok(());
        };
        if let Err(e) = ctx.check() {
            if let Err(rb) = tx.rollback().await {
                tracing::warn!(error = %rb, "rollback after cancellation failed");
            }
            return Err(e);
        }
        tx.commit().await
    }

    pub async fn rollback(mut self) {
        if let Some(tx) = self.tx.take() {
            if let Err(e) = tx.rollback().await {
                tracing::warn!(error = %e, "rollback failed");
            }
        }
    }
}
