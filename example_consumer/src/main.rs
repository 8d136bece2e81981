//! Example consumer: a separate Rust project that uses entgraph against Postgres.
//!
//! Run from repo root: `cargo run -p example-consumer`
//! Needs `ENTGRAPH_SCHEMA_PATH` pointing at a schema JSON file; `DATABASE_URL` defaults to a local database.

use entgraph::{load_schema_file, resolve, Context, Engine, EngineSettings, PgDriver};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("entgraph=info")),
        )
        .init();

    let settings = EngineSettings::from_env()?;
    let schema_path = settings
        .schema_path
        .clone()
        .ok_or("ENTGRAPH_SCHEMA_PATH is not set")?;
    let schema = resolve(&load_schema_file(&schema_path)?)?;

    let driver = PgDriver::connect(&settings.database_url, settings.max_connections).await?;
    let engine = Engine::builder(Arc::new(driver), schema)
        .placement(settings.policy_placement)
        .build()?;

    let ctx = Context::new();
    engine.create_tables(&ctx).await?;
    for e in engine.schema().entities() {
        let n = engine.count(&ctx, engine.query(&e.name)?).await?;
        tracing::info!(entity = %e.name, rows = n, "ready");
    }
    Ok(())
}
