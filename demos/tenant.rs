//! Demo: multi-tenant notes on in-memory SQLite. Tenants only ever see their own rows.
//!
//! Run: `cargo run --example tenant` (set `RUST_LOG=entgraph=debug` to see every statement).

use entgraph::privacy::{AllowIfRole, AlwaysAllow, DenyIfNoViewer, OnMutation, TenantRule};
use entgraph::{load_resolved, Context, Engine, EntityPolicy, Predicate, SqliteDriver, Verdict, Viewer};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const SCHEMA: &str = r#"{
    "entities": [
        {
            "name": "Tenant",
            "fields": [{"name": "name", "type": "string", "unique": true}],
            "edges": [{"name": "notes", "target": "Note", "relation": "o2m"}]
        },
        {
            "name": "Note",
            "fields": [
                {"name": "tenant", "type": "string"},
                {"name": "body", "type": "string", "validation": {"max_length": 280}},
                {"name": "created_at", "type": "time", "default": {"expression": "now"}, "immutable": true}
            ],
            "edges": [{"name": "owner", "target": "Tenant", "ref": "notes"}]
        }
    ]
}"#;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("entgraph=info".parse()?))
        .init();

    let schema = load_resolved(SCHEMA)?;
    let driver = Arc::new(SqliteDriver::memory().await?);
    let engine = Engine::builder(driver, schema)
        .policy(
            "Tenant",
            EntityPolicy::new(Verdict::deny("tenants are managed by admins"))
                .query_rule(AlwaysAllow)
                .mutation_rule(AllowIfRole::new("admin")),
        )
        .policy(
            "Note",
            EntityPolicy::new(Verdict::Allow)
                .rule(OnMutation(DenyIfNoViewer))
                .rule(TenantRule::new("tenant")),
        )
        .build()?;
    engine.create_tables(&Context::new()).await?;

    let admin = Context::new().with_viewer(Viewer::new(0).with_role("admin"));
    for name in ["acme", "globex"] {
        engine.save(&admin, engine.create("Tenant")?.set("name", name)).await?;
    }

    for (tenant, body) in [("acme", "ship the rockets"), ("acme", "order more anvils"), ("globex", "world domination")] {
        let ctx = Context::new().with_viewer(Viewer::new(1).with_tenant(tenant));
        let owner = engine
            .only(&ctx, engine.query("Tenant")?.where_p(Predicate::eq("name", tenant)))
            .await?;
        let note = engine
            .create("Note")?
            .set("tenant", tenant)
            .set("body", body)
            .add_edge("owner", [owner.id]);
        engine.save(&ctx, note).await?;
    }

    let acme = Context::new().with_viewer(Viewer::new(1).with_tenant("acme"));
    let notes = engine.all(&acme, engine.query("Note")?.order_asc("id").with_edge("owner")).await?;
    for n in &notes {
        tracing::info!(id = %n.id, body = %n.fields["body"], owner = ?n.edge("owner").first().map(|o| &o.fields["name"]), "acme note");
    }

    let wiped = engine
        .execute(&acme, engine.delete("Note")?)
        .await?
        .affected();
    tracing::info!(wiped, "acme deleted every note it can see");

    let everyone = Context::new().with_decision(Verdict::Allow);
    let left = engine.count(&everyone, engine.query("Note")?).await?;
    tracing::info!(left, "notes left across all tenants");

    if let Err(e) = engine.save(&Context::new(), engine.create("Note")?.set("tenant", "acme").set("body", "anon")).await {
        tracing::info!(kind = ?e.kind(), error = %e, "anonymous create rejected");
    }
    Ok(())
}
