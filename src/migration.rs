//! Create the tables a resolved schema describes: one per entity, one per M2M edge.
//! Idempotent (IF NOT EXISTS); existing tables are never altered.

use crate::config::ResolvedSchema;
use crate::context::Context;
use crate::driver::{self, Dialect, Driver, Session};
use crate::error::GraphError;
use crate::graph::{FieldType, IdGeneration, IdSpec, Linkage, Relation};
use crate::sql::{quoted, QueryBuf};
use std::sync::Arc;

fn column_type(ty: FieldType, dialect: Dialect) -> &'static str {
    match (dialect, ty) {
        (Dialect::Postgres, FieldType::Bool) => "BOOLEAN",
        (Dialect::Postgres, FieldType::Int) => "BIGINT",
        (Dialect::Postgres, FieldType::Float) => "DOUBLE PRECISION",
        (Dialect::Postgres, FieldType::String | FieldType::Enum) => "TEXT",
        (Dialect::Postgres, FieldType::Uuid) => "UUID",
        (Dialect::Postgres, FieldType::Time) => "TIMESTAMPTZ",
        (Dialect::Postgres, FieldType::Json) => "JSONB",
        (Dialect::Sqlite, FieldType::Bool) => "BOOLEAN",
        (Dialect::Sqlite, FieldType::Int) => "INTEGER",
        (Dialect::Sqlite, FieldType::Float) => "REAL",
        (Dialect::Sqlite, _) => "TEXT",
    }
}

fn id_def(id: &IdSpec, dialect: Dialect) -> String {
    let col = quoted(&id.column);
    match (id.generation, id.ty, dialect) {
        (IdGeneration::Store, FieldType::Int, Dialect::Postgres) => format!("{} BIGSERIAL PRIMARY KEY", col),
        (IdGeneration::Store, FieldType::Int, Dialect::Sqlite) => format!("{} INTEGER PRIMARY KEY AUTOINCREMENT", col),
        _ => format!("{} {} PRIMARY KEY", col, column_type(id.ty, dialect)),
    }
}

struct ForeignKey {
    table: String,
    column: String,
    references: (String, String),
}

struct TableDef {
    name: String,
    columns: Vec<String>,
    constraints: Vec<String>,
}

impl TableDef {
    fn has_column(&self, name: &str) -> bool {
        let prefix = format!("{} ", quoted(name));
        self.columns.iter().any(|c| c.starts_with(&prefix))
    }
}

fn references(fk: &(String, String)) -> String {
    format!("REFERENCES {} ({})", quoted(&fk.0), quoted(&fk.1))
}

/// DDL for `schema`, in execution order. SQLite gets foreign keys inline; Postgres adds them
/// after every table exists so entity order does not matter.
pub fn statements(schema: &ResolvedSchema, dialect: Dialect) -> Vec<String> {
    let mut tables: Vec<TableDef> = schema
        .entities()
        .iter()
        .map(|e| {
            let node = &e.node;
            let mut columns = vec![id_def(&node.id, dialect)];
            for c in &node.columns {
                let mut def = format!("{} {}", quoted(&c.name), column_type(c.ty, dialect));
                if !c.optional {
                    def.push_str(" NOT NULL");
                }
                if c.unique {
                    def.push_str(" UNIQUE");
                }
                columns.push(def);
            }
            TableDef {
                name: node.table.clone(),
                columns,
                constraints: Vec::new(),
            }
        })
        .collect();
    let mut fks: Vec<ForeignKey> = Vec::new();

    for e in schema.entities() {
        let owner = &e.node;
        let owner_ref = (owner.table.clone(), owner.id.column.clone());
        for edge in owner.edges.iter().filter(|edge| !edge.inverse) {
            match &edge.linkage {
                Linkage::ForeignKey { column, nullable } => {
                    let Some(t) = tables.iter_mut().find(|t| t.name == edge.target.table) else {
                        continue;
                    };
                    if t.has_column(column) {
                        continue;
                    }
                    let mut def = format!("{} {}", quoted(column), column_type(owner.id.ty, dialect));
                    if !nullable {
                        def.push_str(" NOT NULL");
                    }
                    if edge.rel == Relation::O2O {
                        def.push_str(" UNIQUE");
                    }
                    if dialect == Dialect::Sqlite {
                        def.push(' ');
                        def.push_str(&references(&owner_ref));
                    }
                    t.columns.push(def);
                    fks.push(ForeignKey {
                        table: edge.target.table.clone(),
                        column: column.clone(),
                        references: owner_ref.clone(),
                    });
                }
                Linkage::JoinTable { table, columns, fields } => {
                    if tables.iter().any(|t| &t.name == table) {
                        continue;
                    }
                    let target_ref = (edge.target.table.clone(), edge.target.id_column.clone());
                    let mut defs = Vec::with_capacity(2 + fields.len());
                    for (col, ty, r) in [
                        (&columns[0], owner.id.ty, &owner_ref),
                        (&columns[1], edge.target.id_type, &target_ref),
                    ] {
                        let mut def = format!("{} {} NOT NULL", quoted(col), column_type(ty, dialect));
                        if dialect == Dialect::Sqlite {
                            def.push_str(&format!(" {} ON DELETE CASCADE", references(r)));
                        }
                        defs.push(def);
                        fks.push(ForeignKey {
                            table: table.clone(),
                            column: col.clone(),
                            references: r.clone(),
                        });
                    }
                    for f in fields {
                        let mut def = format!("{} {}", quoted(&f.name), column_type(f.ty, dialect));
                        if !f.optional {
                            def.push_str(" NOT NULL");
                        }
                        defs.push(def);
                    }
                    tables.push(TableDef {
                        name: table.clone(),
                        columns: defs,
                        constraints: vec![format!("PRIMARY KEY ({}, {})", quoted(&columns[0]), quoted(&columns[1]))],
                    });
                }
            }
        }
    }

    let mut out: Vec<String> = tables
        .iter()
        .map(|t| {
            let body: Vec<&str> = t.columns.iter().chain(&t.constraints).map(String::as_str).collect();
            format!("CREATE TABLE IF NOT EXISTS {} (\n  {}\n)", quoted(&t.name), body.join(",\n  "))
        })
        .collect();

    if dialect == Dialect::Postgres {
        let join_tables: Vec<&str> = tables
            .iter()
            .filter(|t| t.constraints.iter().any(|c| c.starts_with("PRIMARY KEY")))
            .map(|t| t.name.as_str())
            .collect();
        for fk in &fks {
            let name = format!("{}_{}_fkey", fk.table, fk.column);
            let action = if join_tables.contains(&fk.table.as_str()) {
                " ON DELETE CASCADE"
            } else {
                ""
            };
            out.push(format!(
                "DO $$ BEGIN ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) {}{}; \
                 EXCEPTION WHEN duplicate_object THEN NULL; END $$",
                quoted(&fk.table),
                quoted(&name),
                quoted(&fk.column),
                references(&fk.references),
                action
            ));
        }
    }
    out
}

/// Run [`statements`] in one transaction.
pub async fn create_tables(ctx: &Context, driver: Arc<dyn Driver>, schema: &ResolvedSchema) -> Result<(), GraphError> {
    let dialect = driver.dialect();
    let stmts = statements(schema, dialect);
    let mut session = Session::new(driver);
    let res = async {
        let tx = session.tx(ctx).await?;
        for sql in &stmts {
            let q = QueryBuf {
                sql: sql.clone(),
                params: Vec::new(),
            };
            driver::exec(ctx, tx, &q).await?;
        }
        Ok::<_, GraphError>(())
    }
    .await;
    match res {
        Ok(()) => {
            session.commit(ctx).await?;
            tracing::info!(statements = stmts.len(), ?dialect, "tables created");
            Ok(())
        }
        Err(e) => {
            session.rollback().await;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_resolved;

    const SCHEMA: &str = r#"{
        "entities": [
            {
                "name": "User",
                "fields": [{"name": "email", "type": "string", "unique": true},
                           {"name": "nickname", "type": "string", "optional": true}],
                "edges": [
                    {"name": "pets", "target": "Pet", "relation": "o2m"},
                    {"name": "card", "target": "Card", "relation": "o2o"},
                    {"name": "groups", "target": "Group", "relation": "m2m",
                     "fields": [{"name": "role", "type": "string", "optional": true}]}
                ]
            },
            {"name": "Pet", "edges": [{"name": "owner", "target": "User", "ref": "pets", "required": true}]},
            {"name": "Card", "edges": [{"name": "holder", "target": "User", "ref": "card"}]},
            {"name": "Group", "id": {"type": "uuid", "generation": "uuid"}}
        ]
    }"#;

    #[test]
    fn sqlite_inlines_foreign_keys() {
        let schema = load_resolved(SCHEMA).unwrap();
        let stmts = statements(&schema, Dialect::Sqlite);
        assert_eq!(stmts.len(), 5);
        assert!(stmts[0].contains(r#""id" INTEGER PRIMARY KEY AUTOINCREMENT"#), "{}", stmts[0]);
        assert!(stmts[0].contains(r#""email" TEXT NOT NULL UNIQUE"#));
        assert!(stmts[0].contains(r#""nickname" TEXT"#) && !stmts[0].contains(r#""nickname" TEXT NOT NULL"#));
        assert!(stmts[1].contains(r#""user_pets" INTEGER NOT NULL REFERENCES "users" ("id")"#), "{}", stmts[1]);
        assert!(stmts[2].contains(r#""user_card" INTEGER UNIQUE REFERENCES "users" ("id")"#), "{}", stmts[2]);
        assert!(stmts[3].contains(r#""id" TEXT PRIMARY KEY"#));
        let join = &stmts[4];
        assert!(join.starts_with(r#"CREATE TABLE IF NOT EXISTS "user_groups""#), "{}", join);
        assert!(join.contains(r#"PRIMARY KEY ("user_id", "group_id")"#));
        assert!(join.contains(r#""group_id" TEXT NOT NULL REFERENCES "groups" ("id") ON DELETE CASCADE"#));
        assert!(join.contains(r#""role" TEXT"#));
    }

    #[test]
    fn postgres_adds_constraints_after_tables() {
        let schema = load_resolved(SCHEMA).unwrap();
        let stmts = statements(&schema, Dialect::Postgres);
        assert!(stmts[0].contains(r#""id" BIGSERIAL PRIMARY KEY"#));
        assert!(stmts[3].contains(r#""id" UUID PRIMARY KEY"#));
        assert!(!stmts[1].contains("REFERENCES"));
        let alters: Vec<&String> = stmts.iter().filter(|s| s.starts_with("DO $$")).collect();
        assert_eq!(alters.len(), 4);
        assert!(alters[0].contains(r#"ALTER TABLE "pets" ADD CONSTRAINT "pets_user_pets_fkey""#));
        assert!(alters[3].contains("ON DELETE CASCADE"));
    }
}
