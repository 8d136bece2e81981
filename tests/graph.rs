use entgraph::{load_resolved, ConstraintKind, Context, Engine, ErrorKind, Predicate, SqliteDriver};
use serde_json::{json, Value};
use std::sync::Arc;

const SCHEMA: &str = r#"{
    "entities": [
        {
            "name": "User",
            "fields": [
                {"name": "email", "type": "string", "unique": true, "validation": {"format": "email"}},
                {"name": "name", "type": "string"},
                {"name": "nickname", "type": "string", "optional": true},
                {"name": "active", "type": "bool", "default": true}
            ],
            "edges": [
                {"name": "pets", "target": "Pet", "relation": "o2m"},
                {"name": "groups", "target": "Group", "relation": "m2m",
                 "fields": [{"name": "role", "type": "string", "optional": true}]}
            ]
        },
        {
            "name": "Pet",
            "fields": [{"name": "name", "type": "string"}],
            "edges": [{"name": "owner", "target": "User", "ref": "pets", "required": true}]
        },
        {
            "name": "Group",
            "fields": [{"name": "name", "type": "string", "unique": true}],
            "edges": [{"name": "members", "target": "User", "ref": "groups"}]
        }
    ]
}"#;

async fn engine() -> Engine {
    let schema = load_resolved(SCHEMA).unwrap();
    let driver = Arc::new(SqliteDriver::memory().await.unwrap());
    let engine = Engine::builder(driver, schema).build().unwrap();
    engine.create_tables(&Context::new()).await.unwrap();
    engine
}

async fn user(engine: &Engine, email: &str) -> Value {
    let m = engine.create("User").unwrap().set("email", email).set("name", "a8m");
    engine.save(&Context::new(), m).await.unwrap().id
}

#[tokio::test]
async fn created_node_reads_back_with_same_fields() {
    let engine = engine().await;
    let ctx = Context::new();
    let created = engine
        .save(&ctx, engine.create("User").unwrap().set("email", "a@b.io").set("name", "Ariel"))
        .await
        .unwrap();
    assert_eq!(created.fields["active"], json!(true));
    assert_eq!(created.fields["nickname"], Value::Null);

    let read = engine
        .only(&ctx, engine.query("User").unwrap().where_p(Predicate::id_eq(created.id.clone())))
        .await
        .unwrap();
    assert_eq!(read.id, created.id);
    assert_eq!(read.fields, created.fields);
}

#[tokio::test]
async fn missing_required_field_is_rejected_before_the_store() {
    let engine = engine().await;
    let err = engine
        .save(&Context::new(), engine.create("User").unwrap().set("email", "a@b.io"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(err.to_string().contains("name"), "{}", err);

    let err = engine
        .save(&Context::new(), engine.create("User").unwrap().set("email", "nope").set("name", "x"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(engine.count(&Context::new(), engine.query("User").unwrap()).await.unwrap(), 0);
}

#[tokio::test]
async fn duplicate_unique_field_is_a_constraint_violation() {
    let engine = engine().await;
    user(&engine, "a@b.io").await;
    let err = engine
        .save(&Context::new(), engine.create("User").unwrap().set("email", "a@b.io").set("name", "b"))
        .await
        .unwrap_err();
    assert_eq!(err.as_constraint().map(|c| c.kind), Some(ConstraintKind::Unique));
}

#[tokio::test]
async fn m2m_add_is_idempotent_and_remove_restores() {
    let engine = engine().await;
    let ctx = Context::new();
    let uid = user(&engine, "a@b.io").await;
    let gid = engine
        .save(&ctx, engine.create("Group").unwrap().set("name", "admins"))
        .await
        .unwrap()
        .id;

    for _ in 0..2 {
        let m = engine
            .update("User")
            .unwrap()
            .where_p(Predicate::id_eq(uid.clone()))
            .add_edge("groups", [gid.clone()])
            .edge_field("groups", "role", "owner");
        assert_eq!(engine.execute(&ctx, m).await.unwrap().affected(), 1);
    }
    let loaded = engine
        .only(&ctx, engine.query("User").unwrap().with_edge("groups"))
        .await
        .unwrap();
    assert_eq!(loaded.edge("groups").len(), 1);
    assert_eq!(loaded.edge("groups")[0].id, gid);
    assert_eq!(loaded.edge("groups")[0].edge_fields["role"], json!("owner"));

    let group = engine
        .only(&ctx, engine.query("Group").unwrap().with_edge("members"))
        .await
        .unwrap();
    assert_eq!(group.edge("members").len(), 1);
    assert_eq!(group.edge("members")[0].id, uid);

    let m = engine
        .update("User")
        .unwrap()
        .where_p(Predicate::id_eq(uid.clone()))
        .remove_edge("groups", [gid.clone()]);
    engine.execute(&ctx, m).await.unwrap();
    let loaded = engine
        .only(&ctx, engine.query("User").unwrap().with_edge("groups"))
        .await
        .unwrap();
    assert!(loaded.edge("groups").is_empty());
    // Endpoints survive the unlink.
    assert_eq!(engine.count(&ctx, engine.query("Group").unwrap()).await.unwrap(), 1);
    assert_eq!(engine.count(&ctx, engine.query("User").unwrap()).await.unwrap(), 1);
}

#[tokio::test]
async fn deleting_a_referenced_owner_is_restricted() {
    let engine = engine().await;
    let ctx = Context::new();
    let uid = user(&engine, "a@b.io").await;
    let pet = engine
        .save(&ctx, engine.create("Pet").unwrap().set("name", "pedro").add_edge("owner", [uid.clone()]))
        .await
        .unwrap();

    let err = engine
        .delete_one(&ctx, engine.delete("User").unwrap(), uid.clone())
        .await
        .unwrap_err();
    assert_eq!(err.as_constraint().map(|c| c.kind), Some(ConstraintKind::ForeignKey));

    let still = engine
        .only(
            &ctx,
            engine
                .query("Pet")
                .unwrap()
                .where_p(Predicate::id_eq(pet.id.clone()))
                .with_edge("owner"),
        )
        .await
        .unwrap();
    assert_eq!(still.edge("owner")[0].id, uid);
    assert_eq!(engine.count(&ctx, engine.query("User").unwrap()).await.unwrap(), 1);
}

#[tokio::test]
async fn removing_a_required_edge_fails() {
    let engine = engine().await;
    let ctx = Context::new();
    let uid = user(&engine, "a@b.io").await;
    let pet = engine
        .save(&ctx, engine.create("Pet").unwrap().set("name", "pedro").add_edge("owner", [uid]))
        .await
        .unwrap();
    let m = engine
        .update("Pet")
        .unwrap()
        .where_p(Predicate::id_eq(pet.id))
        .clear_edge("owner");
    let err = engine.execute(&ctx, m).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RequiredEdge);
}

#[tokio::test]
async fn o2m_targets_are_linked_after_insert() {
    let engine = engine().await;
    let ctx = Context::new();
    let owner = user(&engine, "a@b.io").await;
    let mut pets = Vec::new();
    for name in ["pedro", "xabi"] {
        pets.push(
            engine
                .save(&ctx, engine.create("Pet").unwrap().set("name", name).add_edge("owner", [owner.clone()]))
                .await
                .unwrap()
                .id,
        );
    }
    let other = engine
        .save(
            &ctx,
            engine
                .create("User")
                .unwrap()
                .set("email", "c@d.io")
                .set("name", "c")
                .add_edge("pets", pets.clone()),
        )
        .await
        .unwrap_err();
    // Both pets already have an owner.
    assert_eq!(other.as_constraint().map(|c| c.kind), Some(ConstraintKind::Edge));
    assert_eq!(engine.count(&ctx, engine.query("User").unwrap()).await.unwrap(), 1);

    let loaded = engine
        .only(&ctx, engine.query("User").unwrap().with_edge("pets"))
        .await
        .unwrap();
    let mut got: Vec<Value> = loaded.edge("pets").iter().map(|p| p.id.clone()).collect();
    got.sort_by_key(|v| v.as_i64());
    assert_eq!(got, pets);
}

#[tokio::test]
async fn update_of_missing_id_affects_nothing() {
    let engine = engine().await;
    let ctx = Context::new();
    let m = engine.update("User").unwrap().where_p(Predicate::id_eq(5)).set("name", "X");
    let out = engine.execute(&ctx, m).await.unwrap();
    assert_eq!(out.affected(), 0);

    let err = engine
        .update_one(&ctx, engine.update("User").unwrap().set("name", "X"), 5)
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    let err = engine
        .delete_one(&ctx, engine.delete("User").unwrap(), 5)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn update_one_returns_the_fresh_node() {
    let engine = engine().await;
    let ctx = Context::new();
    let uid = user(&engine, "a@b.io").await;
    let node = engine
        .update_one(&ctx, engine.update("User").unwrap().set("nickname", "ariel").set("active", false), uid.clone())
        .await
        .unwrap();
    assert_eq!(node.fields["nickname"], json!("ariel"));
    assert_eq!(node.fields["active"], json!(false));

    let node = engine
        .update_one(&ctx, engine.update("User").unwrap().clear_field("nickname"), uid)
        .await
        .unwrap();
    assert_eq!(node.fields["nickname"], Value::Null);
}

#[tokio::test]
async fn immutable_id_cannot_be_updated() {
    let engine = engine().await;
    let uid = user(&engine, "a@b.io").await;
    let err = engine
        .update_one(&Context::new(), engine.update("User").unwrap().set("id", 99), uid)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn query_modes() {
    let engine = engine().await;
    let ctx = Context::new();
    for email in ["a@b.io", "c@d.io", "e@f.io"] {
        user(&engine, email).await;
    }
    let q = || engine.query("User").unwrap();
    assert_eq!(engine.count(&ctx, q()).await.unwrap(), 3);
    assert!(engine.exist(&ctx, q().where_p(Predicate::eq("email", "c@d.io"))).await.unwrap());
    assert!(!engine.exist(&ctx, q().where_p(Predicate::eq("email", "x@y.io"))).await.unwrap());
    assert_eq!(engine.ids(&ctx, q().order_asc("id")).await.unwrap(), [json!(1), json!(2), json!(3)]);

    let last = engine.first(&ctx, q().order_desc("email")).await.unwrap();
    assert_eq!(last.fields["email"], json!("e@f.io"));

    let page = engine.all(&ctx, q().order_asc("id").limit(1).offset(1)).await.unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].id, json!(2));

    let err = engine.only(&ctx, q()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotSingular);
    let err = engine
        .first(&ctx, q().where_p(Predicate::eq("email", "x@y.io")))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn atomic_batch_rolls_back_on_failure() {
    let engine = engine().await;
    let ctx = Context::new();
    let batch = |emails: [&str; 3]| {
        emails
            .iter()
            .map(|e| engine.create("User").unwrap().set("email", *e).set("name", "n"))
            .collect::<Vec<_>>()
    };

    let err = engine
        .create_bulk(&ctx, batch(["a@b.io", "c@d.io", "a@b.io"]))
        .await
        .unwrap_err();
    assert!(err.is_constraint());
    assert_eq!(engine.count(&ctx, engine.query("User").unwrap()).await.unwrap(), 0);

    let nodes = engine
        .create_bulk(&ctx, batch(["a@b.io", "c@d.io", "e@f.io"]))
        .await
        .unwrap();
    let emails: Vec<&Value> = nodes.iter().map(|n| &n.fields["email"]).collect();
    assert_eq!(emails, [&json!("a@b.io"), &json!("c@d.io"), &json!("e@f.io")]);
    assert!(nodes[0].id.as_i64() < nodes[1].id.as_i64());
}

#[tokio::test]
async fn best_effort_batch_keeps_successes() {
    let engine = engine().await;
    let ctx = Context::new();
    let specs = ["a@b.io", "a@b.io", "e@f.io"]
        .iter()
        .map(|e| engine.create("User").unwrap().set("email", *e).set("name", "n"))
        .collect();
    let results = engine.create_bulk_best_effort(&ctx, specs).await;
    assert!(results[0].is_ok());
    assert!(results[1].as_ref().is_err_and(|e| e.is_constraint()));
    assert!(results[2].is_ok());
    assert_eq!(engine.count(&ctx, engine.query("User").unwrap()).await.unwrap(), 2);
}

#[tokio::test]
async fn cancelled_context_fails_before_the_store() {
    let engine = engine().await;
    let (handle, token) = entgraph::cancel_pair();
    let ctx = Context::new().with_cancel(token);
    handle.cancel();
    let err = engine
        .save(&ctx, engine.create("User").unwrap().set("email", "a@b.io").set("name", "n"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Canceled);
    assert_eq!(engine.count(&Context::new(), engine.query("User").unwrap()).await.unwrap(), 0);
}

const DELETES: &str = r#"{
    "entities": [
        {
            "name": "Owner",
            "fields": [{"name": "name", "type": "string"}],
            "edges": [
                {"name": "pets", "target": "Pet", "relation": "o2m", "on_delete": "cascade"},
                {"name": "cars", "target": "Car", "relation": "o2m"},
                {"name": "clubs", "target": "Club", "relation": "m2m"}
            ]
        },
        {
            "name": "Pet",
            "fields": [{"name": "name", "type": "string"}],
            "edges": [
                {"name": "owner", "target": "Owner", "ref": "pets", "required": true},
                {"name": "toys", "target": "Toy", "relation": "o2m", "on_delete": "cascade"}
            ]
        },
        {
            "name": "Toy",
            "fields": [{"name": "name", "type": "string"}],
            "edges": [{"name": "pet", "target": "Pet", "ref": "toys", "required": true}]
        },
        {
            "name": "Car",
            "fields": [{"name": "model", "type": "string"}],
            "edges": [{"name": "owner", "target": "Owner", "ref": "cars"}]
        },
        {
            "name": "Club",
            "fields": [{"name": "name", "type": "string"}],
            "edges": [{"name": "members", "target": "Owner", "ref": "clubs"}]
        }
    ]
}"#;

async fn deletes_engine() -> Engine {
    let schema = load_resolved(DELETES).unwrap();
    let driver = Arc::new(SqliteDriver::memory().await.unwrap());
    let engine = Engine::builder(driver, schema).build().unwrap();
    engine.create_tables(&Context::new()).await.unwrap();
    engine
}

async fn named(engine: &Engine, entity: &str, field: &str, value: &str, edge: Option<(&str, &Value)>) -> Value {
    let mut m = engine.create(entity).unwrap().set(field, value);
    if let Some((name, id)) = edge {
        m = m.add_edge(name, [id.clone()]);
    }
    engine.save(&Context::new(), m).await.unwrap().id
}

#[tokio::test]
async fn cascade_reaches_through_every_level() {
    let engine = deletes_engine().await;
    let ctx = Context::new();
    let owner = named(&engine, "Owner", "name", "ariel", None).await;
    let other = named(&engine, "Owner", "name", "noam", None).await;
    let pet = named(&engine, "Pet", "name", "pedro", Some(("owner", &owner))).await;
    named(&engine, "Toy", "name", "ball", Some(("pet", &pet))).await;
    named(&engine, "Toy", "name", "bone", Some(("pet", &pet))).await;
    let kept = named(&engine, "Pet", "name", "lola", Some(("owner", &other))).await;
    named(&engine, "Toy", "name", "rope", Some(("pet", &kept))).await;

    engine
        .delete_one(&ctx, engine.delete("Owner").unwrap(), owner)
        .await
        .unwrap();

    assert_eq!(engine.count(&ctx, engine.query("Owner").unwrap()).await.unwrap(), 1);
    let pets = engine.all(&ctx, engine.query("Pet").unwrap().with_edge("toys")).await.unwrap();
    assert_eq!(pets.len(), 1);
    assert_eq!(pets[0].id, kept);
    assert_eq!(pets[0].edge("toys").len(), 1);
    assert_eq!(engine.count(&ctx, engine.query("Toy").unwrap()).await.unwrap(), 1);
}

#[tokio::test]
async fn deleting_an_owner_nulls_optional_references() {
    let engine = deletes_engine().await;
    let ctx = Context::new();
    let owner = named(&engine, "Owner", "name", "ariel", None).await;
    let car = named(&engine, "Car", "model", "beetle", Some(("owner", &owner))).await;

    engine
        .delete_one(&ctx, engine.delete("Owner").unwrap(), owner)
        .await
        .unwrap();

    let car = engine
        .only(
            &ctx,
            engine.query("Car").unwrap().where_p(Predicate::id_eq(car)).with_edge("owner"),
        )
        .await
        .unwrap();
    assert_eq!(car.fields["model"], json!("beetle"));
    assert!(car.edge("owner").is_empty());
}

#[tokio::test]
async fn deleting_a_member_drops_only_join_rows() {
    let engine = deletes_engine().await;
    let ctx = Context::new();
    let club = named(&engine, "Club", "name", "chess", None).await;
    let leaving = named(&engine, "Owner", "name", "ariel", Some(("clubs", &club))).await;
    let staying = named(&engine, "Owner", "name", "noam", Some(("clubs", &club))).await;

    engine
        .delete_one(&ctx, engine.delete("Owner").unwrap(), leaving)
        .await
        .unwrap();

    let club = engine
        .only(&ctx, engine.query("Club").unwrap().with_edge("members"))
        .await
        .unwrap();
    assert_eq!(club.fields["name"], json!("chess"));
    let members: Vec<_> = club.edge("members").iter().map(|n| n.id.clone()).collect();
    assert_eq!(members, [staying]);
}
