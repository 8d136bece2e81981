//! Execution core: mutations run through each entity's interceptor chain inside one
//! transaction scope; queries pass the read policy before any statement runs.

use crate::config::ResolvedSchema;
use crate::context::Context;
use crate::driver::{Dialect, Driver, Session};
use crate::error::{ConfigError, GraphError};
use crate::graph::{self, MutationOutput, MutationSpec, Node, Op, QueryMode, QuerySpec};
use crate::hook::{Chain, Interceptor, Mutator, Slot};
use crate::predicate::Predicate;
use crate::privacy::{EntityPolicy, PolicyInterceptor, PolicyPlacement, PolicyRegistry};
use crate::service::FieldValidator;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// The store step at the end of every chain.
struct StoreMutator<'a> {
    schema: &'a ResolvedSchema,
}

#[async_trait]
impl Mutator for StoreMutator<'_> {
    async fn mutate(&self, ctx: &Context, m: MutationSpec, session: &mut Session) -> Result<MutationOutput, GraphError> {
        FieldValidator::validate(&m)?;
        let tx = session.tx(ctx).await?;
        match m.op {
            Op::Create => graph::create(ctx, tx, &m).await.map(MutationOutput::Created),
            Op::Update => graph::update(ctx, tx, &m).await.map(MutationOutput::Affected),
            Op::Delete => graph::delete(ctx, tx, self.schema, &m).await.map(MutationOutput::Affected),
        }
    }
}

/// Result of [`Engine::execute_query`], shaped by the query's mode.
#[derive(Clone, Debug, PartialEq)]
pub enum QueryOutput {
    Nodes(Vec<Node>),
    Count(u64),
    Exist(bool),
    Ids(Vec<Value>),
}

impl QueryOutput {
    pub fn into_nodes(self) -> Vec<Node> {
        match self {
            QueryOutput::Nodes(n) => n,
            _ => Vec::new(),
        }
    }
}

pub struct EngineBuilder {
    driver: Arc<dyn Driver>,
    schema: ResolvedSchema,
    policies: HashMap<String, EntityPolicy>,
    slots: HashMap<(String, String), Arc<dyn Interceptor>>,
    hooks: HashMap<String, Vec<Arc<dyn Interceptor>>>,
    placement: PolicyPlacement,
}

impl EngineBuilder {
    pub fn new(driver: Arc<dyn Driver>, schema: ResolvedSchema) -> Self {
        EngineBuilder {
            driver,
            schema,
            policies: HashMap::new(),
            slots: HashMap::new(),
            hooks: HashMap::new(),
            placement: PolicyPlacement::default(),
        }
    }

    pub fn policy(mut self, entity: impl Into<String>, policy: EntityPolicy) -> Self {
        self.policies.insert(entity.into(), policy);
        self
    }

    /// Append an interceptor to `entity`'s chain, after its declared hook slots.
    pub fn hook(mut self, entity: impl Into<String>, interceptor: impl Interceptor + 'static) -> Self {
        self.hooks.entry(entity.into()).or_default().push(Arc::new(interceptor));
        self
    }

    /// Bind a hook slot declared in the schema.
    pub fn register_interceptor(
        mut self,
        entity: impl Into<String>,
        slot: impl Into<String>,
        interceptor: impl Interceptor + 'static,
    ) -> Self {
        self.slots.insert((entity.into(), slot.into()), Arc::new(interceptor));
        self
    }

    pub fn placement(mut self, placement: PolicyPlacement) -> Self {
        self.placement = placement;
        self
    }

    /// Materialize every entity's chain. Declared slots left unbound fail at execution.
    pub fn build(mut self) -> Result<Engine, GraphError> {
        let unknown = self
            .policies
            .keys()
            .chain(self.hooks.keys())
            .chain(self.slots.keys().map(|(e, _)| e))
            .find(|e| self.schema.entity(e).is_none());
        if let Some(entity) = unknown {
            return Err(ConfigError::MissingReference {
                kind: "entity",
                id: entity.clone(),
            }
            .into());
        }
        if let Some((entity, slot)) = self
            .slots
            .keys()
            .find(|(e, s)| self.schema.entity(e).is_some_and(|re| !re.hooks.contains(s)))
        {
            return Err(ConfigError::MissingReference {
                kind: "hook",
                id: format!("{}.{}", entity, slot),
            }
            .into());
        }

        let policies = PolicyRegistry::new(std::mem::take(&mut self.policies));
        let mut chains = HashMap::new();
        for e in self.schema.entities() {
            let mut slots: Vec<Slot> = e
                .hooks
                .iter()
                .map(|name| match self.slots.remove(&(e.name.clone(), name.clone())) {
                    Some(i) => Slot::bound(name.clone(), i),
                    None => Slot::empty(name.clone()),
                })
                .collect();
            for (i, h) in self.hooks.remove(&e.name).unwrap_or_default().into_iter().enumerate() {
                slots.push(Slot::bound(format!("hook-{}", i), h));
            }
            if let Some(policy) = policies.get(&e.name) {
                let slot = Slot::bound("policy", Arc::new(PolicyInterceptor::new(policy.clone())));
                match self.placement {
                    PolicyPlacement::Outermost => slots.insert(0, slot),
                    PolicyPlacement::Innermost => slots.push(slot),
                }
            }
            let chain = Chain::new(e.name.clone(), slots);
            let unbound = chain.unbound();
            if !unbound.is_empty() {
                tracing::warn!(entity = %e.name, slots = ?unbound, "hook slots without a registered interceptor");
            }
            chains.insert(e.name.clone(), chain);
        }
        tracing::info!(
            entities = chains.len(),
            policies = policies.len(),
            placement = ?self.placement,
            "engine built"
        );
        Ok(Engine {
            driver: self.driver,
            schema: Arc::new(self.schema),
            policies,
            chains: Arc::new(chains),
        })
    }
}

/// Shared, read-only after build. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    driver: Arc<dyn Driver>,
    schema: Arc<ResolvedSchema>,
    policies: PolicyRegistry,
    chains: Arc<HashMap<String, Chain>>,
}

impl Engine {
    pub fn builder(driver: Arc<dyn Driver>, schema: ResolvedSchema) -> EngineBuilder {
        EngineBuilder::new(driver, schema)
    }

    pub fn schema(&self) -> &ResolvedSchema {
        &self.schema
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn dialect(&self) -> Dialect {
        self.driver.dialect()
    }

    pub fn policies(&self) -> &PolicyRegistry {
        &self.policies
    }

    pub fn create(&self, entity: &str) -> Result<MutationSpec, GraphError> {
        self.schema.mutation(Op::Create, entity)
    }

    pub fn update(&self, entity: &str) -> Result<MutationSpec, GraphError> {
        self.schema.mutation(Op::Update, entity)
    }

    pub fn delete(&self, entity: &str) -> Result<MutationSpec, GraphError> {
        self.schema.mutation(Op::Delete, entity)
    }

    pub fn query(&self, entity: &str) -> Result<QuerySpec, GraphError> {
        self.schema.query(entity)
    }

    /// Run one mutation through its chain and commit. Any failure rolls the whole scope back.
    pub async fn execute(&self, ctx: &Context, m: MutationSpec) -> Result<MutationOutput, GraphError> {
        let mut session = Session::new(self.driver.clone());
        match self.run_chain(ctx, m, &mut session).await {
            Ok(out) => {
                session.commit(ctx).await?;
                Ok(out)
            }
            Err(e) => {
                session.rollback().await;
                Err(e)
            }
        }
    }

    async fn run_chain(&self, ctx: &Context, mut m: MutationSpec, session: &mut Session) -> Result<MutationOutput, GraphError> {
        ctx.check()?;
        let chain = self
            .chains
            .get(m.entity())
            .ok_or_else(|| GraphError::validation(m.entity(), "unknown entity"))?;
        apply_defaults(&mut m);
        let terminal = StoreMutator { schema: &self.schema };
        chain.run(ctx, m, &terminal, session).await
    }

    pub async fn execute_query(&self, ctx: &Context, q: QuerySpec) -> Result<QueryOutput, GraphError> {
        let mut session = Session::new(self.driver.clone());
        match self.read(ctx, q, &mut session).await {
            Ok(out) => {
                session.commit(ctx).await?;
                Ok(out)
            }
            Err(e) => {
                session.rollback().await;
                Err(e)
            }
        }
    }

    async fn read(&self, ctx: &Context, mut q: QuerySpec, session: &mut Session) -> Result<QueryOutput, GraphError> {
        ctx.check()?;
        self.policies.eval_query(ctx, &mut q)?;
        let node = &q.node;
        for load in q.with_edges.iter_mut() {
            let edge = node
                .edge(&load.edge)
                .ok_or_else(|| GraphError::validation(&node.entity, format!("unknown edge \"{}\"", load.edge)))?;
            let mut scoped = self.schema.query(&edge.target.entity)?;
            scoped.predicates = std::mem::take(&mut load.predicates);
            self.policies.eval_query(ctx, &mut scoped)?;
            load.predicates = scoped.predicates;
            load.target = Some(scoped.node);
        }
        let tx = session.tx(ctx).await?;
        Ok(match q.mode {
            QueryMode::All => QueryOutput::Nodes(graph::nodes(ctx, tx, &q).await?),
            QueryMode::Count => QueryOutput::Count(graph::count(ctx, tx, &q).await?),
            QueryMode::Exist => QueryOutput::Exist(graph::exists(ctx, tx, &q).await?),
            QueryMode::Ids => QueryOutput::Ids(graph::ids(ctx, tx, &q).await?),
        })
    }

    pub async fn all(&self, ctx: &Context, q: QuerySpec) -> Result<Vec<Node>, GraphError> {
        Ok(self.execute_query(ctx, q.mode(QueryMode::All)).await?.into_nodes())
    }

    pub async fn count(&self, ctx: &Context, q: QuerySpec) -> Result<u64, GraphError> {
        match self.execute_query(ctx, q.mode(QueryMode::Count)).await? {
            QueryOutput::Count(n) => Ok(n),
            _ => Ok(0),
        }
    }

    pub async fn exist(&self, ctx: &Context, q: QuerySpec) -> Result<bool, GraphError> {
        match self.execute_query(ctx, q.mode(QueryMode::Exist)).await? {
            QueryOutput::Exist(b) => Ok(b),
            _ => Ok(false),
        }
    }

    pub async fn ids(&self, ctx: &Context, q: QuerySpec) -> Result<Vec<Value>, GraphError> {
        match self.execute_query(ctx, q.mode(QueryMode::Ids)).await? {
            QueryOutput::Ids(ids) => Ok(ids),
            _ => Ok(Vec::new()),
        }
    }

    /// First match in the query's order, `NotFound` when nothing matches.
    pub async fn first(&self, ctx: &Context, q: QuerySpec) -> Result<Node, GraphError> {
        let entity = q.entity().to_string();
        self.all(ctx, q.limit(1))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| GraphError::not_found(entity))
    }

    /// Exactly one match: `NotFound` for none, `NotSingular` for more.
    pub async fn only(&self, ctx: &Context, q: QuerySpec) -> Result<Node, GraphError> {
        let entity = q.entity().to_string();
        let mut found = self.all(ctx, q.limit(2)).await?;
        match found.len() {
            0 => Err(GraphError::not_found(entity)),
            1 => Ok(found.remove(0)),
            count => Err(GraphError::NotSingular { entity, count }),
        }
    }

    /// Create one node.
    pub async fn save(&self, ctx: &Context, m: MutationSpec) -> Result<Node, GraphError> {
        if m.op != Op::Create {
            return Err(GraphError::validation(m.entity(), format!("expected create, got {}", m.op)));
        }
        let entity = m.entity().to_string();
        self.execute(ctx, m)
            .await?
            .into_node()
            .ok_or_else(|| GraphError::not_found(entity))
    }

    /// All creates in one transaction; ids come back in input order. The first failure fails the batch.
    pub async fn create_bulk(&self, ctx: &Context, specs: Vec<MutationSpec>) -> Result<Vec<Node>, GraphError> {
        let mut session = Session::new(self.driver.clone());
        let mut out = Vec::with_capacity(specs.len());
        for (i, m) in specs.into_iter().enumerate() {
            let res = match m.op {
                Op::Create => self.run_chain(ctx, m, &mut session).await,
                op => Err(GraphError::validation(m.entity(), format!("batch element {}: expected create, got {}", i, op))),
            };
            match res {
                Ok(o) => out.extend(o.into_node()),
                Err(e) => {
                    tracing::warn!(element = i, error = %e, "batch create failed; rolling back");
                    session.rollback().await;
                    return Err(e);
                }
            }
        }
        session.commit(ctx).await?;
        Ok(out)
    }

    /// Each create in its own transaction; one result per input, in order.
    pub async fn create_bulk_best_effort(&self, ctx: &Context, specs: Vec<MutationSpec>) -> Vec<Result<Node, GraphError>> {
        let mut out = Vec::with_capacity(specs.len());
        for m in specs {
            out.push(self.save(ctx, m).await);
        }
        out
    }

    /// Update the node with `id` and return it re-read in the same transaction.
    /// Zero matched rows is `NotFound`.
    pub async fn update_one(&self, ctx: &Context, m: MutationSpec, id: impl Into<Value>) -> Result<Node, GraphError> {
        if m.op != Op::Update {
            return Err(GraphError::validation(m.entity(), format!("expected update, got {}", m.op)));
        }
        let id = id.into();
        let entity = m.entity().to_string();
        let q = self.query(&entity)?.where_p(Predicate::id_eq(id.clone()));
        let m = m.where_p(Predicate::id_eq(id));
        let mut session = Session::new(self.driver.clone());
        let res: Result<Node, GraphError> = async {
            if self.run_chain(ctx, m, &mut session).await?.affected() == 0 {
                return Err(GraphError::not_found(&entity));
            }
            self.read(ctx, q, &mut session)
                .await?
                .into_nodes()
                .into_iter()
                .next()
                .ok_or_else(|| GraphError::not_found(&entity))
        }
        .await;
        match res {
            Ok(node) => {
                session.commit(ctx).await?;
                Ok(node)
            }
            Err(e) => {
                session.rollback().await;
                Err(e)
            }
        }
    }

    /// Delete the node with `id`. Zero matched rows is `NotFound`.
    pub async fn delete_one(&self, ctx: &Context, m: MutationSpec, id: impl Into<Value>) -> Result<(), GraphError> {
        if m.op != Op::Delete {
            return Err(GraphError::validation(m.entity(), format!("expected delete, got {}", m.op)));
        }
        let entity = m.entity().to_string();
        let affected = self.execute(ctx, m.where_p(Predicate::id_eq(id))).await?.affected();
        if affected == 0 {
            return Err(GraphError::not_found(entity));
        }
        Ok(())
    }

    /// Create every table the schema describes.
    pub async fn create_tables(&self, ctx: &Context) -> Result<(), GraphError> {
        crate::migration::create_tables(ctx, self.driver.clone(), &self.schema).await
    }
}

/// Fill unset columns from their defaults (create) or update defaults (update).
fn apply_defaults(m: &mut MutationSpec) {
    let pending: Vec<(String, Value)> = m
        .node
        .columns
        .iter()
        .filter(|c| m.node.field(&c.name).is_none() && !m.node.cleared.contains(&c.name))
        .filter_map(|c| {
            let d = match m.op {
                Op::Create => c.default.as_ref(),
                Op::Update => c.update_default.as_ref(),
                Op::Delete => None,
            }?;
            Some((c.name.clone(), d.produce()))
        })
        .collect();
    for (column, value) in pending {
        m.node.set(column, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ColumnSpec, DefaultValue, FieldType, IdGeneration, IdSpec, NodeSpec};
    use serde_json::json;

    fn node() -> NodeSpec {
        NodeSpec::new(
            "Post",
            "posts",
            IdSpec {
                column: "id".into(),
                ty: FieldType::Int,
                generation: IdGeneration::Store,
            },
        )
        .with_column(ColumnSpec::new("status", FieldType::String).default_value(DefaultValue::Literal(json!("draft"))))
        .with_column(
            ColumnSpec::new("updated_at", FieldType::Time)
                .default_value(DefaultValue::Now)
                .update_default(DefaultValue::Now),
        )
        .with_column(ColumnSpec::new("title", FieldType::String))
    }

    #[test]
    fn create_fills_defaults_without_overriding() {
        let mut m = MutationSpec::create(node()).set("status", "live");
        apply_defaults(&mut m);
        assert_eq!(m.node.field("status"), Some(&json!("live")));
        assert!(m.node.field("updated_at").is_some_and(Value::is_string));
        assert!(m.node.field("title").is_none());
    }

    #[test]
    fn update_only_uses_update_defaults() {
        let mut m = MutationSpec::update(node());
        apply_defaults(&mut m);
        assert!(m.node.field("status").is_none());
        assert!(m.node.field("updated_at").is_some());

        let mut m = MutationSpec::delete(node());
        apply_defaults(&mut m);
        assert!(m.node.fields.is_empty());
    }
}
