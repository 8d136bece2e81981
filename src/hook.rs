//! Mutation interceptor chain: ordered interceptors around one terminal store step.

use crate::context::Context;
use crate::driver::Session;
use crate::error::GraphError;
use crate::graph::{MutationOutput, MutationSpec, Op};
use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The terminal step: applies the mutation to the store.
#[async_trait]
pub trait Mutator: Send + Sync {
    async fn mutate(&self, ctx: &Context, m: MutationSpec, session: &mut Session) -> Result<MutationOutput, GraphError>;
}

/// Runs logic around the rest of the chain. Calling `next.run` zero times short-circuits;
/// the interceptor then owns the result.
#[async_trait]
pub trait Interceptor: Send + Sync {
    async fn intercept(&self, ctx: &Context, m: MutationSpec, next: Next<'_>) -> Result<MutationOutput, GraphError>;
}

/// A named position in a chain. `None` until something is registered for it.
#[derive(Clone)]
pub struct Slot {
    pub name: String,
    pub interceptor: Option<Arc<dyn Interceptor>>,
}

impl Slot {
    pub fn bound(name: impl Into<String>, interceptor: Arc<dyn Interceptor>) -> Self {
        Slot {
            name: name.into(),
            interceptor: Some(interceptor),
        }
    }

    pub fn empty(name: impl Into<String>) -> Self {
        Slot {
            name: name.into(),
            interceptor: None,
        }
    }
}

/// The remainder of the chain. Consumed by `run`, so it executes at most once.
pub struct Next<'a> {
    entity: &'a str,
    rest: &'a [Slot],
    terminal: &'a dyn Mutator,
    session: &'a mut Session,
}

impl<'a> Next<'a> {
    /// Transaction scope shared by the whole chain.
    pub fn session(&mut self) -> &mut Session {
        &mut *self.session
    }

    pub fn run(self, ctx: &'a Context, m: MutationSpec) -> BoxFuture<'a, Result<MutationOutput, GraphError>> {
        Box::pin(async move {
            let Next {
                entity,
                rest,
                terminal,
                session,
            } = self;
            let Some((slot, rest)) = rest.split_first() else {
                return terminal.mutate(ctx, m, session).await;
            };
            let Some(interceptor) = &slot.interceptor else {
                return Err(GraphError::UninitializedInterceptor {
                    entity: entity.to_string(),
                    slot: slot.name.clone(),
                });
            };
            let next = Next {
                entity,
                rest,
                terminal,
                session,
            };
            interceptor.intercept(ctx, m, next).await
        })
    }
}

/// Ordered interceptors for one entity, materialized once at startup. The first slot
/// observes the call first and the result last.
#[derive(Clone, Default)]
pub struct Chain {
    entity: String,
    slots: Vec<Slot>,
}

impl Chain {
    pub fn new(entity: impl Into<String>, slots: Vec<Slot>) -> Self {
        Chain {
            entity: entity.into(),
            slots,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Names of slots nothing was registered for.
    pub fn unbound(&self) -> Vec<&str> {
        self.slots
            .iter()
            .filter(|s| s.interceptor.is_none())
            .map(|s| s.name.as_str())
            .collect()
    }

    pub async fn run(
        &self,
        ctx: &Context,
        m: MutationSpec,
        terminal: &dyn Mutator,
        session: &mut Session,
    ) -> Result<MutationOutput, GraphError> {
        let next = Next {
            entity: &self.entity,
            rest: &self.slots,
            terminal,
            session,
        };
        next.run(ctx, m).await
    }
}

/// Run `inner` only for the listed operations; pass through otherwise.
pub struct On {
    ops: Vec<Op>,
    inner: Arc<dyn Interceptor>,
}

impl On {
    pub fn new(inner: Arc<dyn Interceptor>, ops: impl IntoIterator<Item = Op>) -> Self {
        On {
            ops: ops.into_iter().collect(),
            inner,
        }
    }
}

#[async_trait]
impl Interceptor for On {
    async fn intercept(&self, ctx: &Context, m: MutationSpec, next: Next<'_>) -> Result<MutationOutput, GraphError> {
        if self.ops.contains(&m.op) {
            self.inner.intercept(ctx, m, next).await
        } else {
            next.run(ctx, m).await
        }
    }
}

/// Fail the listed operations before they reach the store.
pub struct Reject {
    ops: Vec<Op>,
}

impl Reject {
    pub fn new(ops: impl IntoIterator<Item = Op>) -> Self {
        Reject {
            ops: ops.into_iter().collect(),
        }
    }
}

#[async_trait]
impl Interceptor for Reject {
    async fn intercept(&self, ctx: &Context, m: MutationSpec, next: Next<'_>) -> Result<MutationOutput, GraphError> {
        if self.ops.contains(&m.op) {
            return Err(GraphError::validation(m.entity(), format!("{} operation is not allowed", m.op)));
        }
        next.run(ctx, m).await
    }
}

/// Inspect or rewrite the mutation before the rest of the chain runs.
pub struct Before<F>(pub F);

#[async_trait]
impl<F> Interceptor for Before<F>
where
    F: Fn(&Context, &mut MutationSpec) -> Result<(), GraphError> + Send + Sync,
{
    async fn intercept(&self, ctx: &Context, mut m: MutationSpec, next: Next<'_>) -> Result<MutationOutput, GraphError> {
        (self.0)(ctx, &mut m)?;
        next.run(ctx, m).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{Dialect, Driver, Tx};
    use crate::error::ErrorKind;
    use crate::graph::{FieldType, IdGeneration, IdSpec, NodeSpec};
    use std::sync::Mutex;

    struct NoStore;

    #[async_trait]
    impl Driver for NoStore {
        fn dialect(&self) -> Dialect {
            Dialect::Sqlite
        }

        async fn begin(&self) -> Result<Box<dyn Tx>, GraphError> {
            Err(GraphError::Canceled("no store in this test".into()))
        }
    }

    struct Recording(Arc<Mutex<Vec<String>>>);

    #[async_trait]
    impl Mutator for Recording {
        async fn mutate(&self, _: &Context, _: MutationSpec, _: &mut Session) -> Result<MutationOutput, GraphError> {
            self.0.lock().unwrap().push("store".into());
            Ok(MutationOutput::Affected(1))
        }
    }

    struct Tag(&'static str, Arc<Mutex<Vec<String>>>);

    #[async_trait]
    impl Interceptor for Tag {
        async fn intercept(&self, ctx: &Context, m: MutationSpec, next: Next<'_>) -> Result<MutationOutput, GraphError> {
            self.1.lock().unwrap().push(format!("{} before", self.0));
            let out = next.run(ctx, m).await;
            self.1.lock().unwrap().push(format!("{} after", self.0));
            out
        }
    }

    fn mutation(op: Op) -> MutationSpec {
        let node = NodeSpec::new(
            "Tenant",
            "tenants",
            IdSpec {
                column: "id".into(),
                ty: FieldType::Int,
                generation: IdGeneration::Store,
            },
        );
        MutationSpec::new(op, node)
    }

    fn session() -> Session {
        Session::new(Arc::new(NoStore))
    }

    #[tokio::test]
    async fn first_registered_runs_outermost() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = Chain::new(
            "Tenant",
            vec![
                Slot::bound("a", Arc::new(Tag("a", log.clone()))),
                Slot::bound("b", Arc::new(Tag("b", log.clone()))),
            ],
        );
        let out = chain
            .run(&Context::new(), mutation(Op::Create), &Recording(log.clone()), &mut session())
            .await
            .unwrap();
        assert_eq!(out.affected(), 1);
        assert_eq!(
            *log.lock().unwrap(),
            ["a before", "b before", "store", "b after", "a after"]
        );
    }

    #[tokio::test]
    async fn empty_slot_fails_without_reaching_the_store() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = Chain::new("Tenant", vec![Slot::empty("audit")]);
        assert_eq!(chain.unbound(), ["audit"]);
        let err = chain
            .run(&Context::new(), mutation(Op::Create), &Recording(log.clone()), &mut session())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UninitializedInterceptor);
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn on_and_reject_filter_by_operation() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = Chain::new(
            "Tenant",
            vec![
                Slot::bound("deletes", Arc::new(On::new(Arc::new(Tag("on", log.clone())), [Op::Delete]))),
                Slot::bound("no-updates", Arc::new(Reject::new([Op::Update]))),
            ],
        );
        let terminal = Recording(log.clone());
        chain
            .run(&Context::new(), mutation(Op::Create), &terminal, &mut session())
            .await
            .unwrap();
        assert_eq!(*log.lock().unwrap(), ["store"]);

        let err = chain
            .run(&Context::new(), mutation(Op::Update), &terminal, &mut session())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        log.lock().unwrap().clear();
        chain
            .run(&Context::new(), mutation(Op::Delete), &terminal, &mut session())
            .await
            .unwrap();
        assert_eq!(*log.lock().unwrap(), ["on before", "store", "on after"]);
    }

    #[tokio::test]
    async fn before_can_rewrite_the_mutation() {
        let log = Arc::new(Mutex::new(Vec::<String>::new()));
        let chain = Chain::new(
            "Tenant",
            vec![Slot::bound(
                "rename",
                Arc::new(Before(|_: &Context, m: &mut MutationSpec| {
                    m.node.set("name", "rewritten");
                    Ok(())
                })),
            )],
        );
        struct Check;
        #[async_trait]
        impl Mutator for Check {
            async fn mutate(&self, _: &Context, m: MutationSpec, _: &mut Session) -> Result<MutationOutput, GraphError> {
                assert_eq!(m.node.field("name"), Some(&serde_json::json!("rewritten")));
                Ok(MutationOutput::Affected(0))
            }
        }
        chain
            .run(&Context::new(), mutation(Op::Update), &Check, &mut session())
            .await
            .unwrap();
        assert!(log.lock().unwrap().is_empty());
    }
}
