use super::{filter_of, Access, Decision, Filter, Rule, Target};
use crate::context::Context;
use crate::error::GraphError;
use crate::graph::{key, Op};
use crate::predicate::Predicate;

pub struct AlwaysAllow;

impl Rule for AlwaysAllow {
    fn evaluate(&self, _: &Context, _: &mut dyn Target) -> Result<Decision, GraphError> {
        Ok(Decision::Allow)
    }
}

pub struct AlwaysDeny {
    reason: String,
}

impl AlwaysDeny {
    pub fn new(reason: impl Into<String>) -> Self {
        AlwaysDeny { reason: reason.into() }
    }
}

impl Rule for AlwaysDeny {
    fn evaluate(&self, _: &Context, _: &mut dyn Target) -> Result<Decision, GraphError> {
        Ok(Decision::Deny(self.reason.clone()))
    }
}

/// Decide from the context alone.
pub struct ContextRule<F>(pub F);

impl<F> Rule for ContextRule<F>
where
    F: Fn(&Context) -> Result<Decision, GraphError> + Send + Sync,
{
    fn evaluate(&self, ctx: &Context, _: &mut dyn Target) -> Result<Decision, GraphError> {
        (self.0)(ctx)
    }
}

pub struct DenyIfNoViewer;

impl Rule for DenyIfNoViewer {
    fn evaluate(&self, ctx: &Context, _: &mut dyn Target) -> Result<Decision, GraphError> {
        Ok(match ctx.viewer() {
            Some(_) => Decision::Skip,
            None => Decision::deny("viewer-context is missing"),
        })
    }
}

/// Allow when the viewer has `role`.
pub struct AllowIfRole {
    role: String,
}

impl AllowIfRole {
    pub fn new(role: impl Into<String>) -> Self {
        AllowIfRole { role: role.into() }
    }
}

impl Rule for AllowIfRole {
    fn evaluate(&self, ctx: &Context, _: &mut dyn Target) -> Result<Decision, GraphError> {
        Ok(match ctx.viewer() {
            Some(v) if v.has_role(&self.role) => Decision::Allow,
            _ => Decision::Skip,
        })
    }
}

/// Run the inner rule only for reads.
pub struct OnQuery<R>(pub R);

impl<R: Rule> Rule for OnQuery<R> {
    fn evaluate(&self, ctx: &Context, target: &mut dyn Target) -> Result<Decision, GraphError> {
        match target.access() {
            Access::Read => self.0.evaluate(ctx, target),
            Access::Write => Ok(Decision::Skip),
        }
    }
}

/// Run the inner rule only for writes.
pub struct OnMutation<R>(pub R);

impl<R: Rule> Rule for OnMutation<R> {
    fn evaluate(&self, ctx: &Context, target: &mut dyn Target) -> Result<Decision, GraphError> {
        match target.access() {
            Access::Write => self.0.evaluate(ctx, target),
            Access::Read => Ok(Decision::Skip),
        }
    }
}

/// Run the inner rule only for the listed mutation operations.
pub struct OnOperation<R> {
    ops: Vec<Op>,
    rule: R,
}

impl<R: Rule> OnOperation<R> {
    pub fn new(rule: R, ops: impl IntoIterator<Item = Op>) -> Self {
        OnOperation {
            ops: ops.into_iter().collect(),
            rule,
        }
    }
}

impl<R: Rule> Rule for OnOperation<R> {
    fn evaluate(&self, ctx: &Context, target: &mut dyn Target) -> Result<Decision, GraphError> {
        match target.op() {
            Some(op) if self.ops.contains(&op) => self.rule.evaluate(ctx, target),
            _ => Ok(Decision::Skip),
        }
    }
}

pub struct DenyMutationOperation {
    ops: Vec<Op>,
}

impl DenyMutationOperation {
    pub fn new(ops: impl IntoIterator<Item = Op>) -> Self {
        DenyMutationOperation {
            ops: ops.into_iter().collect(),
        }
    }
}

impl Rule for DenyMutationOperation {
    fn evaluate(&self, _: &Context, target: &mut dyn Target) -> Result<Decision, GraphError> {
        Ok(match target.op() {
            Some(op) if self.ops.contains(&op) => Decision::deny(format!("{} operation is not allowed", op)),
            _ => Decision::Skip,
        })
    }
}

/// Narrow the operation through its filter. Fails with `Capability` when the target has none.
pub struct FilterFn<F>(pub F);

impl<F> Rule for FilterFn<F>
where
    F: Fn(&Context, &mut dyn Filter) -> Result<Decision, GraphError> + Send + Sync,
{
    fn evaluate(&self, ctx: &Context, target: &mut dyn Target) -> Result<Decision, GraphError> {
        (self.0)(ctx, filter_of(target)?)
    }
}

/// Row-level tenancy on `column`: reads, updates and deletes are narrowed to the viewer's tenant;
/// creates must assign it, and updates may not move a row out of it.
pub struct TenantRule {
    column: String,
}

impl TenantRule {
    pub fn new(column: impl Into<String>) -> Self {
        TenantRule { column: column.into() }
    }
}

impl Rule for TenantRule {
    fn evaluate(&self, ctx: &Context, target: &mut dyn Target) -> Result<Decision, GraphError> {
        let Some(tenant) = ctx.viewer().and_then(|v| v.tenant.clone()) else {
            return Ok(Decision::deny("missing tenant information in viewer"));
        };
        if target.op() == Some(Op::Create) {
            let assigned = target.mutation().and_then(|m| m.node.field(&self.column));
            return Ok(match assigned {
                Some(v) if key(v) == key(&tenant) => Decision::Skip,
                Some(_) => Decision::deny(format!("{} does not match the viewer tenant", self.column)),
                None => Decision::deny(format!("{} must be set to the viewer tenant", self.column)),
            });
        }
        if let Some(m) = target.mutation().filter(|m| m.op == Op::Update) {
            if m.node.cleared.contains(&self.column) {
                return Ok(Decision::deny(format!("{} cannot be cleared", self.column)));
            }
            if m.node.field(&self.column).is_some_and(|v| key(v) != key(&tenant)) {
                return Ok(Decision::deny(format!("{} does not match the viewer tenant", self.column)));
            }
        }
        filter_of(target)?.narrow(Predicate::eq(self.column.clone(), tenant));
        Ok(Decision::Skip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Viewer;
    use crate::graph::{FieldType, IdGeneration, IdSpec, MutationSpec, NodeSpec, QuerySpec};

    fn node() -> NodeSpec {
        NodeSpec::new(
            "Doc",
            "docs",
            IdSpec {
                column: "id".into(),
                ty: FieldType::Int,
                generation: IdGeneration::Store,
            },
        )
        .with_column(crate::graph::ColumnSpec::new("tenant", FieldType::String))
    }

    fn acme() -> Context {
        Context::new().with_viewer(Viewer::new(7).with_tenant("acme"))
    }

    #[test]
    fn kind_wrappers_skip_on_the_other_kind() {
        let deny = || AlwaysDeny::new("no");
        let mut q = QuerySpec::new(node());
        let mut m = MutationSpec::update(node());
        let ctx = Context::new();
        assert_eq!(OnMutation(deny()).evaluate(&ctx, &mut q).unwrap(), Decision::Skip);
        assert_eq!(OnQuery(deny()).evaluate(&ctx, &mut m).unwrap(), Decision::Skip);
        assert_eq!(OnOperation::new(deny(), [Op::Delete]).evaluate(&ctx, &mut m).unwrap(), Decision::Skip);
        assert_eq!(OnOperation::new(deny(), [Op::Delete]).evaluate(&ctx, &mut q).unwrap(), Decision::Skip);
        assert_eq!(
            OnOperation::new(deny(), [Op::Update]).evaluate(&ctx, &mut m).unwrap(),
            Decision::deny("no")
        );
    }

    #[test]
    fn roles_and_viewer() {
        let mut q = QuerySpec::new(node());
        let admin = Context::new().with_viewer(Viewer::new(1).with_role("admin"));
        assert_eq!(AllowIfRole::new("admin").evaluate(&admin, &mut q).unwrap(), Decision::Allow);
        assert_eq!(AllowIfRole::new("admin").evaluate(&acme(), &mut q).unwrap(), Decision::Skip);
        assert_eq!(DenyIfNoViewer.evaluate(&admin, &mut q).unwrap(), Decision::Skip);
        assert!(matches!(DenyIfNoViewer.evaluate(&Context::new(), &mut q).unwrap(), Decision::Deny(_)));
    }

    #[test]
    fn tenant_rule_narrows_reads() {
        let mut q = QuerySpec::new(node());
        assert_eq!(TenantRule::new("tenant").evaluate(&acme(), &mut q).unwrap(), Decision::Skip);
        assert_eq!(q.predicates.len(), 1);

        let mut s = q.node.selector();
        crate::predicate::apply_all(&mut s, &q.predicates);
        let rendered = s.render().unwrap();
        assert!(rendered.sql.contains(r#""tenant" = $1"#), "{}", rendered.sql);
    }

    #[test]
    fn tenant_rule_checks_creates() {
        let rule = TenantRule::new("tenant");
        let mut ok = MutationSpec::create(node()).set("tenant", "acme");
        assert_eq!(rule.evaluate(&acme(), &mut ok).unwrap(), Decision::Skip);
        assert!(ok.predicates.is_empty());

        let mut other = MutationSpec::create(node()).set("tenant", "globex");
        assert!(matches!(rule.evaluate(&acme(), &mut other).unwrap(), Decision::Deny(_)));

        let mut unset = MutationSpec::create(node());
        assert!(matches!(rule.evaluate(&acme(), &mut unset).unwrap(), Decision::Deny(_)));
        assert!(matches!(rule.evaluate(&Context::new(), &mut unset).unwrap(), Decision::Deny(_)));
    }

    #[test]
    fn tenant_rule_keeps_updates_in_the_tenant() {
        let rule = TenantRule::new("tenant");
        let mut moved = MutationSpec::update(node()).set("tenant", "globex");
        assert!(matches!(rule.evaluate(&acme(), &mut moved).unwrap(), Decision::Deny(_)));

        let mut cleared = MutationSpec::update(node()).clear_field("tenant");
        assert!(matches!(rule.evaluate(&acme(), &mut cleared).unwrap(), Decision::Deny(_)));

        let mut same = MutationSpec::update(node()).set("tenant", "acme");
        assert_eq!(rule.evaluate(&acme(), &mut same).unwrap(), Decision::Skip);
        assert_eq!(same.predicates.len(), 1);
    }

    #[test]
    fn filter_fn_requires_the_capability() {
        let rule = FilterFn(|_: &Context, f: &mut dyn Filter| {
            f.narrow(Predicate::eq("tenant", "acme"));
            Ok(Decision::Skip)
        });
        let mut m = MutationSpec::create(node());
        assert!(matches!(rule.evaluate(&Context::new(), &mut m), Err(GraphError::Capability { .. })));
        let mut m = MutationSpec::delete(node());
        assert_eq!(rule.evaluate(&Context::new(), &mut m).unwrap(), Decision::Skip);
        assert_eq!(m.predicates.len(), 1);
    }
}
