//! Privacy layer: per-entity ordered rule lists evaluated before any statement runs.

mod rules;

pub use rules::*;

use crate::context::Context;
use crate::error::{ConfigError, GraphError};
use crate::graph::{MutationOutput, MutationSpec, Op, QuerySpec};
use crate::hook::{Interceptor, Next};
use crate::predicate::Predicate;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Outcome of a single rule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(String),
    /// Defer to the next rule.
    Skip,
}

impl Decision {
    pub fn deny(reason: impl Into<String>) -> Self {
        Decision::Deny(reason.into())
    }
}

/// Terminal outcome of a policy evaluation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny(String),
}

impl Verdict {
    pub fn deny(reason: impl Into<String>) -> Self {
        Verdict::Deny(reason.into())
    }

    pub fn is_allow(&self) -> bool {
        matches!(self, Verdict::Allow)
    }
}

impl From<Verdict> for Decision {
    fn from(v: Verdict) -> Self {
        match v {
            Verdict::Allow => Decision::Allow,
            Verdict::Deny(r) => Decision::Deny(r),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Access::Read => "query",
            Access::Write => "mutation",
        })
    }
}

/// Narrow an operation's scope with extra predicates.
pub trait Filter {
    fn entity(&self) -> &str;
    fn narrow(&mut self, p: Predicate);
}

/// What a rule is evaluated against: a query or a mutation.
pub trait Target: Send {
    fn entity(&self) -> &str;
    fn access(&self) -> Access;
    /// The mutation operation; `None` for queries.
    fn op(&self) -> Option<Op>;
    /// `None` when the operation has no predicate to narrow (creates).
    fn filter(&mut self) -> Option<&mut dyn Filter>;
    fn mutation(&self) -> Option<&MutationSpec> {
        None
    }
}

impl Filter for QuerySpec {
    fn entity(&self) -> &str {
        &self.node.entity
    }

    fn narrow(&mut self, p: Predicate) {
        self.predicates.push(p);
    }
}

impl Target for QuerySpec {
    fn entity(&self) -> &str {
        &self.node.entity
    }

    fn access(&self) -> Access {
        Access::Read
    }

    fn op(&self) -> Option<Op> {
        None
    }

    fn filter(&mut self) -> Option<&mut dyn Filter> {
        Some(self)
    }
}

impl Filter for MutationSpec {
    fn entity(&self) -> &str {
        &self.node.entity
    }

    fn narrow(&mut self, p: Predicate) {
        self.predicates.push(p);
    }
}

impl Target for MutationSpec {
    fn entity(&self) -> &str {
        &self.node.entity
    }

    fn access(&self) -> Access {
        Access::Write
    }

    fn op(&self) -> Option<Op> {
        Some(self.op)
    }

    fn filter(&mut self) -> Option<&mut dyn Filter> {
        match self.op {
            Op::Create => None,
            Op::Update | Op::Delete => Some(self),
        }
    }

    fn mutation(&self) -> Option<&MutationSpec> {
        Some(self)
    }
}

/// The target's filter, or a `Capability` error when it has none.
pub fn filter_of(target: &mut dyn Target) -> Result<&mut dyn Filter, GraphError> {
    let entity = target.entity().to_string();
    target.filter().ok_or(GraphError::Capability {
        entity,
        capability: "filter",
    })
}

/// A single privacy rule. Returning `Err` counts as a denial carrying the error text.
pub trait Rule: Send + Sync {
    fn evaluate(&self, ctx: &Context, target: &mut dyn Target) -> Result<Decision, GraphError>;

    fn name(&self) -> &str {
        let full = std::any::type_name::<Self>();
        let base = full.split('<').next().unwrap_or(full);
        base.rsplit("::").next().unwrap_or(base)
    }
}

/// Run `rules` in order. A decision bound on the context wins without running any rule.
pub fn evaluate(rules: &[Arc<dyn Rule>], default: &Verdict, ctx: &Context, target: &mut dyn Target) -> Verdict {
    if let Some(bound) = ctx.decision() {
        tracing::debug!(entity = target.entity(), decision = ?bound, "decision bound on context");
        return bound.clone();
    }
    for (i, rule) in rules.iter().enumerate() {
        let decision = rule
            .evaluate(ctx, target)
            .unwrap_or_else(|e| Decision::Deny(e.to_string()));
        tracing::debug!(entity = target.entity(), rule = rule.name(), index = i, decision = ?decision, "privacy rule");
        match decision {
            Decision::Allow => return Verdict::Allow,
            Decision::Deny(reason) => return Verdict::Deny(reason),
            Decision::Skip => {}
        }
    }
    default.clone()
}

/// Query and mutation rules for one entity plus the verdict used when every rule skips.
#[derive(Clone)]
pub struct EntityPolicy {
    query: Vec<Arc<dyn Rule>>,
    mutation: Vec<Arc<dyn Rule>>,
    default: Verdict,
}

impl fmt::Debug for EntityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityPolicy")
            .field("query", &self.query.iter().map(|r| r.name()).collect::<Vec<_>>())
            .field("mutation", &self.mutation.iter().map(|r| r.name()).collect::<Vec<_>>())
            .field("default", &self.default)
            .finish()
    }
}

impl EntityPolicy {
    /// `default` is the verdict when both lists are exhausted without Allow or Deny.
    pub fn new(default: Verdict) -> Self {
        EntityPolicy {
            query: Vec::new(),
            mutation: Vec::new(),
            default,
        }
    }

    pub fn query_rule(mut self, rule: impl Rule + 'static) -> Self {
        self.query.push(Arc::new(rule));
        self
    }

    pub fn mutation_rule(mut self, rule: impl Rule + 'static) -> Self {
        self.mutation.push(Arc::new(rule));
        self
    }

    /// Add `rule` to both lists.
    pub fn rule<R: Rule + 'static>(mut self, rule: R) -> Self {
        let rule: Arc<dyn Rule> = Arc::new(rule);
        self.query.push(rule.clone());
        self.mutation.push(rule);
        self
    }

    pub fn default_verdict(&self) -> &Verdict {
        &self.default
    }

    pub fn eval_query(&self, ctx: &Context, q: &mut QuerySpec) -> Result<(), GraphError> {
        check(evaluate(&self.query, &self.default, ctx, q), q.entity(), Access::Read)
    }

    pub fn eval_mutation(&self, ctx: &Context, m: &mut MutationSpec) -> Result<(), GraphError> {
        let verdict = evaluate(&self.mutation, &self.default, ctx, m);
        check(verdict, m.entity(), Access::Write)
    }
}

fn check(verdict: Verdict, entity: &str, access: Access) -> Result<(), GraphError> {
    match verdict {
        Verdict::Allow => Ok(()),
        Verdict::Deny(reason) => {
            tracing::info!(entity, %access, %reason, "denied by privacy policy");
            Err(GraphError::PolicyDenied {
                entity: entity.to_string(),
                reason,
            })
        }
    }
}

/// Policies by entity, fixed once built. Entities without a policy are not gated.
#[derive(Clone, Debug, Default)]
pub struct PolicyRegistry {
    policies: Arc<HashMap<String, Arc<EntityPolicy>>>,
}

impl PolicyRegistry {
    pub fn new(policies: HashMap<String, EntityPolicy>) -> Self {
        PolicyRegistry {
            policies: Arc::new(policies.into_iter().map(|(k, v)| (k, Arc::new(v))).collect()),
        }
    }

    pub fn get(&self, entity: &str) -> Option<&Arc<EntityPolicy>> {
        self.policies.get(entity)
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    pub fn eval_query(&self, ctx: &Context, q: &mut QuerySpec) -> Result<(), GraphError> {
        match self.get(q.entity()) {
            Some(p) => p.eval_query(ctx, q),
            None => Ok(()),
        }
    }

    pub fn eval_mutation(&self, ctx: &Context, m: &mut MutationSpec) -> Result<(), GraphError> {
        match self.get(m.entity()) {
            Some(p) => p.eval_mutation(ctx, m),
            None => Ok(()),
        }
    }
}

/// Where the policy interceptor sits in each entity's mutation chain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PolicyPlacement {
    /// Before every registered interceptor.
    #[default]
    Outermost,
    /// After every registered interceptor, right before the store.
    Innermost,
}

impl FromStr for PolicyPlacement {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "outermost" => Ok(PolicyPlacement::Outermost),
            "innermost" => Ok(PolicyPlacement::Innermost),
            other => Err(ConfigError::Validation(format!(
                "policy placement must be 'outermost' or 'innermost', got '{}'",
                other
            ))),
        }
    }
}

/// Chain interceptor running an entity's mutation policy.
pub struct PolicyInterceptor {
    policy: Arc<EntityPolicy>,
}

impl PolicyInterceptor {
    pub fn new(policy: Arc<EntityPolicy>) -> Self {
        PolicyInterceptor { policy }
    }
}

#[async_trait]
impl Interceptor for PolicyInterceptor {
    async fn intercept(&self, ctx: &Context, mut m: MutationSpec, next: Next<'_>) -> Result<MutationOutput, GraphError> {
        self.policy.eval_mutation(ctx, &mut m)?;
        next.run(ctx, m).await
    }
}
