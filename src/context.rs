//! Execution context threaded through every operation: decision override, viewer, cancellation, deadline.

use crate::error::GraphError;
use crate::privacy::Verdict;
use serde_json::Value;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// The principal an operation runs on behalf of.
#[derive(Clone, Debug, Default)]
pub struct Viewer {
    pub id: Option<Value>,
    pub tenant: Option<Value>,
    pub roles: HashSet<String>,
}

impl Viewer {
    pub fn new(id: impl Into<Value>) -> Self {
        Viewer {
            id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn with_tenant(mut self, tenant: impl Into<Value>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }
}

/// Sender side of a cancellation signal.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

#[derive(Clone, Debug)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancelled. Never resolves if the handle is dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|c| *c).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

/// Immutable; every `with_*` returns a derived context so bindings stay scoped to the call tree using them.
#[derive(Clone, Debug, Default)]
pub struct Context {
    decision: Option<Verdict>,
    viewer: Option<Arc<Viewer>>,
    cancel: Option<CancelToken>,
    deadline: Option<Instant>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a decision that bypasses policy evaluation for everything run with the returned context.
    pub fn with_decision(&self, decision: Verdict) -> Self {
        Context {
            decision: Some(decision),
            ..self.clone()
        }
    }

    pub fn with_viewer(&self, viewer: Viewer) -> Self {
        Context {
            viewer: Some(Arc::new(viewer)),
            ..self.clone()
        }
    }

    pub fn with_cancel(&self, token: CancelToken) -> Self {
        Context {
            cancel: Some(token),
            ..self.clone()
        }
    }

    /// Keeps the earlier deadline when one is already set.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(d) if d < deadline => d,
            _ => deadline,
        };
        Context {
            deadline: Some(deadline),
            ..self.clone()
        }
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn decision(&self) -> Option<&Verdict> {
        self.decision.as_ref()
    }

    pub fn viewer(&self) -> Option<&Viewer> {
        self.viewer.as_deref()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fails with `Canceled` if the context is already cancelled or past its deadline.
    pub fn check(&self) -> Result<(), GraphError> {
        if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            return Err(GraphError::Canceled("context canceled".into()));
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(GraphError::Canceled("context deadline exceeded".into()));
        }
        Ok(())
    }

    /// Drive one store round-trip, aborting it on cancellation or deadline.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, GraphError>
    where
        F: Future<Output = Result<T, GraphError>>,
    {
        self.check()?;
        if self.cancel.is_none() && self.deadline.is_none() {
            return fut.await;
        }
        let cancelled = async {
            match &self.cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        let expired = async {
            match self.deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            res = fut => res,
            _ = cancelled => Err(GraphError::Canceled("context canceled".into())),
            _ = expired => Err(GraphError::Canceled("context deadline exceeded".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn decision_binding_does_not_leak_to_parent() {
        let root = Context::new();
        let allowed = root.with_decision(Verdict::Allow);
        assert!(root.decision().is_none());
        assert_eq!(allowed.decision(), Some(&Verdict::Allow));
    }

    #[test]
    fn earlier_deadline_wins() {
        let now = Instant::now();
        let ctx = Context::new()
            .with_deadline(now + Duration::from_secs(5))
            .with_deadline(now + Duration::from_secs(60));
        assert_eq!(ctx.deadline(), Some(now + Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn run_observes_cancellation() {
        let (handle, token) = cancel_pair();
        let ctx = Context::new().with_cancel(token);
        handle.cancel();
        let err = ctx
            .run(async { Ok::<_, GraphError>(1) })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Canceled);
    }

    #[tokio::test(start_paused = true)]
    async fn run_aborts_pending_work_at_deadline() {
        let ctx = Context::new().with_timeout(Duration::from_millis(10));
        let err = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok::<_, GraphError>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::Canceled(_)));
    }
}
