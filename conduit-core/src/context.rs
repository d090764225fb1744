//! Per-dispatch context threaded explicitly through buses, middleware and
//! handlers.

use crate::unit_of_work::UnitOfWork;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Context for a single dispatch.
///
/// Cloning is cheap. Handlers pass their context (or [`DispatchContext::nested`])
/// to any dispatch they issue so that correlation, cancellation and the open
/// unit of work propagate.
#[derive(Clone)]
pub struct DispatchContext {
    correlation_id: Uuid,
    causation_id: Option<Uuid>,
    cancellation: CancellationToken,
    unit_of_work: Option<Arc<dyn UnitOfWork>>,
}

impl DispatchContext {
    /// Fresh root context with a new correlation ID.
    pub fn new() -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            causation_id: None,
            cancellation: CancellationToken::new(),
            unit_of_work: None,
        }
    }

    /// Set correlation ID (e.g. from an inbound `X-Correlation-Id` header)
    pub fn with_correlation_id(mut self, id: Uuid) -> Self {
        self.correlation_id = id;
        self
    }

    /// Tie this dispatch to a caller-owned cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Attach the unit of work the handler should enlist in.
    pub fn with_unit_of_work(mut self, uow: Arc<dyn UnitOfWork>) -> Self {
        self.unit_of_work = Some(uow);
        self
    }

    /// Context for a dispatch issued while handling `parent_request`.
    ///
    /// Keeps correlation, cancellation and the caller's transaction.
    pub fn nested(&self, parent_request: Uuid) -> Self {
        Self {
            correlation_id: self.correlation_id,
            causation_id: Some(parent_request),
            cancellation: self.cancellation.clone(),
            unit_of_work: self.unit_of_work.clone(),
        }
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    pub fn causation_id(&self) -> Option<Uuid> {
        self.causation_id
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// The unit of work opened by an enclosing Transaction middleware.
    pub fn unit_of_work(&self) -> Option<&Arc<dyn UnitOfWork>> {
        self.unit_of_work.as_ref()
    }
}

impl Default for DispatchContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DispatchContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchContext")
            .field("correlation_id", &self.correlation_id)
            .field("causation_id", &self.causation_id)
            .field("cancelled", &self.cancellation.is_cancelled())
            .field("in_transaction", &self.unit_of_work.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_context_keeps_correlation_and_cancellation() {
        let root = DispatchContext::new();
        let parent = Uuid::new_v4();
        let child = root.nested(parent);

        assert_eq!(child.correlation_id(), root.correlation_id());
        assert_eq!(child.causation_id(), Some(parent));

        root.cancellation().cancel();
        assert!(child.is_cancelled());
    }
}
