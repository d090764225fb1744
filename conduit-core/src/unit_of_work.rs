//! Unit-of-work boundary and the Transaction middleware.

use crate::envelope::{DispatchResult, Envelope};
use crate::error::BusError;
use crate::middleware::{Middleware, Next};
use async_trait::async_trait;
use futures::FutureExt;
use std::any::TypeId;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, warn};

/// A transactional scope opened around a single dispatch.
///
/// Implementations wrap whatever the application persists through (a
/// database transaction, an outbox batch). Handlers reach it through
/// [`DispatchContext::unit_of_work`](crate::DispatchContext::unit_of_work).
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    /// Make all pending changes durable.
    async fn commit(&self) -> Result<(), BusError>;

    /// Push pending changes to the store without ending the scope.
    async fn flush(&self) -> Result<(), BusError>;

    /// Discard all pending changes.
    async fn rollback(&self) -> Result<(), BusError>;
}

/// Opens units of work.
#[async_trait]
pub trait UnitOfWorkFactory: Send + Sync {
    async fn begin(&self) -> Result<Arc<dyn UnitOfWork>, BusError>;
}

/// Wraps the rest of the chain in a unit of work.
///
/// Commits on `Ok`, rolls back on `Err`, on a panic in a handler, and when
/// the dispatch future is dropped before completing (caller cancellation).
/// Dispatches that already run inside a unit of work, and request types
/// registered through [`without_transaction`](Self::without_transaction),
/// pass straight through and reuse the caller's scope.
pub struct TransactionMiddleware {
    factory: Arc<dyn UnitOfWorkFactory>,
    opt_out: HashSet<TypeId>,
}

impl TransactionMiddleware {
    pub fn new(factory: Arc<dyn UnitOfWorkFactory>) -> Self {
        Self {
            factory,
            opt_out: HashSet::new(),
        }
    }

    /// Never open a unit of work for `M`.
    pub fn without_transaction<M: 'static>(mut self) -> Self {
        self.opt_out.insert(TypeId::of::<M>());
        self
    }

    fn owns_boundary(&self, envelope: &Envelope) -> bool {
        !self.opt_out.contains(&envelope.type_id()) && envelope.context().unit_of_work().is_none()
    }
}

#[async_trait]
impl Middleware for TransactionMiddleware {
    fn name(&self) -> &'static str {
        "transaction"
    }

    async fn handle(&self, envelope: Envelope, next: Next<'_>) -> DispatchResult {
        if !self.owns_boundary(&envelope) {
            return next.run(envelope).await;
        }

        let message_type = envelope.message_type();
        let uow = self.factory.begin().await?;
        debug!(message_type, "Unit of work started");

        let mut guard = RollbackGuard::new(uow.clone(), message_type);
        let outcome = AssertUnwindSafe(next.run(envelope.with_unit_of_work(uow.clone())))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(reply)) => match uow.commit().await {
                Ok(()) => {
                    guard.disarm();
                    debug!(message_type, "Unit of work committed");
                    Ok(reply)
                }
                Err(err) => {
                    guard.disarm();
                    warn!(message_type, error = %err, "Commit failed, rolling back");
                    rollback(uow.as_ref(), message_type).await;
                    Err(err)
                }
            },
            Ok(Err(err)) => {
                guard.disarm();
                rollback(uow.as_ref(), message_type).await;
                Err(err)
            }
            Err(panic) => {
                guard.disarm();
                rollback(uow.as_ref(), message_type).await;
                std::panic::resume_unwind(panic)
            }
        }
    }
}

async fn rollback(uow: &dyn UnitOfWork, message_type: &'static str) {
    match uow.rollback().await {
        Ok(()) => debug!(message_type, "Unit of work rolled back"),
        Err(err) => warn!(message_type, error = %err, "Rollback failed"),
    }
}

/// Rolls back a unit of work whose dispatch future was dropped mid-flight.
struct RollbackGuard {
    uow: Option<Arc<dyn UnitOfWork>>,
    message_type: &'static str,
}

impl RollbackGuard {
    fn new(uow: Arc<dyn UnitOfWork>, message_type: &'static str) -> Self {
        Self {
            uow: Some(uow),
            message_type,
        }
    }

    fn disarm(&mut self) {
        self.uow = None;
    }
}

impl Drop for RollbackGuard {
    fn drop(&mut self) {
        let Some(uow) = self.uow.take() else {
            return;
        };
        let message_type = self.message_type;

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!(message_type, "Dispatch abandoned, rolling back unit of work");
                runtime.spawn(async move { rollback(uow.as_ref(), message_type).await });
            }
            Err(_) => warn!(
                message_type,
                "Dispatch abandoned outside a runtime, unit of work left to its own cleanup"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::DispatchContext;
    use crate::envelope::Reply;
    use crate::handler::ErasedHandler;
    use crate::message::{Command, Message};
    use crate::middleware::MiddlewareChain;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Journal {
        entries: Mutex<Vec<&'static str>>,
    }

    impl Journal {
        fn record(&self, entry: &'static str) {
            self.entries.lock().push(entry);
        }

        fn entries(&self) -> Vec<&'static str> {
            self.entries.lock().clone()
        }
    }

    struct JournalUnitOfWork {
        journal: Arc<Journal>,
        fail_commit: bool,
    }

    #[async_trait]
    impl UnitOfWork for JournalUnitOfWork {
        async fn commit(&self) -> Result<(), BusError> {
            self.journal.record("commit");
            if self.fail_commit {
                return Err(BusError::Transaction("serialization failure".into()));
            }
            Ok(())
        }

        async fn flush(&self) -> Result<(), BusError> {
            self.journal.record("flush");
            Ok(())
        }

        async fn rollback(&self) -> Result<(), BusError> {
            self.journal.record("rollback");
            Ok(())
        }
    }

    struct JournalFactory {
        journal: Arc<Journal>,
        fail_commit: bool,
    }

    #[async_trait]
    impl UnitOfWorkFactory for JournalFactory {
        async fn begin(&self) -> Result<Arc<dyn UnitOfWork>, BusError> {
            self.journal.record("begin");
            Ok(Arc::new(JournalUnitOfWork {
                journal: self.journal.clone(),
                fail_commit: self.fail_commit,
            }))
        }
    }

    #[derive(Debug)]
    struct TransferFunds;

    impl Message for TransferFunds {}

    impl Command for TransferFunds {
        type Output = ();
    }

    enum Behaviour {
        Succeed,
        Fail,
        Panic,
        Hang,
    }

    struct ScriptedHandler {
        journal: Arc<Journal>,
        behaviour: Behaviour,
    }

    #[async_trait]
    impl ErasedHandler for ScriptedHandler {
        async fn handle_erased(&self, envelope: &Envelope) -> DispatchResult {
            if let Some(uow) = envelope.context().unit_of_work() {
                uow.flush().await?;
            }
            self.journal.record("handle");
            match self.behaviour {
                Behaviour::Succeed => Ok(Arc::new(()) as Reply),
                Behaviour::Fail => Err(BusError::domain("insufficient_funds", "balance too low")),
                Behaviour::Panic => panic!("ledger invariant violated"),
                Behaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(Arc::new(()) as Reply)
                }
            }
        }

        fn handler_name(&self) -> &'static str {
            "ScriptedHandler"
        }
    }

    fn fixture(behaviour: Behaviour, fail_commit: bool) -> (MiddlewareChain, ScriptedHandler, Arc<Journal>) {
        let journal = Arc::new(Journal::default());
        let factory = JournalFactory {
            journal: journal.clone(),
            fail_commit,
        };
        let mut chain = MiddlewareChain::new();
        chain.use_middleware(TransactionMiddleware::new(Arc::new(factory)));
        let handler = ScriptedHandler {
            journal: journal.clone(),
            behaviour,
        };
        (chain, handler, journal)
    }

    #[tokio::test]
    async fn test_commit_on_success() {
        let (chain, handler, journal) = fixture(Behaviour::Succeed, false);
        let envelope = Envelope::command(TransferFunds, DispatchContext::new());

        assert!(chain.dispatch(envelope, &handler).await.is_ok());
        assert_eq!(journal.entries(), vec!["begin", "flush", "handle", "commit"]);
    }

    #[tokio::test]
    async fn test_rollback_on_error() {
        let (chain, handler, journal) = fixture(Behaviour::Fail, false);
        let envelope = Envelope::command(TransferFunds, DispatchContext::new());

        let err = chain.dispatch(envelope, &handler).await.unwrap_err();
        assert!(matches!(err, BusError::Domain(_)));
        assert_eq!(journal.entries(), vec!["begin", "flush", "handle", "rollback"]);
    }

    #[tokio::test]
    async fn test_rollback_when_commit_fails() {
        let (chain, handler, journal) = fixture(Behaviour::Succeed, true);
        let envelope = Envelope::command(TransferFunds, DispatchContext::new());

        let err = chain.dispatch(envelope, &handler).await.unwrap_err();
        assert!(matches!(err, BusError::Transaction(_)));
        assert_eq!(
            journal.entries(),
            vec!["begin", "flush", "handle", "commit", "rollback"]
        );
    }

    #[tokio::test]
    async fn test_rollback_then_resume_panic() {
        let (chain, handler, journal) = fixture(Behaviour::Panic, false);
        let envelope = Envelope::command(TransferFunds, DispatchContext::new());

        let outcome = AssertUnwindSafe(chain.dispatch(envelope, &handler))
            .catch_unwind()
            .await;

        assert!(outcome.is_err());
        assert_eq!(journal.entries(), vec!["begin", "flush", "handle", "rollback"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollback_when_dispatch_is_dropped() {
        let (chain, handler, journal) = fixture(Behaviour::Hang, false);
        let envelope = Envelope::command(TransferFunds, DispatchContext::new());

        let timed_out =
            tokio::time::timeout(Duration::from_secs(1), chain.dispatch(envelope, &handler)).await;
        assert!(timed_out.is_err());

        // The guard spawns the rollback; let it run.
        tokio::task::yield_now().await;
        assert_eq!(journal.entries(), vec!["begin", "flush", "handle", "rollback"]);
    }

    #[tokio::test]
    async fn test_nested_dispatch_reuses_caller_transaction() {
        let (chain, handler, journal) = fixture(Behaviour::Succeed, false);
        let outer = Arc::new(JournalUnitOfWork {
            journal: journal.clone(),
            fail_commit: false,
        });
        let ctx = DispatchContext::new().with_unit_of_work(outer);
        let envelope = Envelope::command(TransferFunds, ctx);

        assert!(chain.dispatch(envelope, &handler).await.is_ok());
        assert_eq!(journal.entries(), vec!["flush", "handle"]);
    }

    #[tokio::test]
    async fn test_opted_out_type_passes_through() {
        let journal = Arc::new(Journal::default());
        let factory = JournalFactory {
            journal: journal.clone(),
            fail_commit: false,
        };
        let mut chain = MiddlewareChain::new();
        chain.use_middleware(
            TransactionMiddleware::new(Arc::new(factory)).without_transaction::<TransferFunds>(),
        );
        let handler = ScriptedHandler {
            journal: journal.clone(),
            behaviour: Behaviour::Fail,
        };

        let envelope = Envelope::command(TransferFunds, DispatchContext::new());
        assert!(chain.dispatch(envelope, &handler).await.is_err());
        assert_eq!(journal.entries(), vec!["handle"]);
    }
}
