//! Event handler traits

use crate::context::DispatchContext;
use crate::error::BusError;
use crate::message::{Event, short_type_name};
use async_trait::async_trait;
use std::any::Any;
use std::marker::PhantomData;

/// Event handler trait
///
/// Any number of handlers may subscribe to the same event type.
#[async_trait]
pub trait EventHandler<E: Event>: Send + Sync {
    /// Handle the event
    async fn handle(&self, event: &E, ctx: &DispatchContext) -> Result<(), BusError>;

    /// Name reported when this handler fails.
    fn name(&self) -> &str {
        short_type_name::<Self>()
    }
}

/// Type-erased event handler
#[async_trait]
pub trait DynEventHandler: Send + Sync {
    /// Handle event (type-erased)
    async fn handle_dyn(
        &self,
        event: &(dyn Any + Send + Sync),
        ctx: &DispatchContext,
    ) -> Result<(), BusError>;

    fn name(&self) -> &str;
}

/// Wrapper for typed event handlers
pub struct TypedEventHandler<E: Event, H: EventHandler<E>> {
    handler: H,
    _phantom: PhantomData<fn(&E)>,
}

impl<E: Event, H: EventHandler<E>> TypedEventHandler<E, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

#[async_trait]
impl<E: Event, H: EventHandler<E>> DynEventHandler for TypedEventHandler<E, H> {
    async fn handle_dyn(
        &self,
        event: &(dyn Any + Send + Sync),
        ctx: &DispatchContext,
    ) -> Result<(), BusError> {
        match event.downcast_ref::<E>() {
            Some(typed_event) => self.handler.handle(typed_event, ctx).await,
            None => Err(BusError::Internal(format!(
                "Type mismatch: expected {}",
                E::message_name()
            ))),
        }
    }

    fn name(&self) -> &str {
        self.handler.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    #[derive(Debug)]
    struct InvoicePaid;

    impl Message for InvoicePaid {}
    impl Event for InvoicePaid {}

    #[derive(Debug)]
    struct InvoiceVoided;

    impl Message for InvoiceVoided {}
    impl Event for InvoiceVoided {}

    struct MarkLedger;

    #[async_trait]
    impl EventHandler<InvoicePaid> for MarkLedger {
        async fn handle(&self, _: &InvoicePaid, _: &DispatchContext) -> Result<(), BusError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_typed_handler_dispatch_and_name() {
        let handler = TypedEventHandler::new(MarkLedger);
        let ctx = DispatchContext::new();

        assert_eq!(handler.name(), "MarkLedger");
        assert!(handler.handle_dyn(&InvoicePaid, &ctx).await.is_ok());
        assert!(matches!(
            handler.handle_dyn(&InvoiceVoided, &ctx).await,
            Err(BusError::Internal(_))
        ));
    }
}
