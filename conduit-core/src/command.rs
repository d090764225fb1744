//! Command bus

use crate::context::DispatchContext;
use crate::envelope::{Envelope, downcast_reply};
use crate::error::BusError;
use crate::handler::{CommandHandler, HandlerRegistry};
use crate::message::Command;
use crate::middleware::{Middleware, MiddlewareChain};
use std::any::TypeId;
use tracing::warn;

/// Routes each command to its single handler through the middleware chain.
///
/// Build and register during startup, then share (`Arc<CommandBus>`) with
/// whatever dispatches; dispatching only needs `&self`.
#[derive(Default)]
pub struct CommandBus {
    registry: HandlerRegistry,
    chain: MiddlewareChain,
}

impl CommandBus {
    /// Create new command bus with an empty chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a command bus that runs every dispatch through `chain`
    pub fn with_chain(chain: MiddlewareChain) -> Self {
        Self {
            registry: HandlerRegistry::new(),
            chain,
        }
    }

    /// Register a command handler
    ///
    /// Fails with [`BusError::HandlerAlreadyRegistered`] if `C` already has one.
    pub fn register<C, H>(&mut self, handler: H) -> Result<(), BusError>
    where
        C: Command,
        H: CommandHandler<C> + 'static,
    {
        self.registry.register_command::<C, H>(handler)
    }

    /// Append a middleware to the inner end of the chain
    pub fn use_middleware<M: Middleware + 'static>(&mut self, middleware: M) {
        self.chain.use_middleware(middleware);
    }

    pub fn has_handler<C: Command>(&self) -> bool {
        self.registry.contains::<C>()
    }

    pub fn chain(&self) -> &MiddlewareChain {
        &self.chain
    }

    /// Dispatch a command under a fresh root context
    pub async fn dispatch<C: Command>(&self, command: C) -> Result<C::Output, BusError> {
        self.dispatch_with(command, DispatchContext::new()).await
    }

    /// Dispatch a command under `ctx`
    ///
    /// Cancelling `ctx` abandons the dispatch at its next suspension point
    /// and returns [`BusError::Cancelled`].
    pub async fn dispatch_with<C: Command>(
        &self,
        command: C,
        ctx: DispatchContext,
    ) -> Result<C::Output, BusError> {
        let Some(handler) = self.registry.get(&TypeId::of::<C>()) else {
            warn!(command = C::message_name(), "No handler registered");
            return Err(BusError::HandlerNotFound(C::message_name()));
        };

        let cancellation = ctx.cancellation().clone();
        let envelope = Envelope::command(command, ctx);

        let reply = tokio::select! {
            biased;
            _ = cancellation.cancelled() => return Err(BusError::Cancelled),
            result = self.chain.dispatch(envelope, handler.as_ref()) => result?,
        };

        downcast_reply::<C::Output>(reply, C::message_name())
    }
}
