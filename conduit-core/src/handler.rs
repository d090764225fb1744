//! Handler traits and the startup-built handler registry.

use crate::context::DispatchContext;
use crate::envelope::{DispatchResult, Envelope, Reply};
use crate::error::BusError;
use crate::message::{Command, Query, short_type_name};
use async_trait::async_trait;
use std::any::TypeId;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::marker::PhantomData;
use std::sync::Arc;

/// Command handler trait
#[async_trait]
pub trait CommandHandler<C: Command>: Send + Sync {
    /// Handle the command
    async fn handle(&self, command: &C, ctx: &DispatchContext) -> Result<C::Output, BusError>;
}

/// Query handler trait
#[async_trait]
pub trait QueryHandler<Q: Query>: Send + Sync {
    /// Handle the query
    async fn handle(&self, query: &Q, ctx: &DispatchContext) -> Result<Q::Output, BusError>;
}

/// Type-erased handler, the terminal link of every middleware chain.
#[async_trait]
pub trait ErasedHandler: Send + Sync {
    async fn handle_erased(&self, envelope: &Envelope) -> DispatchResult;

    /// Handler type name, for diagnostics.
    fn handler_name(&self) -> &'static str;
}

/// Wrapper for typed command handlers
struct TypedCommandHandler<C: Command, H: CommandHandler<C>> {
    handler: H,
    _phantom: PhantomData<fn() -> C>,
}

#[async_trait]
impl<C: Command, H: CommandHandler<C>> ErasedHandler for TypedCommandHandler<C, H> {
    async fn handle_erased(&self, envelope: &Envelope) -> DispatchResult {
        let command = envelope.message::<C>().ok_or_else(|| {
            BusError::Internal(format!("Type mismatch: expected {}", C::message_name()))
        })?;
        let output = self.handler.handle(command, envelope.context()).await?;
        Ok(Arc::new(output) as Reply)
    }

    fn handler_name(&self) -> &'static str {
        short_type_name::<H>()
    }
}

/// Wrapper for typed query handlers
struct TypedQueryHandler<Q: Query, H: QueryHandler<Q>> {
    handler: H,
    _phantom: PhantomData<fn() -> Q>,
}

#[async_trait]
impl<Q: Query, H: QueryHandler<Q>> ErasedHandler for TypedQueryHandler<Q, H> {
    async fn handle_erased(&self, envelope: &Envelope) -> DispatchResult {
        let query = envelope.message::<Q>().ok_or_else(|| {
            BusError::Internal(format!("Type mismatch: expected {}", Q::message_name()))
        })?;
        let output = self.handler.handle(query, envelope.context()).await?;
        Ok(Arc::new(output) as Reply)
    }

    fn handler_name(&self) -> &'static str {
        short_type_name::<H>()
    }
}

/// Maps a request type to its single handler.
///
/// Populated during startup through `&mut self`; once the owning bus is
/// shared it is read-only and needs no locking.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TypeId, Arc<dyn ErasedHandler>>,
    names: Vec<&'static str>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for command `C`.
    pub fn register_command<C, H>(&mut self, handler: H) -> Result<(), BusError>
    where
        C: Command,
        H: CommandHandler<C> + 'static,
    {
        let handler = TypedCommandHandler {
            handler,
            _phantom: PhantomData,
        };
        self.insert(TypeId::of::<C>(), C::message_name(), Arc::new(handler))
    }

    /// Register the handler for query `Q`.
    pub fn register_query<Q, H>(&mut self, handler: H) -> Result<(), BusError>
    where
        Q: Query,
        H: QueryHandler<Q> + 'static,
    {
        let handler = TypedQueryHandler {
            handler,
            _phantom: PhantomData,
        };
        self.insert(TypeId::of::<Q>(), Q::message_name(), Arc::new(handler))
    }

    fn insert(
        &mut self,
        type_id: TypeId,
        name: &'static str,
        handler: Arc<dyn ErasedHandler>,
    ) -> Result<(), BusError> {
        match self.handlers.entry(type_id) {
            Entry::Occupied(_) => Err(BusError::HandlerAlreadyRegistered(name)),
            Entry::Vacant(slot) => {
                tracing::debug!(
                    message_type = name,
                    handler = handler.handler_name(),
                    "Registered handler"
                );
                slot.insert(handler);
                self.names.push(name);
                Ok(())
            }
        }
    }

    pub fn get(&self, type_id: &TypeId) -> Option<&Arc<dyn ErasedHandler>> {
        self.handlers.get(type_id)
    }

    pub fn contains<M: 'static>(&self) -> bool {
        self.handlers.contains_key(&TypeId::of::<M>())
    }

    /// Registered request type names, in registration order.
    pub fn registered(&self) -> &[&'static str] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
