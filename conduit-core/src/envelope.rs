//! Type-erased request envelope passed along the middleware chain.

use crate::context::DispatchContext;
use crate::error::BusError;
use crate::message::{Command, Message, MessageMetadata, Query};
use crate::unit_of_work::UnitOfWork;
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Type-erased handler output. Cached replies are shared, never copied.
pub type Reply = Arc<dyn Any + Send + Sync>;

/// What every middleware and handler returns.
pub type DispatchResult = Result<Reply, BusError>;

/// Whether an envelope carries a command or a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Command,
    Query,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Command => "command",
            MessageKind::Query => "query",
        }
    }
}

/// Caching instructions extracted from a [`Query`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePolicy {
    /// Query-supplied key (without the type prefix)
    pub key: String,
    /// Query-supplied TTL, `None` for the cache default
    pub ttl: Option<Duration>,
    /// Tags for tag-based invalidation
    pub tags: Vec<String>,
}

/// A request in flight.
///
/// Cloning shares the underlying message, so middleware can re-run the rest
/// of the chain (retry) without requiring `Clone` on the request type.
#[derive(Clone)]
pub struct Envelope {
    message: Arc<dyn Any + Send + Sync>,
    type_id: TypeId,
    type_name: &'static str,
    message_type: &'static str,
    kind: MessageKind,
    metadata: MessageMetadata,
    idempotency_key: Option<String>,
    cache: Option<CachePolicy>,
    context: DispatchContext,
}

impl Envelope {
    /// Wrap a command.
    pub fn command<C: Command>(command: C, context: DispatchContext) -> Self {
        let idempotency_key = command.idempotency_key().map(str::to_owned);
        let metadata = resolve_metadata(&command, &context);

        Self {
            message: Arc::new(command),
            type_id: TypeId::of::<C>(),
            type_name: std::any::type_name::<C>(),
            message_type: C::message_name(),
            kind: MessageKind::Command,
            metadata,
            idempotency_key,
            cache: None,
            context,
        }
    }

    /// Wrap a query.
    pub fn query<Q: Query>(query: Q, context: DispatchContext) -> Self {
        let cache = query.cache_key().map(|key| CachePolicy {
            key,
            ttl: query.cache_ttl(),
            tags: query.cache_tags(),
        });
        let metadata = resolve_metadata(&query, &context);

        Self {
            message: Arc::new(query),
            type_id: TypeId::of::<Q>(),
            type_name: std::any::type_name::<Q>(),
            message_type: Q::message_name(),
            kind: MessageKind::Query,
            metadata,
            idempotency_key: None,
            cache,
            context,
        }
    }

    /// Borrow the concrete request.
    pub fn message<M: 'static>(&self) -> Option<&M> {
        self.message.downcast_ref::<M>()
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Fully qualified type name, generics included. Distinct request types
    /// with the same short name differ here, so cache keys are built from it.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Short type name for logs and metric labels.
    pub fn message_type(&self) -> &'static str {
        self.message_type
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn metadata(&self) -> &MessageMetadata {
        &self.metadata
    }

    pub fn request_id(&self) -> Uuid {
        self.metadata.id
    }

    pub fn idempotency_key(&self) -> Option<&str> {
        self.idempotency_key.as_deref()
    }

    pub fn cache_policy(&self) -> Option<&CachePolicy> {
        self.cache.as_ref()
    }

    pub fn context(&self) -> &DispatchContext {
        &self.context
    }

    /// Same envelope, enlisted in `uow`.
    pub fn with_unit_of_work(mut self, uow: Arc<dyn UnitOfWork>) -> Self {
        self.context = self.context.with_unit_of_work(uow);
        self
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("message_type", &self.message_type)
            .field("kind", &self.kind)
            .field("request_id", &self.metadata.id)
            .field("idempotency_key", &self.idempotency_key)
            .field("cache", &self.cache)
            .field("context", &self.context)
            .finish()
    }
}

fn resolve_metadata<M: Message>(message: &M, context: &DispatchContext) -> MessageMetadata {
    let mut metadata = message.metadata().cloned().unwrap_or_default();
    if metadata.correlation_id.is_none() {
        metadata.correlation_id = Some(context.correlation_id());
    }
    if metadata.causation_id.is_none() {
        metadata.causation_id = context.causation_id();
    }
    metadata
}

/// Recover the typed output from a [`Reply`].
///
/// Avoids a clone when the reply is not shared with a cache.
pub fn downcast_reply<T>(reply: Reply, message_type: &'static str) -> Result<T, BusError>
where
    T: Clone + Send + Sync + 'static,
{
    match reply.downcast::<T>() {
        Ok(typed) => Ok(Arc::try_unwrap(typed).unwrap_or_else(|shared| (*shared).clone())),
        Err(_) => Err(BusError::Internal(format!(
            "Result type mismatch for {}",
            message_type
        ))),
    }
}
