//! Query bus

use crate::context::DispatchContext;
use crate::envelope::{Envelope, downcast_reply};
use crate::error::BusError;
use crate::handler::{HandlerRegistry, QueryHandler};
use crate::message::Query;
use crate::middleware::{Middleware, MiddlewareChain};
use std::any::TypeId;
use tracing::warn;

/// Query bus
///
/// Same routing as [`CommandBus`](crate::CommandBus). Its chain usually
/// carries the query cache and leaves out the transaction middleware.
#[derive(Default)]
pub struct QueryBus {
    registry: HandlerRegistry,
    chain: MiddlewareChain,
}

impl QueryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chain(chain: MiddlewareChain) -> Self {
        Self {
            registry: HandlerRegistry::new(),
            chain,
        }
    }

    /// Register a query handler
    pub fn register<Q, H>(&mut self, handler: H) -> Result<(), BusError>
    where
        Q: Query,
        H: QueryHandler<Q> + 'static,
    {
        self.registry.register_query::<Q, H>(handler)
    }

    pub fn use_middleware<M: Middleware + 'static>(&mut self, middleware: M) {
        self.chain.use_middleware(middleware);
    }

    pub fn has_handler<Q: Query>(&self) -> bool {
        self.registry.contains::<Q>()
    }

    pub fn chain(&self) -> &MiddlewareChain {
        &self.chain
    }

    /// Dispatch a query under a fresh root context
    pub async fn dispatch<Q: Query>(&self, query: Q) -> Result<Q::Output, BusError> {
        self.dispatch_with(query, DispatchContext::new()).await
    }

    /// Dispatch a query under `ctx`
    pub async fn dispatch_with<Q: Query>(
        &self,
        query: Q,
        ctx: DispatchContext,
    ) -> Result<Q::Output, BusError> {
        let Some(handler) = self.registry.get(&TypeId::of::<Q>()) else {
            warn!(query = Q::message_name(), "No handler registered");
            return Err(BusError::HandlerNotFound(Q::message_name()));
        };

        let cancellation = ctx.cancellation().clone();
        let envelope = Envelope::query(query, ctx);

        let reply = tokio::select! {
            biased;
            _ = cancellation.cancelled() => return Err(BusError::Cancelled),
            result = self.chain.dispatch(envelope, handler.as_ref()) => result?,
        };

        downcast_reply::<Q::Output>(reply, Q::message_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use async_trait::async_trait;

    #[derive(Debug, Clone, PartialEq)]
    struct User {
        id: String,
        email: String,
    }

    #[derive(Debug)]
    struct GetUserQuery {
        user_id: String,
    }

    impl Message for GetUserQuery {}

    impl Query for GetUserQuery {
        type Output = User;
    }

    #[derive(Debug)]
    struct ListUsersQuery;

    impl Message for ListUsersQuery {}

    impl Query for ListUsersQuery {
        type Output = Vec<User>;
    }

    struct GetUserHandler;

    #[async_trait]
    impl QueryHandler<GetUserQuery> for GetUserHandler {
        async fn handle(&self, query: &GetUserQuery, _: &DispatchContext) -> Result<User, BusError> {
            Ok(User {
                id: query.user_id.clone(),
                email: "alice@example.com".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_query_bus() {
        let mut bus = QueryBus::new();
        bus.register::<GetUserQuery, _>(GetUserHandler).unwrap();

        let user = bus
            .dispatch(GetUserQuery {
                user_id: "user-123".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(user.id, "user-123");
        assert_eq!(user.email, "alice@example.com");
    }

    #[tokio::test]
    async fn test_unregistered_query() {
        let bus = QueryBus::new();
        assert!(matches!(
            bus.dispatch(ListUsersQuery).await,
            Err(BusError::HandlerNotFound("ListUsersQuery"))
        ));
    }

    #[tokio::test]
    async fn test_cancelled_before_dispatch() {
        let mut bus = QueryBus::new();
        bus.register::<GetUserQuery, _>(GetUserHandler).unwrap();

        let ctx = DispatchContext::new();
        ctx.cancellation().cancel();

        let result = bus
            .dispatch_with(
                GetUserQuery {
                    user_id: "user-123".to_string(),
                },
                ctx,
            )
            .await;
        assert!(matches!(result, Err(BusError::Cancelled)));
    }
}
