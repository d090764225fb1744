//! In-process command, query and event dispatch for Conduit
//!
//! This crate provides the buses and the middleware chain every request
//! passes through.
//!
//! ## Features
//!
//! - **Command Bus** - Route each write request to exactly one handler
//! - **Query Bus** - Route each read request to exactly one handler
//! - **Event Bus** - Broadcast to any number of subscribers with isolated failures
//! - **Middleware** - Ordered chain of cross-cutting concerns around the handler
//! - **Transactions** - Unit-of-work boundary with rollback on every failure path
//! - **Explicit context** - Correlation, cancellation and the open unit of work
//!   travel in a [`DispatchContext`], never in globals
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use async_trait::async_trait;
//! use conduit_core::*;
//!
//! #[derive(Debug)]
//! struct CreateUserCommand {
//!     email: String,
//! }
//!
//! impl Message for CreateUserCommand {}
//!
//! impl Command for CreateUserCommand {
//!     type Output = String; // User ID
//! }
//!
//! struct CreateUserHandler;
//!
//! #[async_trait]
//! impl CommandHandler<CreateUserCommand> for CreateUserHandler {
//!     async fn handle(
//!         &self,
//!         command: &CreateUserCommand,
//!         _ctx: &DispatchContext,
//!     ) -> Result<String, BusError> {
//!         Ok(format!("user-{}", command.email))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), BusError> {
//!     let mut command_bus = CommandBus::new();
//!     command_bus.use_middleware(LoggingMiddleware::new());
//!     command_bus.register::<CreateUserCommand, _>(CreateUserHandler)?;
//!
//!     let user_id = command_bus
//!         .dispatch(CreateUserCommand {
//!             email: "alice@example.com".to_string(),
//!         })
//!         .await?;
//!     println!("Created {}", user_id);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Nested dispatch
//!
//! A handler that dispatches further commands passes a nested context so
//! the inner dispatch joins the caller's unit of work instead of opening
//! its own:
//!
//! ```rust,ignore
//! #[async_trait]
//! impl CommandHandler<PlaceOrder> for PlaceOrderHandler {
//!     async fn handle(&self, command: &PlaceOrder, ctx: &DispatchContext) -> Result<OrderId, BusError> {
//!         let order_id = self.orders.insert(command).await?;
//!         self.commands
//!             .dispatch_with(ReserveStock::from(command), ctx.nested(command.request_id()))
//!             .await?;
//!         Ok(order_id)
//!     }
//! }
//! ```

pub mod clock;
pub mod command;
pub mod config;
pub mod context;
pub mod envelope;
pub mod error;
pub mod event;
pub mod event_bus;
pub mod handler;
pub mod logging;
pub mod message;
pub mod middleware;
pub mod query;
pub mod unit_of_work;

pub use clock::{Clock, ManualClock, TokioClock, system_clock};
pub use command::CommandBus;
pub use config::{
    CacheSettings, CircuitBreakerSettings, ConfigError, PipelineConfig, RetrySettings,
    ValidationSettings,
};
pub use context::DispatchContext;
pub use envelope::{CachePolicy, DispatchResult, Envelope, MessageKind, Reply, downcast_reply};
pub use error::{
    BusError, DomainError, ErrorKind, EventHandlerError, HandlerFailure, ValidationError,
    ValidationErrors,
};
pub use event::{DynEventHandler, EventHandler, TypedEventHandler};
pub use event_bus::{EventBus, EventBusConfig};
pub use handler::{CommandHandler, ErasedHandler, HandlerRegistry, QueryHandler};
pub use message::{Command, Event, Message, MessageMetadata, Query, short_type_name};
pub use middleware::{LoggingMiddleware, Middleware, MiddlewareChain, Next};
pub use query::QueryBus;
pub use unit_of_work::{TransactionMiddleware, UnitOfWork, UnitOfWorkFactory};

// Re-exported so handlers and middleware crates can name the token type
// without a direct tokio-util dependency.
pub use tokio_util::sync::CancellationToken;
