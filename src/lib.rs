// Conduit - in-process command, query and event dispatch
//
// Buses route typed requests to their handlers through a fixed-order chain of
// middleware: logging, metrics, idempotency, query caching, circuit breaking,
// retry, validation and transactions.

// Re-export core functionality
pub use conduit_core::*;

pub mod pipeline;

pub use pipeline::{PipelineBuilder, Stage};

// Re-export optional crates
#[cfg(feature = "resilience")]
pub use conduit_resilience;

#[cfg(feature = "cache")]
pub use conduit_cache;

#[cfg(feature = "validation")]
pub use conduit_validation;

#[cfg(feature = "metrics")]
pub use conduit_metrics;

// Prelude for common imports
pub mod prelude {
    pub use crate::pipeline::{PipelineBuilder, Stage};
    pub use crate::{
        BusError, CancellationToken, Command, CommandBus, CommandHandler, DispatchContext,
        DomainError, Event, EventBus, EventBusConfig, EventHandler, LoggingMiddleware, Message,
        Middleware, PipelineConfig, Query, QueryBus, QueryHandler, TransactionMiddleware,
        UnitOfWork, UnitOfWorkFactory, ValidationError,
    };

    #[cfg(feature = "cache")]
    pub use conduit_cache::{CacheInvalidationStrategy, CacheStore, InMemoryCache, Invalidation};

    #[cfg(feature = "resilience")]
    pub use conduit_resilience::{CircuitBreakerConfig, RetryPolicy};

    #[cfg(feature = "validation")]
    pub use conduit_validation::{Validate, ValidationMiddleware, ValidationRules};

    #[cfg(feature = "metrics")]
    pub use conduit_metrics::MetricsMiddleware;
}
