//! Fixed-order middleware pipelines.
//!
//! Whatever order stages are added in, chains are built
//! Logging → Metrics → Idempotency / QueryCache → CircuitBreaker → Retry →
//! Validation → Transaction → handler.

use conduit_core::config::PipelineConfig;
use conduit_core::{
    Clock, CommandBus, LoggingMiddleware, MessageKind, Middleware, MiddlewareChain, QueryBus,
    TransactionMiddleware, system_clock,
};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

#[cfg(feature = "cache")]
use conduit_cache::{CacheStore, IdempotencyMiddleware, QueryCacheMiddleware};
#[cfg(feature = "cache")]
use conduit_core::config::CacheSettings;
#[cfg(feature = "metrics")]
use conduit_metrics::MetricsMiddleware;
#[cfg(feature = "resilience")]
use conduit_resilience::{
    CircuitBreakerConfig, CircuitBreakerMiddleware, RetryMiddleware, RetryPolicy,
};
#[cfg(feature = "validation")]
use conduit_validation::ValidationMiddleware;

/// Pipeline position, outermost first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Logging,
    Metrics,
    Idempotency,
    QueryCache,
    CircuitBreaker,
    Retry,
    Validation,
    Transaction,
}

impl Stage {
    /// Every stage, outermost first.
    pub const ORDER: [Stage; 8] = [
        Stage::Logging,
        Stage::Metrics,
        Stage::Idempotency,
        Stage::QueryCache,
        Stage::CircuitBreaker,
        Stage::Retry,
        Stage::Validation,
        Stage::Transaction,
    ];

    /// Whether the stage belongs on a bus carrying `kind`.
    pub fn applies_to(&self, kind: MessageKind) -> bool {
        match self {
            Stage::Idempotency | Stage::Transaction => kind == MessageKind::Command,
            Stage::QueryCache => kind == MessageKind::Query,
            _ => true,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Logging => "logging",
            Stage::Metrics => "metrics",
            Stage::Idempotency => "idempotency",
            Stage::QueryCache => "query_cache",
            Stage::CircuitBreaker => "circuit_breaker",
            Stage::Retry => "retry",
            Stage::Validation => "validation",
            Stage::Transaction => "transaction",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Collects one middleware per [`Stage`] and builds ordered chains from them.
///
/// Middleware instances are shared between the chains built here, so a
/// command bus and a query bus built from one builder share breaker state
/// and caches.
///
/// ```rust,ignore
/// let pipeline = PipelineBuilder::from_config(&config)
///     .cache_store(cache.clone(), &config.cache)
///     .validation(validation)
///     .transaction(TransactionMiddleware::new(uow_factory));
///
/// let mut commands = pipeline.command_bus();
/// let mut queries = pipeline.query_bus();
/// ```
#[derive(Clone, Default)]
pub struct PipelineBuilder {
    stages: BTreeMap<Stage, Arc<dyn Middleware>>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Logging, retry and circuit breaking configured from `config`.
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::from_config_with_clock(config, system_clock())
    }

    /// Same as [`from_config`](Self::from_config), with retry sleeps and
    /// breaker timeouts driven by `clock`.
    #[cfg_attr(not(feature = "resilience"), allow(unused_variables))]
    pub fn from_config_with_clock(config: &PipelineConfig, clock: Arc<dyn Clock>) -> Self {
        let builder = Self::new().logging(LoggingMiddleware::new());

        #[cfg(feature = "resilience")]
        let builder = builder
            .circuit_breaker(
                CircuitBreakerMiddleware::new(CircuitBreakerConfig::from_settings(
                    &config.circuit_breaker,
                ))
                .with_clock(clock.clone()),
            )
            .retry(RetryMiddleware::new(RetryPolicy::from_settings(&config.retry)).with_clock(clock));

        builder
    }

    /// Put `middleware` at `stage`, replacing whatever was there.
    pub fn stage(mut self, stage: Stage, middleware: Arc<dyn Middleware>) -> Self {
        if self.stages.insert(stage, middleware).is_some() {
            debug!(stage = stage.as_str(), "Replaced pipeline stage");
        }
        self
    }

    /// Take `stage` out of the pipeline.
    pub fn without(mut self, stage: Stage) -> Self {
        self.stages.remove(&stage);
        self
    }

    pub fn logging(self, middleware: LoggingMiddleware) -> Self {
        self.stage(Stage::Logging, Arc::new(middleware))
    }

    pub fn transaction(self, middleware: TransactionMiddleware) -> Self {
        self.stage(Stage::Transaction, Arc::new(middleware))
    }

    #[cfg(feature = "metrics")]
    pub fn metrics(self, middleware: MetricsMiddleware) -> Self {
        self.stage(Stage::Metrics, Arc::new(middleware))
    }

    #[cfg(feature = "cache")]
    pub fn idempotency(self, middleware: IdempotencyMiddleware) -> Self {
        self.stage(Stage::Idempotency, Arc::new(middleware))
    }

    #[cfg(feature = "cache")]
    pub fn query_cache(self, middleware: QueryCacheMiddleware) -> Self {
        self.stage(Stage::QueryCache, Arc::new(middleware))
    }

    /// Idempotency and query caching over one store.
    #[cfg(feature = "cache")]
    pub fn cache_store(self, store: Arc<dyn CacheStore>, settings: &CacheSettings) -> Self {
        self.idempotency(IdempotencyMiddleware::from_settings(store.clone(), settings))
            .query_cache(QueryCacheMiddleware::from_settings(store, settings))
    }

    #[cfg(feature = "resilience")]
    pub fn circuit_breaker(self, middleware: CircuitBreakerMiddleware) -> Self {
        self.stage(Stage::CircuitBreaker, Arc::new(middleware))
    }

    #[cfg(feature = "resilience")]
    pub fn retry(self, middleware: RetryMiddleware) -> Self {
        self.stage(Stage::Retry, Arc::new(middleware))
    }

    #[cfg(feature = "validation")]
    pub fn validation(self, middleware: ValidationMiddleware) -> Self {
        self.stage(Stage::Validation, Arc::new(middleware))
    }

    /// Stages present, outermost first.
    pub fn stages(&self) -> Vec<Stage> {
        self.stages.keys().copied().collect()
    }

    /// Chain of every configured stage.
    pub fn build(&self) -> MiddlewareChain {
        self.chain_where(|_| true)
    }

    /// Chain of the stages that apply to `kind`.
    pub fn build_for(&self, kind: MessageKind) -> MiddlewareChain {
        self.chain_where(|stage| stage.applies_to(kind))
    }

    pub fn command_bus(&self) -> CommandBus {
        CommandBus::with_chain(self.build_for(MessageKind::Command))
    }

    pub fn query_bus(&self) -> QueryBus {
        QueryBus::with_chain(self.build_for(MessageKind::Query))
    }

    fn chain_where(&self, include: impl Fn(Stage) -> bool) -> MiddlewareChain {
        let mut chain = MiddlewareChain::new();
        for (stage, middleware) in &self.stages {
            if include(*stage) {
                chain.push(middleware.clone());
            }
        }
        chain
    }
}

impl fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("stages", &self.stages())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use conduit_core::{BusError, UnitOfWork, UnitOfWorkFactory};

    struct NoopUnitOfWork;

    #[async_trait]
    impl UnitOfWork for NoopUnitOfWork {
        async fn commit(&self) -> Result<(), BusError> {
            Ok(())
        }

        async fn flush(&self) -> Result<(), BusError> {
            Ok(())
        }

        async fn rollback(&self) -> Result<(), BusError> {
            Ok(())
        }
    }

    struct NoopFactory;

    #[async_trait]
    impl UnitOfWorkFactory for NoopFactory {
        async fn begin(&self) -> Result<Arc<dyn UnitOfWork>, BusError> {
            Ok(Arc::new(NoopUnitOfWork))
        }
    }

    #[test]
    fn test_stage_order_is_fixed() {
        let mut sorted = Stage::ORDER.to_vec();
        sorted.sort();
        assert_eq!(sorted, Stage::ORDER.to_vec());
    }

    #[test]
    fn test_chain_order_ignores_insertion_order() {
        let pipeline = PipelineBuilder::new()
            .transaction(TransactionMiddleware::new(Arc::new(NoopFactory)))
            .logging(LoggingMiddleware::new());

        assert_eq!(pipeline.stages(), vec![Stage::Logging, Stage::Transaction]);
        assert_eq!(pipeline.build().names(), vec!["logging", "transaction"]);
    }

    #[test]
    fn test_query_chain_skips_transaction() {
        let pipeline = PipelineBuilder::new()
            .logging(LoggingMiddleware::new())
            .transaction(TransactionMiddleware::new(Arc::new(NoopFactory)));

        assert_eq!(
            pipeline.build_for(MessageKind::Query).names(),
            vec!["logging"]
        );
        assert_eq!(pipeline.command_bus().chain().len(), 2);
        assert_eq!(pipeline.without(Stage::Logging).query_bus().chain().len(), 0);
    }

    #[cfg(feature = "resilience")]
    #[test]
    fn test_from_config() {
        let pipeline = PipelineBuilder::from_config(&PipelineConfig::default());
        assert_eq!(
            pipeline.build().names(),
            vec!["logging", "circuit_breaker", "retry"]
        );
    }
}
