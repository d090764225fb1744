// Middleware system for dispatch processing

use crate::envelope::{DispatchResult, Envelope};
use crate::handler::ErasedHandler;
use crate::logging::{debug, error, info, trace, warn};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;

/// Middleware trait for processing requests on their way to the handler
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Short name used in logs and pipeline introspection.
    fn name(&self) -> &'static str;

    /// Process the request and optionally pass it to the rest of the chain
    async fn handle(&self, envelope: Envelope, next: Next<'_>) -> DispatchResult;
}

/// The remainder of the chain, ending in the handler.
///
/// `Next` is `Copy`: a middleware may run it more than once (retry) or not
/// at all (short-circuit).
#[derive(Clone, Copy)]
pub struct Next<'a> {
    middlewares: &'a [Arc<dyn Middleware>],
    handler: &'a dyn ErasedHandler,
}

impl<'a> Next<'a> {
    /// Run the rest of the chain.
    pub fn run(self, envelope: Envelope) -> BoxFuture<'a, DispatchResult> {
        match self.middlewares.split_first() {
            Some((middleware, rest)) => {
                trace!(middleware = middleware.name(), "Executing middleware");
                let next = Next {
                    middlewares: rest,
                    handler: self.handler,
                };
                middleware.handle(envelope, next)
            }
            None => {
                trace!("Middleware chain complete, calling handler");
                let handler = self.handler;
                Box::pin(async move { handler.handle_erased(&envelope).await })
            }
        }
    }

    /// Number of middleware still ahead of the handler.
    pub fn remaining(&self) -> usize {
        self.middlewares.len()
    }
}

/// Middleware chain executor
#[derive(Clone)]
pub struct MiddlewareChain {
    middlewares: Arc<Vec<Arc<dyn Middleware>>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self {
            middlewares: Arc::new(Vec::new()),
        }
    }

    /// Add a middleware to the inner end of the chain
    pub fn use_middleware<M: Middleware + 'static>(&mut self, middleware: M) {
        self.push(Arc::new(middleware));
    }

    /// Add an already shared middleware to the inner end of the chain
    pub fn push(&mut self, middleware: Arc<dyn Middleware>) {
        let mut mws = (*self.middlewares).clone();
        mws.push(middleware);
        self.middlewares = Arc::new(mws);
    }

    /// Middleware names, outermost first.
    pub fn names(&self) -> Vec<&'static str> {
        self.middlewares.iter().map(|m| m.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Execute the middleware chain with a handler
    pub async fn dispatch(&self, envelope: Envelope, handler: &dyn ErasedHandler) -> DispatchResult {
        debug!(
            middleware_count = self.middlewares.len(),
            message_type = envelope.message_type(),
            request_id = %envelope.request_id(),
            "Executing middleware chain"
        );
        let next = Next {
            middlewares: &self.middlewares,
            handler,
        };
        next.run(envelope).await
    }
}

impl Default for MiddlewareChain {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewareChain")
            .field("middlewares", &self.names())
            .finish()
    }
}

// ========== Built-in Middleware ==========

/// Logs every dispatch with its outcome and total latency.
///
/// Belongs at the outer end of the chain so the latency covers retries and
/// the logged outcome is the one the caller sees.
pub struct LoggingMiddleware {
    /// Log successful dispatches at `info` instead of `debug`
    pub log_success_as_info: bool,
    /// Latency above which a successful dispatch is logged as slow
    pub slow_threshold_ms: Option<u64>,
}

impl LoggingMiddleware {
    /// Create a new logging middleware with default settings
    pub fn new() -> Self {
        Self {
            log_success_as_info: true,
            slow_threshold_ms: None,
        }
    }

    /// Log successful dispatches at `debug` level
    pub fn quiet(mut self) -> Self {
        self.log_success_as_info = false;
        self
    }

    /// Warn when a dispatch takes longer than `ms`
    pub fn with_slow_threshold_ms(mut self, ms: u64) -> Self {
        self.slow_threshold_ms = Some(ms);
        self
    }
}

impl Default for LoggingMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &'static str {
        "logging"
    }

    async fn handle(&self, envelope: Envelope, next: Next<'_>) -> DispatchResult {
        let message_type = envelope.message_type();
        let kind = envelope.kind().as_str();
        let span = tracing::info_span!(
            "dispatch",
            message_type,
            kind,
            request_id = %envelope.request_id(),
            correlation_id = %envelope.context().correlation_id(),
        );

        async move {
            let start = Instant::now();
            let result = next.run(envelope).await;
            let elapsed_ms = start.elapsed().as_millis() as u64;

            match &result {
                Ok(_) => {
                    if self.slow_threshold_ms.is_some_and(|limit| elapsed_ms > limit) {
                        warn!(elapsed_ms, "Slow dispatch");
                    } else if self.log_success_as_info {
                        info!(elapsed_ms, "Dispatch completed");
                    } else {
                        debug!(elapsed_ms, "Dispatch completed");
                    }
                }
                Err(err) if err.is_client_error() => {
                    warn!(elapsed_ms, error_kind = %err.kind(), error = %err, "Dispatch rejected");
                }
                Err(err) => {
                    error!(elapsed_ms, error_kind = %err.kind(), error = %err, "Dispatch failed");
                }
            }

            result
        }
        .instrument(span)
        .await
    }
}
