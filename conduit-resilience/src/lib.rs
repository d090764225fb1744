//! # Resilience Middleware
//!
//! Fault-handling middleware for the Conduit buses.
//!
//! ## Patterns Included
//!
//! - **Circuit Breaker**: Fail fast, per request type, once a handler keeps failing
//! - **Retry**: Re-run the rest of the chain with exponential backoff and jitter
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use conduit_core::CommandBus;
//! use conduit_resilience::{CircuitBreakerConfig, CircuitBreakerMiddleware, RetryMiddleware, RetryPolicy};
//! use std::time::Duration;
//!
//! let mut bus = CommandBus::new();
//!
//! // Breaker outside retry: one logical failure per exhausted retry loop
//! bus.use_middleware(CircuitBreakerMiddleware::new(
//!     CircuitBreakerConfig::default()
//!         .failure_threshold(5)
//!         .reset_timeout(Duration::from_secs(30)),
//! ));
//! bus.use_middleware(RetryMiddleware::new(
//!     RetryPolicy::new(3).base_delay(Duration::from_millis(100)),
//! ));
//! ```

mod circuit_breaker;
mod retry;

pub use circuit_breaker::*;
pub use retry::*;
