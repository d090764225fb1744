//! Caching middleware for Conduit buses.
//!
//! # Features
//!
//! - **Idempotency** - Commands with an idempotency key run at most once per TTL
//! - **Query cache** - Successful query results are served from the cache
//! - **Event-driven invalidation** - Domain events evict matching keys or tags
//! - **Pluggable store** - Anything implementing [`CacheStore`]; [`InMemoryCache`] included
//!
//! # Examples
//!
//! ```rust,ignore
//! use conduit_cache::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let cache: Arc<dyn CacheStore> = Arc::new(InMemoryCache::new());
//!
//! command_bus.use_middleware(IdempotencyMiddleware::new(cache.clone(), Duration::from_secs(86_400)));
//! query_bus.use_middleware(QueryCacheMiddleware::new(cache.clone(), Duration::from_secs(60)));
//!
//! CacheInvalidationStrategy::new(cache).on::<UserRenamed, _>(&mut event_bus, |event| {
//!     vec![Invalidation::pattern(format!("*user:{}*", event.user_id))]
//! });
//! ```
//!
//! # Key layout
//!
//! - `idempotency:{command_type_name}:{idempotency_key}`
//! - `query:{query_type_name}:{cache_key}`
//!
//! Type names are fully qualified (`std::any::type_name`), so same-named
//! request types from different modules never share entries.

pub mod error;
pub mod idempotency;
pub mod invalidation;
pub mod memory;
pub mod pattern;
pub mod query_cache;
pub mod traits;

pub use error::{CacheError, CacheResult};
pub use idempotency::IdempotencyMiddleware;
pub use invalidation::{CacheInvalidationStrategy, Invalidation};
pub use memory::{CacheEntry, InMemoryCache};
pub use pattern::KeyPattern;
pub use query_cache::QueryCacheMiddleware;
pub use traits::CacheStore;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::{CacheError, CacheResult};
    pub use crate::idempotency::IdempotencyMiddleware;
    pub use crate::invalidation::{CacheInvalidationStrategy, Invalidation};
    pub use crate::memory::InMemoryCache;
    pub use crate::query_cache::QueryCacheMiddleware;
    pub use crate::traits::CacheStore;
}
