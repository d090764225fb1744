//! At-most-once execution of commands carrying an idempotency key.

use crate::traits::CacheStore;
use async_trait::async_trait;
use conduit_core::config::CacheSettings;
use conduit_core::{DispatchResult, Envelope, MessageKind, Middleware, Next};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Replays the stored reply of a command whose idempotency key was seen
/// within the TTL.
///
/// Only successful replies are stored, so a command that failed can be
/// retried under the same key. Concurrent dispatches of the same key are
/// serialized: the second waits for the first and then replays its reply.
///
/// Cache failures never fail the dispatch; the command runs as if the key
/// were absent.
pub struct IdempotencyMiddleware {
    store: Arc<dyn CacheStore>,
    ttl: Duration,
    in_flight: DashMap<String, Arc<Mutex<()>>>,
}

impl IdempotencyMiddleware {
    pub fn new(store: Arc<dyn CacheStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            in_flight: DashMap::new(),
        }
    }

    pub fn from_settings(store: Arc<dyn CacheStore>, settings: &CacheSettings) -> Self {
        Self::new(store, settings.idempotency_ttl())
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Cache key for an idempotency key of the command type named `type_name`.
    pub fn cache_key(type_name: &str, idempotency_key: &str) -> String {
        format!("idempotency:{}:{}", type_name, idempotency_key)
    }

    /// Keys with a dispatch currently running or waiting.
    pub fn pending_keys(&self) -> usize {
        self.in_flight.len()
    }

    async fn lookup(&self, key: &str) -> Option<conduit_core::Reply> {
        match self.store.get(key).await {
            Ok(hit) => hit,
            Err(err) => {
                warn!(key, error = %err, "Idempotency lookup failed, executing command");
                None
            }
        }
    }

    async fn execute(&self, key: &str, envelope: Envelope, next: Next<'_>) -> DispatchResult {
        if let Some(reply) = self.lookup(key).await {
            debug!(key, message_type = envelope.message_type(), "Replaying stored reply");
            return Ok(reply);
        }

        let result = next.run(envelope).await;
        if let Ok(reply) = &result {
            if let Err(err) = self.store.set(key, reply.clone(), Some(self.ttl)).await {
                warn!(key, error = %err, "Failed to store idempotent reply");
            }
        }
        result
    }
}

#[async_trait]
impl Middleware for IdempotencyMiddleware {
    fn name(&self) -> &'static str {
        "idempotency"
    }

    async fn handle(&self, envelope: Envelope, next: Next<'_>) -> DispatchResult {
        if envelope.kind() != MessageKind::Command {
            return next.run(envelope).await;
        }
        let Some(idempotency_key) = envelope.idempotency_key() else {
            return next.run(envelope).await;
        };
        let key = Self::cache_key(envelope.type_name(), idempotency_key);

        // Fast path, no lock
        if let Some(reply) = self.lookup(&key).await {
            debug!(key, message_type = envelope.message_type(), "Replaying stored reply");
            return Ok(reply);
        }

        let slot = KeySlot::claim(&self.in_flight, &key);
        let _guard = slot.lock.lock().await;
        self.execute(&key, envelope, next).await
    }
}

/// A dispatch's share of a per-key lock.
///
/// Dropping the last share removes the key from the in-flight map, also
/// when the dispatch future is dropped before it completes.
struct KeySlot<'a> {
    in_flight: &'a DashMap<String, Arc<Mutex<()>>>,
    key: &'a str,
    lock: Arc<Mutex<()>>,
}

impl<'a> KeySlot<'a> {
    fn claim(in_flight: &'a DashMap<String, Arc<Mutex<()>>>, key: &'a str) -> Self {
        let lock = in_flight.entry(key.to_owned()).or_default().clone();
        Self {
            in_flight,
            key,
            lock,
        }
    }
}

impl Drop for KeySlot<'_> {
    fn drop(&mut self) {
        // One count for the map, one for this slot
        self.in_flight.remove_if(self.key, |_, lock| {
            Arc::ptr_eq(lock, &self.lock) && Arc::strong_count(lock) == 2
        });
    }
}
