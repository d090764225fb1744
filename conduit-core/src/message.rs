//! Message contracts
//!
//! Commands express write intent and are routed to exactly one handler,
//! queries express read intent and may be cached, events are broadcast to
//! any number of subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::time::Duration;
use uuid::Uuid;

/// Identity and tracing metadata carried by a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Unique request ID
    pub id: Uuid,

    /// Timestamp when the request was created
    pub timestamp: DateTime<Utc>,

    /// Optional correlation ID for tracing
    pub correlation_id: Option<Uuid>,

    /// Optional causation ID (ID of the request that caused this one)
    pub causation_id: Option<Uuid>,
}

impl MessageMetadata {
    /// Create new metadata with a fresh ID
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            correlation_id: None,
            causation_id: None,
        }
    }

    /// Set correlation ID
    pub fn with_correlation_id(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Set causation ID
    pub fn with_causation_id(mut self, id: Uuid) -> Self {
        self.causation_id = Some(id);
        self
    }
}

impl Default for MessageMetadata {
    fn default() -> Self {
        Self::new()
    }
}

/// Base trait for everything that travels through a bus.
pub trait Message: Send + Sync + Debug + 'static {
    /// Stable, human-readable type name used in logs, metrics and cache keys.
    fn message_name() -> &'static str
    where
        Self: Sized,
    {
        short_type_name::<Self>()
    }

    /// Request metadata, if the message carries its own.
    ///
    /// Messages without metadata get a fresh [`MessageMetadata`] at dispatch.
    fn metadata(&self) -> Option<&MessageMetadata> {
        None
    }
}

/// Command trait
///
/// Commands represent write operations in CQRS.
pub trait Command: Message {
    /// Command result type
    type Output: Clone + Send + Sync + 'static;

    /// Caller-supplied token for at-most-once execution.
    fn idempotency_key(&self) -> Option<&str> {
        None
    }
}

/// Query trait
///
/// Queries represent read operations in CQRS.
pub trait Query: Message {
    /// Query result type
    type Output: Clone + Send + Sync + 'static;

    /// Cache key for this query's parameters. `None` disables caching.
    fn cache_key(&self) -> Option<String> {
        None
    }

    /// Time-to-live for a cached result. `None` uses the cache default.
    fn cache_ttl(&self) -> Option<Duration> {
        None
    }

    /// Tags attached to a cached result for tag-based invalidation.
    fn cache_tags(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Event trait
///
/// Events are notifications published to zero or more subscribers.
pub trait Event: Message {}

/// Type name without its module path (`app::users::CreateUser` -> `CreateUser`).
pub fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct RenameUser;

    impl Message for RenameUser {}

    impl Command for RenameUser {
        type Output = ();
    }

    #[test]
    fn test_message_name_strips_module_path() {
        assert_eq!(RenameUser::message_name(), "RenameUser");
        assert_eq!(short_type_name::<Vec<String>>(), "Vec");
    }

    #[test]
    fn test_metadata_builders() {
        let correlation = Uuid::new_v4();
        let metadata = MessageMetadata::new().with_correlation_id(correlation);

        assert_eq!(metadata.correlation_id, Some(correlation));
        assert!(metadata.causation_id.is_none());
    }

    #[test]
    fn test_command_defaults() {
        assert!(RenameUser.idempotency_key().is_none());
        assert!(RenameUser.metadata().is_none());
    }
}
