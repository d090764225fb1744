//! Error taxonomy shared by every bus and middleware.
//!
//! Expected failures travel as the `Err` variant of [`DispatchResult`](crate::DispatchResult)
//! so that each middleware can inspect them (retry, rollback, cache-skip)
//! without unwinding. Panics are reserved for programmer errors.

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Coarse classification of a [`BusError`], stable across versions.
///
/// Transport layers map kinds to their own representation (status codes,
/// GraphQL extensions).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No handler registered for the request type.
    HandlerNotFound,
    /// A handler was registered twice for the same type.
    Registration,
    /// The request failed validation before any side effect.
    Validation,
    /// All retry attempts were consumed.
    RetryExhausted,
    /// The circuit breaker rejected the call without invoking the handler.
    CircuitOpen,
    /// One or more event subscribers failed.
    EventHandlers,
    /// Unit-of-work begin/commit/rollback failed.
    Transaction,
    /// The caller cancelled the dispatch.
    Cancelled,
    /// A handler returned a business error.
    Domain,
    /// Programmer error (type mismatch, broken invariant).
    Internal,
}

impl ErrorKind {
    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::HandlerNotFound => "handler_not_found",
            ErrorKind::Registration => "registration",
            ErrorKind::Validation => "validation",
            ErrorKind::RetryExhausted => "retry_exhausted",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::EventHandlers => "event_handlers",
            ErrorKind::Transaction => "transaction",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Domain => "domain",
            ErrorKind::Internal => "internal",
        }
    }

    /// Conventional HTTP status for this kind. A hint for transports only.
    pub fn suggested_status(&self) -> u16 {
        match self {
            ErrorKind::HandlerNotFound => 404,
            ErrorKind::Validation => 422,
            ErrorKind::CircuitOpen | ErrorKind::RetryExhausted => 503,
            ErrorKind::Cancelled => 499,
            ErrorKind::Domain => 400,
            ErrorKind::Registration
            | ErrorKind::EventHandlers
            | ErrorKind::Transaction
            | ErrorKind::Internal => 500,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validation error for a single field
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationError {
    /// Field name that failed validation
    pub field: String,

    /// Error message
    pub message: String,

    /// Validation constraint that failed
    pub constraint: String,

    /// Value that failed validation (optional)
    pub value: Option<String>,
}

impl ValidationError {
    /// Create a new validation error
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            constraint: "custom".to_string(),
            value: None,
        }
    }

    /// Set the constraint name
    pub fn with_constraint(mut self, constraint: impl Into<String>) -> Self {
        self.constraint = constraint.into();
        self
    }

    /// Set the invalid value
    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Collection of validation errors
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationErrors {
    pub errors: Vec<ValidationError>,
}

impl ValidationErrors {
    /// Create a new validation errors collection
    pub fn new(errors: Vec<ValidationError>) -> Self {
        Self { errors }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn add(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    /// Get errors for a specific field
    pub fn get_field_errors(&self, field: &str) -> Vec<&ValidationError> {
        self.errors.iter().filter(|e| e.field == field).collect()
    }

    /// Convert to JSON representation
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({ "errors": self.errors })
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<String> = self.errors.iter().map(ToString::to_string).collect();
        f.write_str(&joined.join("; "))
    }
}

impl From<Vec<ValidationError>> for ValidationErrors {
    fn from(errors: Vec<ValidationError>) -> Self {
        Self::new(errors)
    }
}

/// Business error returned by a handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct DomainError {
    /// Machine-readable error code (`user_not_found`, `stock_exhausted`).
    pub code: String,

    /// Human-readable description
    pub message: String,

    /// Whether repeating the request may succeed (lock timeout, deadlock).
    pub retryable: bool,
}

impl DomainError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable: false,
        }
    }

    /// Mark the error as transient.
    pub fn transient(mut self) -> Self {
        self.retryable = true;
        self
    }
}

/// One failed subscriber inside an [`EventHandlerError`].
#[derive(Debug)]
pub struct HandlerFailure {
    /// Subscriber name
    pub handler: String,

    /// What the subscriber returned (or the panic it raised)
    pub error: BusError,
}

/// Aggregate of subscriber failures for a single published event.
#[derive(Debug, Error)]
#[error("{} of {} subscribers failed for {}", .failures.len(), .handled, .event)]
pub struct EventHandlerError {
    /// Event type name
    pub event: &'static str,

    /// Number of subscribers invoked
    pub handled: usize,

    /// Failed subscribers, in subscription order
    pub failures: Vec<HandlerFailure>,
}

impl EventHandlerError {
    /// Names of the failed subscribers.
    pub fn handler_names(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.handler.as_str()).collect()
    }
}

/// Bus error
#[derive(Debug, Error)]
pub enum BusError {
    #[error("No handler registered for {0}")]
    HandlerNotFound(&'static str),

    #[error("A handler is already registered for {0}")]
    HandlerAlreadyRegistered(&'static str),

    #[error("Validation failed: {0}")]
    Validation(ValidationErrors),

    #[error("Gave up after {attempts} attempts: {last_error}")]
    RetryExhausted {
        attempts: u32,
        last_error: Box<BusError>,
    },

    #[error("Circuit breaker open for {message_type}, retry in {retry_after:?}")]
    CircuitOpen {
        message_type: &'static str,
        retry_after: Duration,
    },

    #[error(transparent)]
    EventHandlers(#[from] EventHandlerError),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Dispatch cancelled")]
    Cancelled,

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BusError {
    /// Shorthand for a non-retryable business error.
    pub fn domain(code: impl Into<String>, message: impl Into<String>) -> Self {
        BusError::Domain(DomainError::new(code, message))
    }

    /// Shorthand for a retryable business error.
    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        BusError::Domain(DomainError::new(code, message).transient())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BusError::HandlerNotFound(_) => ErrorKind::HandlerNotFound,
            BusError::HandlerAlreadyRegistered(_) => ErrorKind::Registration,
            BusError::Validation(_) => ErrorKind::Validation,
            BusError::RetryExhausted { .. } => ErrorKind::RetryExhausted,
            BusError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            BusError::EventHandlers(_) => ErrorKind::EventHandlers,
            BusError::Transaction(_) => ErrorKind::Transaction,
            BusError::Cancelled => ErrorKind::Cancelled,
            BusError::Domain(_) => ErrorKind::Domain,
            BusError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether a retry of the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            BusError::Domain(e) => e.retryable,
            BusError::Transaction(_) => true,
            _ => false,
        }
    }

    /// Whether the caller is at fault (bad input, unknown request type).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            BusError::HandlerNotFound(_) | BusError::Validation(_) | BusError::Domain(_)
        )
    }

    /// Field errors, when this is a validation failure.
    pub fn validation_errors(&self) -> Option<&ValidationErrors> {
        match self {
            BusError::Validation(errors) => Some(errors),
            _ => None,
        }
    }

    /// The innermost error, looking through retry exhaustion.
    pub fn root_cause(&self) -> &BusError {
        match self {
            BusError::RetryExhausted { last_error, .. } => last_error.root_cause(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(BusError::transient("deadlock", "try again").is_retryable());
        assert!(BusError::Transaction("connection reset".into()).is_retryable());
        assert!(!BusError::domain("not_found", "no such user").is_retryable());
        assert!(!BusError::Cancelled.is_retryable());
    }

    #[test]
    fn test_kind_and_status() {
        let err = BusError::HandlerNotFound("CreateUser");
        assert_eq!(err.kind(), ErrorKind::HandlerNotFound);
        assert_eq!(err.kind().suggested_status(), 404);

        let err = BusError::Validation(vec![ValidationError::new("email", "required")].into());
        assert_eq!(err.kind().suggested_status(), 422);
        assert!(err.is_client_error());
    }

    #[test]
    fn test_root_cause_unwraps_retry() {
        let err = BusError::RetryExhausted {
            attempts: 3,
            last_error: Box::new(BusError::transient("timeout", "db timeout")),
        };

        assert!(matches!(err.root_cause(), BusError::Domain(e) if e.code == "timeout"));
        assert_eq!(
            err.to_string(),
            "Gave up after 3 attempts: timeout: db timeout"
        );
    }

    #[test]
    fn test_validation_errors_display_and_json() {
        let mut errors = ValidationErrors::default();
        errors.add(ValidationError::new("name", "name should not be empty").with_constraint("notEmpty"));
        errors.add(ValidationError::new("email", "invalid email").with_value("nope"));

        assert_eq!(errors.len(), 2);
        assert_eq!(errors.get_field_errors("email").len(), 1);
        assert_eq!(
            errors.to_string(),
            "name: name should not be empty; email: invalid email"
        );
        assert_eq!(errors.to_json()["errors"][1]["value"], "nope");
    }

    #[test]
    fn test_event_handler_error_message() {
        let err = EventHandlerError {
            event: "UserRegistered",
            handled: 3,
            failures: vec![HandlerFailure {
                handler: "SendWelcomeEmail".to_string(),
                error: BusError::domain("smtp", "unreachable"),
            }],
        };

        assert_eq!(err.to_string(), "1 of 3 subscribers failed for UserRegistered");
        assert_eq!(err.handler_names(), vec!["SendWelcomeEmail"]);
    }
}
