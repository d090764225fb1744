// Validation middleware

use crate::traits::{FnValidator, SelfValidator, Validate, Validator};
use crate::ValidationError;
use async_trait::async_trait;
use conduit_core::config::ValidationSettings;
use conduit_core::{
    BusError, DispatchResult, Envelope, Message, Middleware, Next, ValidationErrors,
};
use std::any::TypeId;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

#[async_trait]
trait ErasedValidator: Send + Sync {
    async fn validate_envelope(&self, envelope: &Envelope) -> Vec<ValidationError>;

    fn name(&self) -> &str;
}

struct TypedValidator<M, V> {
    validator: V,
    _message: PhantomData<fn(&M)>,
}

#[async_trait]
impl<M: Message, V: Validator<M>> ErasedValidator for TypedValidator<M, V> {
    async fn validate_envelope(&self, envelope: &Envelope) -> Vec<ValidationError> {
        match envelope.message::<M>() {
            Some(message) => self.validator.validate(message, envelope.context()).await,
            None => Vec::new(),
        }
    }

    fn name(&self) -> &str {
        self.validator.name()
    }
}

/// Rejects requests with field errors before they reach the handler.
///
/// Validators are registered per request type and run in registration
/// order. Types without validators pass straight through.
///
/// ```rust,ignore
/// let validation = ValidationMiddleware::new()
///     .validate_self::<RegisterUser>()
///     .rule::<RegisterUser, _>(
///         ValidationRules::for_field("email").email().on(|c: &RegisterUser| c.email.as_str()),
///     );
/// ```
#[derive(Default)]
pub struct ValidationMiddleware {
    validators: HashMap<TypeId, Vec<Arc<dyn ErasedValidator>>>,
    fail_fast: bool,
}

impl ValidationMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: &ValidationSettings) -> Self {
        Self::new().fail_fast(settings.fail_fast)
    }

    /// Stop at the first validator that reports errors.
    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Add a validator for request type `M`.
    pub fn rule<M, V>(mut self, validator: V) -> Self
    where
        M: Message,
        V: Validator<M> + 'static,
    {
        self.validators
            .entry(TypeId::of::<M>())
            .or_default()
            .push(Arc::new(TypedValidator {
                validator,
                _message: PhantomData,
            }));
        self
    }

    /// Add a closure validator for request type `M`.
    pub fn check<M, F>(self, check: F) -> Self
    where
        M: Message,
        F: Fn(&M) -> Vec<ValidationError> + Send + Sync + 'static,
    {
        self.rule::<M, _>(FnValidator(check))
    }

    /// Run `M`'s own [`Validate`] impl.
    pub fn validate_self<M: Message + Validate>(self) -> Self {
        self.rule::<M, _>(SelfValidator)
    }

    pub fn validator_count<M: Message>(&self) -> usize {
        self.validators
            .get(&TypeId::of::<M>())
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl Middleware for ValidationMiddleware {
    fn name(&self) -> &'static str {
        "validation"
    }

    async fn handle(&self, envelope: Envelope, next: Next<'_>) -> DispatchResult {
        let Some(validators) = self.validators.get(&envelope.type_id()) else {
            return next.run(envelope).await;
        };

        let mut errors = Vec::new();
        for validator in validators {
            let found = validator.validate_envelope(&envelope).await;
            if found.is_empty() {
                continue;
            }
            debug!(
                message_type = envelope.message_type(),
                validator = validator.name(),
                errors = found.len(),
                "Validator rejected request"
            );
            errors.extend(found);
            if self.fail_fast {
                break;
            }
        }

        if errors.is_empty() {
            next.run(envelope).await
        } else {
            Err(BusError::Validation(ValidationErrors::new(errors)))
        }
    }
}
