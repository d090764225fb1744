// Validation traits

use crate::ValidationError;
use async_trait::async_trait;
use conduit_core::{DispatchContext, Message, short_type_name};

/// Trait for self-validating requests
pub trait Validate {
    /// Validate the value and return errors if any
    fn validate(&self) -> Result<(), Vec<ValidationError>>;
}

/// Validator for requests of type `M`.
///
/// Async so checks can consult storage (uniqueness, existence).
#[async_trait]
pub trait Validator<M: Message>: Send + Sync {
    /// Field errors for `message`; empty when valid.
    async fn validate(&self, message: &M, ctx: &DispatchContext) -> Vec<ValidationError>;

    /// Get validator name
    fn name(&self) -> &str {
        short_type_name::<Self>()
    }
}

/// Runs a request's own [`Validate`] impl.
pub struct SelfValidator;

#[async_trait]
impl<M: Message + Validate> Validator<M> for SelfValidator {
    async fn validate(&self, message: &M, _ctx: &DispatchContext) -> Vec<ValidationError> {
        message.validate().err().unwrap_or_default()
    }
}

/// Adapts a synchronous closure.
pub struct FnValidator<F>(pub F);

#[async_trait]
impl<M, F> Validator<M> for FnValidator<F>
where
    M: Message,
    F: Fn(&M) -> Vec<ValidationError> + Send + Sync,
{
    async fn validate(&self, message: &M, _ctx: &DispatchContext) -> Vec<ValidationError> {
        (self.0)(message)
    }

    fn name(&self) -> &str {
        "closure"
    }
}
