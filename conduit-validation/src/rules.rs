// Validation rules builder

use crate::validators::{IsEmail, MaxLength, MinLength, NotEmpty};
use crate::{ValidationError, Validator};
use async_trait::async_trait;
use conduit_core::{DispatchContext, Message};
use std::sync::Arc;

type ValidatorFn = Arc<dyn Fn(&str, &str) -> Result<(), ValidationError> + Send + Sync>;

/// Builder for the checks applied to one string field
#[derive(Clone)]
pub struct ValidationRules {
    validators: Vec<ValidatorFn>,
    field: String,
}

impl ValidationRules {
    /// Create new validation rules for a field
    pub fn for_field(field: impl Into<String>) -> Self {
        Self {
            validators: Vec::new(),
            field: field.into(),
        }
    }

    /// Add a custom validator function
    #[allow(clippy::should_implement_trait)]
    pub fn add<F>(mut self, validator: F) -> Self
    where
        F: Fn(&str, &str) -> Result<(), ValidationError> + Send + Sync + 'static,
    {
        self.validators.push(Arc::new(validator));
        self
    }

    pub fn not_empty(self) -> Self {
        self.add(NotEmpty::validate)
    }

    pub fn min_length(self, min: usize) -> Self {
        self.add(move |value, field| MinLength(min).validate(value, field))
    }

    pub fn max_length(self, max: usize) -> Self {
        self.add(move |value, field| MaxLength(max).validate(value, field))
    }

    pub fn email(self) -> Self {
        self.add(IsEmail::validate)
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    /// Validate a value against all rules
    pub fn validate(&self, value: &str) -> Result<(), Vec<ValidationError>> {
        let errors: Vec<ValidationError> = self
            .validators
            .iter()
            .filter_map(|validator| validator(value, &self.field).err())
            .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Apply these rules to the field `extract` reads from a request.
    ///
    /// ```rust,ignore
    /// let email = ValidationRules::for_field("email")
    ///     .not_empty()
    ///     .email()
    ///     .on(|cmd: &RegisterUser| cmd.email.as_str());
    /// ```
    pub fn on<M, F>(self, extract: F) -> FieldValidator<M>
    where
        M: Message,
        F: Fn(&M) -> &str + Send + Sync + 'static,
    {
        FieldValidator {
            rules: self,
            extract: Box::new(extract),
        }
    }
}

/// [`ValidationRules`] bound to a field of request type `M`.
pub struct FieldValidator<M> {
    rules: ValidationRules,
    extract: Box<dyn Fn(&M) -> &str + Send + Sync>,
}

#[async_trait]
impl<M: Message> Validator<M> for FieldValidator<M> {
    async fn validate(&self, message: &M, _ctx: &DispatchContext) -> Vec<ValidationError> {
        self.rules
            .validate((self.extract)(message))
            .err()
            .unwrap_or_default()
    }

    fn name(&self) -> &str {
        self.rules.field()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct RegisterUser {
        email: String,
    }

    impl Message for RegisterUser {}

    #[test]
    fn test_collects_every_failure() {
        let rules = ValidationRules::for_field("username")
            .not_empty()
            .min_length(3);

        assert!(rules.validate("john").is_ok());
        let errors = rules.validate("  ").unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| e.field == "username"));
    }

    #[test]
    fn test_custom_rule() {
        let rules = ValidationRules::for_field("slug").add(|value, field| {
            if value.contains(' ') {
                Err(ValidationError::new(field, "no spaces").with_constraint("slug"))
            } else {
                Ok(())
            }
        });
        assert_eq!(rules.validate("a b").unwrap_err()[0].constraint, "slug");
    }

    #[tokio::test]
    async fn test_field_validator() {
        let validator = ValidationRules::for_field("email")
            .email()
            .max_length(20)
            .on(|cmd: &RegisterUser| cmd.email.as_str());

        let ctx = DispatchContext::new();
        let ok = RegisterUser {
            email: "a@example.com".into(),
        };
        let bad = RegisterUser {
            email: "not-an-email-and-far-too-long".into(),
        };

        assert!(validator.validate(&ok, &ctx).await.is_empty());
        assert_eq!(validator.validate(&bad, &ctx).await.len(), 2);
        assert_eq!(Validator::<RegisterUser>::name(&validator), "email");
    }
}
