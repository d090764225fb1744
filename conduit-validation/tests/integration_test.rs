//! Integration tests for conduit-validation

use async_trait::async_trait;
use conduit_core::{BusError, Command, CommandBus, CommandHandler, DispatchContext, Message};
use conduit_validation::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug)]
struct RegisterUser {
    username: String,
    email: String,
}

impl Message for RegisterUser {}

impl Command for RegisterUser {
    type Output = String;
}

struct RegisterUserHandler {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl CommandHandler<RegisterUser> for RegisterUserHandler {
    async fn handle(&self, cmd: &RegisterUser, _ctx: &DispatchContext) -> Result<String, BusError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("user:{}", cmd.username))
    }
}

fn bus(calls: Arc<AtomicU32>) -> CommandBus {
    let mut bus = CommandBus::new();
    bus.use_middleware(
        ValidationMiddleware::new()
            .rule::<RegisterUser, _>(
                ValidationRules::for_field("username")
                    .not_empty()
                    .min_length(3)
                    .max_length(20)
                    .on(|c: &RegisterUser| c.username.as_str()),
            )
            .rule::<RegisterUser, _>(
                ValidationRules::for_field("email")
                    .email()
                    .on(|c: &RegisterUser| c.email.as_str()),
            ),
    );
    bus.register::<RegisterUser, _>(RegisterUserHandler { calls })
        .unwrap();
    bus
}

#[tokio::test]
async fn test_valid_command_is_handled() {
    let calls = Arc::new(AtomicU32::new(0));
    let id = bus(calls.clone())
        .dispatch(RegisterUser {
            username: "alice".into(),
            email: "alice@example.com".into(),
        })
        .await
        .unwrap();

    assert_eq!(id, "user:alice");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_invalid_command_never_reaches_handler() {
    let calls = Arc::new(AtomicU32::new(0));
    let err = bus(calls.clone())
        .dispatch(RegisterUser {
            username: "al".into(),
            email: "alice".into(),
        })
        .await
        .unwrap_err();

    assert!(err.is_client_error());
    let errors = err.validation_errors().unwrap();
    assert_eq!(errors.len(), 2);
    assert_eq!(errors.get_field_errors("username")[0].constraint, "minLength");
    assert_eq!(errors.get_field_errors("email")[0].constraint, "isEmail");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_built_in_validators() {
    assert!(NotEmpty::validate("hello", "text").is_ok());
    assert!(MinLength(3).validate("hi", "text").is_err());
    assert!(MaxLength(10).validate("hello world today", "text").is_err());
    assert!(IsEmail::validate("test.user@domain.co.uk", "email").is_ok());
    assert!(InRange { min: 1, max: 5 }.validate(6, "rating").is_err());
}
