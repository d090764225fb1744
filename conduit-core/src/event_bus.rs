//! Event Bus implementation

use crate::context::DispatchContext;
use crate::error::{BusError, EventHandlerError, HandlerFailure};
use crate::event::{DynEventHandler, EventHandler, TypedEventHandler};
use crate::message::Event;
use futures::FutureExt;
use futures::future::join_all;
use serde::Deserialize;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Event bus configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// Run the subscribers of one event concurrently instead of in
    /// subscription order
    pub concurrent: bool,

    /// Default for [`EventBus::publish`]: return the failure aggregate as an
    /// error instead of only logging it
    pub raise_on_error: bool,
}

/// Event bus for in-process event publishing and handling
///
/// Every subscriber of an event type runs, whatever the others do: a
/// subscriber's error or panic is caught, logged and collected into an
/// [`EventHandlerError`], never aborting delivery to the rest.
#[derive(Default)]
pub struct EventBus {
    /// Handlers registered for each event type
    handlers: HashMap<TypeId, Vec<Arc<dyn DynEventHandler>>>,

    config: EventBusConfig,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_config(EventBusConfig::default())
    }

    pub fn with_config(config: EventBusConfig) -> Self {
        Self {
            handlers: HashMap::new(),
            config,
        }
    }

    /// Subscribe a handler to an event type
    ///
    /// ```rust,ignore
    /// let mut bus = EventBus::new();
    /// bus.subscribe::<UserRegistered, _>(SendWelcomeEmail::new(mailer));
    /// bus.subscribe::<UserRegistered, _>(UpdateUserDirectory::new(index));
    /// ```
    pub fn subscribe<E, H>(&mut self, handler: H)
    where
        E: Event,
        H: EventHandler<E> + 'static,
    {
        let handler: Arc<dyn DynEventHandler> = Arc::new(TypedEventHandler::new(handler));
        debug!(
            event = E::message_name(),
            handler = handler.name(),
            "Subscribed event handler"
        );
        self.handlers
            .entry(TypeId::of::<E>())
            .or_default()
            .push(handler);
    }

    /// Publish an event with a fresh context and the configured error policy.
    pub async fn publish<E: Event>(&self, event: E) -> Result<(), BusError> {
        self.publish_with(event, &DispatchContext::new(), self.config.raise_on_error)
            .await
    }

    /// Publish an event.
    ///
    /// All registered handlers for this event type are invoked. With
    /// `raise_on_error`, any failures come back as
    /// [`BusError::EventHandlers`] once every handler has run.
    pub async fn publish_with<E: Event>(
        &self,
        event: E,
        ctx: &DispatchContext,
        raise_on_error: bool,
    ) -> Result<(), BusError> {
        let event_name = E::message_name();

        let Some(handlers) = self.handlers.get(&TypeId::of::<E>()) else {
            debug!(event = event_name, "No handlers registered for event");
            return Ok(());
        };

        info!(
            event = event_name,
            subscribers = handlers.len(),
            correlation_id = %ctx.correlation_id(),
            "Publishing event"
        );

        let outcomes: Vec<Result<(), BusError>> = if self.config.concurrent {
            join_all(handlers.iter().map(|h| invoke(h.as_ref(), &event, ctx))).await
        } else {
            let mut outcomes = Vec::with_capacity(handlers.len());
            for handler in handlers {
                outcomes.push(invoke(handler.as_ref(), &event, ctx).await);
            }
            outcomes
        };

        let failures: Vec<HandlerFailure> = handlers
            .iter()
            .zip(outcomes)
            .filter_map(|(handler, outcome)| {
                outcome.err().map(|err| {
                    error!(
                        event = event_name,
                        handler = handler.name(),
                        error = %err,
                        "Event handler failed"
                    );
                    HandlerFailure {
                        handler: handler.name().to_string(),
                        error: err,
                    }
                })
            })
            .collect();

        if failures.is_empty() {
            debug!(event = event_name, "Event delivered to all subscribers");
            return Ok(());
        }

        let aggregate = EventHandlerError {
            event: event_name,
            handled: handlers.len(),
            failures,
        };

        if raise_on_error {
            Err(BusError::EventHandlers(aggregate))
        } else {
            error!(
                event = event_name,
                failed = aggregate.failures.len(),
                "{}",
                aggregate
            );
            Ok(())
        }
    }

    /// Get handler count for an event type
    pub fn handler_count<E: Event>(&self) -> usize {
        self.handlers
            .get(&TypeId::of::<E>())
            .map(|h| h.len())
            .unwrap_or(0)
    }

    pub fn config(&self) -> &EventBusConfig {
        &self.config
    }
}

async fn invoke(
    handler: &dyn DynEventHandler,
    event: &(dyn Any + Send + Sync),
    ctx: &DispatchContext,
) -> Result<(), BusError> {
    match AssertUnwindSafe(handler.handle_dyn(event, ctx))
        .catch_unwind()
        .await
    {
        Ok(outcome) => outcome,
        Err(panic) => Err(BusError::Internal(format!(
            "event handler panicked: {}",
            panic_message(panic.as_ref())
        ))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
