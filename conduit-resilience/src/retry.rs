//! Retry middleware with exponential backoff and jitter.
//!
//! ## Example
//!
//! ```rust,ignore
//! use conduit_resilience::{RetryMiddleware, RetryPolicy};
//! use std::time::Duration;
//!
//! let retry = RetryMiddleware::new(
//!     RetryPolicy::new(3)
//!         .base_delay(Duration::from_millis(100))
//!         .multiplier(2.0),
//! )
//! .with_policy_for::<ChargeCard>(RetryPolicy::new(5));
//!
//! command_bus.use_middleware(retry);
//! ```

use async_trait::async_trait;
use conduit_core::config::RetrySettings;
use conduit_core::{BusError, Clock, DispatchResult, Envelope, Middleware, Next, system_clock};
use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Decides whether an error is worth another attempt.
pub type RetryPredicate = Arc<dyn Fn(&BusError) -> bool + Send + Sync>;

/// Retry configuration. Immutable once built, shared by every dispatch.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Growth factor applied per attempt.
    pub multiplier: f64,
    /// Upper bound on any delay, before jitter.
    pub max_delay: Duration,
    /// Delays are scaled by a random factor in `1 ± jitter_fraction`.
    pub jitter_fraction: f64,
    retryable: RetryPredicate,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

impl RetryPolicy {
    /// Default backoff with `max_attempts` attempts.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            base_delay: settings.base_delay(),
            multiplier: settings.multiplier,
            max_delay: settings.max_delay(),
            jitter_fraction: settings.jitter_fraction,
            retryable: Arc::new(BusError::is_retryable),
        }
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the jitter fraction, clamped to `0.0..=1.0`.
    pub fn jitter(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction.clamp(0.0, 1.0);
        self
    }

    /// Replace the retryable-error predicate.
    pub fn retry_on<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&BusError) -> bool + Send + Sync + 'static,
    {
        self.retryable = Arc::new(predicate);
        self
    }

    pub fn is_retryable(&self, error: &BusError) -> bool {
        (self.retryable)(error)
    }

    /// Backoff before attempt `attempt + 1`, without jitter.
    ///
    /// `attempt` is 1-based: the delay after the first failure is
    /// `base_delay`, then `base_delay * multiplier`, and so on, capped at
    /// `max_delay`.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.multiplier.powi(exponent);
        let nanos = (self.base_delay.as_nanos() as f64 * factor)
            .min(self.max_delay.as_nanos() as f64)
            .max(0.0);
        Duration::from_nanos(nanos.round() as u64)
    }

    /// Backoff before attempt `attempt + 1`, with jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        if self.jitter_fraction <= 0.0 {
            return nominal;
        }
        let spread = 2.0 * rand::random::<f64>() - 1.0;
        nominal.mul_f64((1.0 + self.jitter_fraction * spread).max(0.0))
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("multiplier", &self.multiplier)
            .field("max_delay", &self.max_delay)
            .field("jitter_fraction", &self.jitter_fraction)
            .finish_non_exhaustive()
    }
}

/// Re-runs the inner chain while it fails with a retryable error.
///
/// Sits outside Validation and Transaction, so every attempt opens its own
/// unit of work. Non-retryable errors are returned untouched on first
/// occurrence; running out of attempts yields [`BusError::RetryExhausted`].
pub struct RetryMiddleware {
    policy: RetryPolicy,
    overrides: HashMap<TypeId, RetryPolicy>,
    clock: Arc<dyn Clock>,
}

impl RetryMiddleware {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            overrides: HashMap::new(),
            clock: system_clock(),
        }
    }

    /// Sleep through `clock` instead of the tokio timer.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use `policy` for requests of type `M`.
    pub fn with_policy_for<M: 'static>(mut self, policy: RetryPolicy) -> Self {
        self.overrides.insert(TypeId::of::<M>(), policy);
        self
    }

    pub fn policy_for(&self, type_id: TypeId) -> &RetryPolicy {
        self.overrides.get(&type_id).unwrap_or(&self.policy)
    }
}

#[async_trait]
impl Middleware for RetryMiddleware {
    fn name(&self) -> &'static str {
        "retry"
    }

    async fn handle(&self, envelope: Envelope, next: Next<'_>) -> DispatchResult {
        let policy = self.policy_for(envelope.type_id());
        let message_type = envelope.message_type();
        let mut attempt: u32 = 1;

        loop {
            let err = match next.run(envelope.clone()).await {
                Ok(reply) => {
                    if attempt > 1 {
                        debug!(message_type, attempt, "Retry succeeded");
                    }
                    return Ok(reply);
                }
                Err(err) => err,
            };

            if !policy.is_retryable(&err) {
                return Err(err);
            }

            if attempt >= policy.max_attempts {
                warn!(
                    message_type,
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %err,
                    "Final retry attempt failed"
                );
                return Err(BusError::RetryExhausted {
                    attempts: attempt,
                    last_error: Box::new(err),
                });
            }

            let delay = policy.delay_for_attempt(attempt);
            debug!(
                message_type,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retry attempt failed, waiting before retry"
            );

            tokio::select! {
                biased;
                _ = envelope.context().cancellation().cancelled() => return Err(BusError::Cancelled),
                _ = self.clock.sleep(delay) => {}
            }

            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use conduit_core::{
        Command, DispatchContext, ErasedHandler, ManualClock, Message, MiddlewareChain, Reply,
    };
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct SyncInventory;

    impl Message for SyncInventory {}

    impl Command for SyncInventory {
        type Output = u32;
    }

    /// Fails with `error` for the first `failures` calls, then succeeds.
    struct FlakyHandler {
        calls: AtomicU32,
        failures: u32,
        error: fn() -> BusError,
    }

    impl FlakyHandler {
        fn new(failures: u32, error: fn() -> BusError) -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures,
                error,
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ErasedHandler for FlakyHandler {
        async fn handle_erased(&self, _envelope: &Envelope) -> DispatchResult {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                Err((self.error)())
            } else {
                Ok(Arc::new(call) as Reply)
            }
        }

        fn handler_name(&self) -> &'static str {
            "FlakyHandler"
        }
    }

    fn deadlock() -> BusError {
        BusError::transient("deadlock", "deadlock detected")
    }

    fn not_found() -> BusError {
        BusError::domain("not_found", "warehouse missing")
    }

    fn chain(policy: RetryPolicy, clock: Arc<ManualClock>) -> MiddlewareChain {
        let mut chain = MiddlewareChain::new();
        chain.use_middleware(RetryMiddleware::new(policy).with_clock(clock));
        chain
    }

    fn envelope() -> Envelope {
        Envelope::command(SyncInventory, DispatchContext::new())
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy::new(5)
            .base_delay(Duration::from_millis(100))
            .multiplier(2.0)
            .max_delay(Duration::from_millis(350));

        assert_eq!(policy.nominal_delay(1), Duration::from_millis(100));
        assert_eq!(policy.nominal_delay(2), Duration::from_millis(200));
        assert_eq!(policy.nominal_delay(3), Duration::from_millis(350));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = RetryPolicy::new(3)
            .base_delay(Duration::from_millis(100))
            .jitter(0.2);

        for _ in 0..100 {
            let delay = policy.delay_for_attempt(1);
            assert!(delay >= Duration::from_millis(80), "{delay:?}");
            assert!(delay <= Duration::from_millis(120), "{delay:?}");
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let clock = Arc::new(ManualClock::new());
        let policy = RetryPolicy::new(3)
            .base_delay(Duration::from_millis(100))
            .multiplier(2.0)
            .jitter(0.1);
        let handler = FlakyHandler::new(2, deadlock);

        let reply = chain(policy, clock.clone())
            .dispatch(envelope(), &handler)
            .await
            .unwrap();

        assert_eq!(reply.downcast_ref::<u32>(), Some(&3));
        assert_eq!(handler.calls(), 3);

        let sleeps = clock.sleeps();
        assert_eq!(sleeps.len(), 2);
        assert!(sleeps[0] >= Duration::from_millis(90) && sleeps[0] <= Duration::from_millis(110));
        assert!(sleeps[1] >= Duration::from_millis(180) && sleeps[1] <= Duration::from_millis(220));
    }

    #[tokio::test]
    async fn test_exhaustion_after_max_attempts() {
        let clock = Arc::new(ManualClock::new());
        let handler = FlakyHandler::new(u32::MAX, deadlock);

        let err = chain(RetryPolicy::new(4).jitter(0.0), clock.clone())
            .dispatch(envelope(), &handler)
            .await
            .unwrap_err();

        assert_eq!(handler.calls(), 4);
        assert_eq!(clock.sleeps().len(), 3);
        match err {
            BusError::RetryExhausted {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 4);
                assert!(matches!(*last_error, BusError::Domain(ref e) if e.code == "deadlock"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_non_retryable_error_is_not_retried() {
        let clock = Arc::new(ManualClock::new());
        let handler = FlakyHandler::new(u32::MAX, not_found);

        let err = chain(RetryPolicy::new(5), clock.clone())
            .dispatch(envelope(), &handler)
            .await
            .unwrap_err();

        assert!(matches!(err, BusError::Domain(ref e) if e.code == "not_found"));
        assert_eq!(handler.calls(), 1);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_custom_predicate_and_override() {
        let clock = Arc::new(ManualClock::new());
        let retry = RetryMiddleware::new(RetryPolicy::new(1))
            .with_clock(clock.clone())
            .with_policy_for::<SyncInventory>(
                RetryPolicy::new(3)
                    .jitter(0.0)
                    .retry_on(|err| matches!(err, BusError::Domain(e) if e.code == "not_found")),
            );
        let mut chain = MiddlewareChain::new();
        chain.use_middleware(retry);

        let handler = FlakyHandler::new(2, not_found);
        assert!(chain.dispatch(envelope(), &handler).await.is_ok());
        assert_eq!(handler.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_backoff() {
        let policy = RetryPolicy::new(5)
            .base_delay(Duration::from_secs(10))
            .jitter(0.0);
        let mut chain = MiddlewareChain::new();
        chain.use_middleware(RetryMiddleware::new(policy));
        let handler = FlakyHandler::new(u32::MAX, deadlock);

        let ctx = DispatchContext::new();
        let token = ctx.cancellation().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        });

        let err = chain
            .dispatch(Envelope::command(SyncInventory, ctx), &handler)
            .await
            .unwrap_err();

        assert!(matches!(err, BusError::Cancelled));
        assert_eq!(handler.calls(), 1);
    }
}
