//! Circuit Breaker pattern implementation.
//!
//! One breaker per request type, created on the first dispatch of that type.
//!
//! ## States
//!
//! - **Closed**: Normal operation, requests pass through
//! - **Open**: Requests are rejected without reaching the handler
//! - **Half-Open**: A bounded number of probes test whether the handler
//!   recovered
//!
//! Open turns into Half-Open lazily: the first dispatch after
//! `reset_timeout` performs the transition, under the same lock that decides
//! whether to admit it.
//!
//! ## Example
//!
//! ```rust,ignore
//! use conduit_resilience::{CircuitBreakerConfig, CircuitBreakerMiddleware};
//! use std::time::Duration;
//!
//! let breaker = CircuitBreakerMiddleware::new(
//!     CircuitBreakerConfig::default()
//!         .failure_threshold(5)
//!         .reset_timeout(Duration::from_secs(30)),
//! );
//! command_bus.use_middleware(breaker);
//! ```

use async_trait::async_trait;
use conduit_core::config::CircuitBreakerSettings;
use conduit_core::{BusError, Clock, DispatchResult, Envelope, Middleware, Next, system_clock};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed, requests pass through normally.
    Closed,
    /// Circuit is open, requests are rejected.
    Open,
    /// Circuit is half-open, testing recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "Closed"),
            Self::Open => write!(f, "Open"),
            Self::HalfOpen => write!(f, "HalfOpen"),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// Number of consecutive half-open successes needed to close the circuit.
    pub success_threshold: u32,
    /// Time to wait before transitioning from open to half-open.
    pub reset_timeout: Duration,
    /// Probes allowed in flight while half-open.
    pub half_open_max_probes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::from_settings(&CircuitBreakerSettings::default())
    }
}

impl CircuitBreakerConfig {
    pub fn from_settings(settings: &CircuitBreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold.max(1),
            success_threshold: settings.success_threshold.max(1),
            reset_timeout: settings.reset_timeout(),
            half_open_max_probes: settings.half_open_max_probes.max(1),
        }
    }

    /// Set the failure threshold.
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Set the success threshold for recovery.
    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold.max(1);
        self
    }

    /// Set the reset timeout.
    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Set the number of concurrent half-open probes.
    pub fn half_open_max_probes(mut self, probes: u32) -> Self {
        self.half_open_max_probes = probes.max(1);
        self
    }
}

/// Mutable breaker state, guarded by a single mutex.
#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    probes_in_flight: u32,
    /// Bumped on every transition; outcomes of calls admitted under an older
    /// generation no longer drive the state machine.
    generation: u64,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            probes_in_flight: 0,
            generation: 0,
        }
    }

    fn transition(&mut self, to: CircuitState, now: Instant) {
        self.state = to;
        self.generation += 1;
        self.consecutive_successes = 0;
        self.probes_in_flight = 0;
        match to {
            CircuitState::Open => self.opened_at = Some(now),
            CircuitState::HalfOpen => {}
            CircuitState::Closed => {
                self.consecutive_failures = 0;
                self.opened_at = None;
            }
        }
    }
}

/// Circuit breaker for a single request type.
pub struct CircuitBreaker {
    name: &'static str,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerState>,
    total_requests: AtomicU64,
    total_failures: AtomicU64,
    total_successes: AtomicU64,
    total_rejections: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration.
    pub fn new(name: &'static str, config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Arc<Self> {
        debug!(
            name,
            failure_threshold = config.failure_threshold,
            reset_timeout = ?config.reset_timeout,
            "Circuit breaker initialized"
        );

        Arc::new(Self {
            name,
            config,
            clock,
            inner: Mutex::new(BreakerState::closed()),
            total_requests: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, as last transitioned.
    ///
    /// An Open circuit whose timeout has elapsed still reports Open until a
    /// dispatch arrives.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Ask to let one call through.
    ///
    /// On rejection returns how long until the circuit may admit a probe.
    pub fn try_acquire(self: &Arc<Self>) -> Result<Permit, Duration> {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        if inner.state == CircuitState::Open {
            let elapsed = inner
                .opened_at
                .map(|at| now.saturating_duration_since(at))
                .unwrap_or(self.config.reset_timeout);

            if elapsed < self.config.reset_timeout {
                drop(inner);
                self.total_rejections.fetch_add(1, Ordering::Relaxed);
                return Err(self.config.reset_timeout - elapsed);
            }

            info!(name = self.name, "Circuit breaker HALF-OPEN");
            inner.transition(CircuitState::HalfOpen, now);
        }

        let probe = inner.state == CircuitState::HalfOpen;
        if probe {
            if inner.probes_in_flight >= self.config.half_open_max_probes {
                drop(inner);
                self.total_rejections.fetch_add(1, Ordering::Relaxed);
                return Err(Duration::ZERO);
            }
            inner.probes_in_flight += 1;
        }

        Ok(Permit {
            breaker: Arc::clone(self),
            generation: inner.generation,
            probe,
            settled: false,
        })
    }

    fn on_success(&self, generation: u64) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return;
        }

        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    info!(name = self.name, "Circuit breaker CLOSED");
                    inner.transition(CircuitState::Closed, self.clock.now());
                }
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, generation: u64) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return;
        }

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        name = self.name,
                        failures = inner.consecutive_failures,
                        "Circuit breaker OPENED"
                    );
                    inner.transition(CircuitState::Open, self.clock.now());
                }
            }
            CircuitState::HalfOpen => {
                warn!(name = self.name, "Probe failed, circuit breaker re-OPENED");
                inner.transition(CircuitState::Open, self.clock.now());
            }
            CircuitState::Open => {}
        }
    }

    fn release(&self, generation: u64, probe: bool) {
        if !probe {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.generation == generation {
            inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
        }
    }

    /// Manually reset the circuit breaker to closed state.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed || inner.consecutive_failures > 0 {
            info!(name = self.name, "Circuit breaker reset");
            inner.transition(CircuitState::Closed, self.clock.now());
        }
    }

    /// Manually force the circuit open.
    pub fn force_open(&self) {
        warn!(name = self.name, "Circuit breaker forced OPEN");
        self.inner
            .lock()
            .transition(CircuitState::Open, self.clock.now());
    }

    /// Get circuit breaker statistics.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            name: self.name,
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            probes_in_flight: inner.probes_in_flight,
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

/// Admission to call through a breaker.
///
/// Report the outcome with [`success`](Self::success) or
/// [`failure`](Self::failure). Dropping the permit unsettled (a neutral
/// error, a cancelled dispatch) frees its probe slot without affecting the
/// counters.
#[must_use = "a permit must be settled with success() or failure()"]
pub struct Permit {
    breaker: Arc<CircuitBreaker>,
    generation: u64,
    probe: bool,
    settled: bool,
}

impl Permit {
    /// Whether this call is a half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.generation);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.generation);
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release(self.generation, self.probe);
        }
    }
}

/// Circuit breaker statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub name: &'static str,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub probes_in_flight: u32,
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    /// Calls rejected without reaching the handler.
    pub total_rejections: u64,
}

impl BreakerSnapshot {
    /// Calculate failure rate (0.0 - 1.0) over settled calls.
    pub fn failure_rate(&self) -> f64 {
        let settled = self.total_successes + self.total_failures;
        if settled == 0 {
            0.0
        } else {
            self.total_failures as f64 / settled as f64
        }
    }
}

/// Decides whether an error counts against the breaker.
pub type FailurePredicate = Arc<dyn Fn(&BusError) -> bool + Send + Sync>;

/// Errors that say nothing about the health of the handler.
pub fn counts_as_failure(error: &BusError) -> bool {
    !matches!(
        error,
        BusError::Validation(_) | BusError::HandlerNotFound(_) | BusError::Cancelled
    )
}

/// Fails fast for request types whose handler keeps failing.
pub struct CircuitBreakerMiddleware {
    config: CircuitBreakerConfig,
    overrides: HashMap<TypeId, CircuitBreakerConfig>,
    breakers: DashMap<TypeId, Arc<CircuitBreaker>>,
    is_failure: FailurePredicate,
    clock: Arc<dyn Clock>,
}

impl CircuitBreakerMiddleware {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            overrides: HashMap::new(),
            breakers: DashMap::new(),
            is_failure: Arc::new(counts_as_failure),
            clock: system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use `config` for the breaker of request type `M`.
    pub fn with_config_for<M: 'static>(mut self, config: CircuitBreakerConfig) -> Self {
        self.overrides.insert(TypeId::of::<M>(), config);
        self
    }

    /// Replace the predicate deciding which errors trip the breaker.
    pub fn failure_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&BusError) -> bool + Send + Sync + 'static,
    {
        self.is_failure = Arc::new(predicate);
        self
    }

    fn breaker(&self, type_id: TypeId, name: &'static str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(type_id)
            .or_insert_with(|| {
                let config = self.overrides.get(&type_id).unwrap_or(&self.config).clone();
                CircuitBreaker::new(name, config, self.clock.clone())
            })
            .clone()
    }

    /// Breaker of request type `M`, if it has been dispatched yet.
    pub fn breaker_of<M: 'static>(&self) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .get(&TypeId::of::<M>())
            .map(|entry| entry.value().clone())
    }

    pub fn state_of<M: 'static>(&self) -> Option<CircuitState> {
        self.breaker_of::<M>().map(|b| b.state())
    }

    pub fn snapshot_of<M: 'static>(&self) -> Option<BreakerSnapshot> {
        self.breaker_of::<M>().map(|b| b.snapshot())
    }

    /// Statistics of every breaker created so far.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        self.breakers
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect()
    }

    /// Close the breaker of request type `M`.
    pub fn reset<M: 'static>(&self) {
        if let Some(breaker) = self.breaker_of::<M>() {
            breaker.reset();
        }
    }
}

impl Default for CircuitBreakerMiddleware {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[async_trait]
impl Middleware for CircuitBreakerMiddleware {
    fn name(&self) -> &'static str {
        "circuit_breaker"
    }

    async fn handle(&self, envelope: Envelope, next: Next<'_>) -> DispatchResult {
        let message_type = envelope.message_type();
        let breaker = self.breaker(envelope.type_id(), message_type);

        let permit = match breaker.try_acquire() {
            Ok(permit) => permit,
            Err(retry_after) => {
                debug!(
                    message_type,
                    state = %breaker.state(),
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Circuit breaker rejected request"
                );
                return Err(BusError::CircuitOpen {
                    message_type,
                    retry_after,
                });
            }
        };

        let result = next.run(envelope).await;
        match &result {
            Ok(_) => permit.success(),
            Err(err) if (self.is_failure)(err) => permit.failure(),
            Err(_) => drop(permit),
        }
        result
    }
}
