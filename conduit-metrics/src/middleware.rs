//! Dispatch metrics middleware
//!
//! Collects per-request-type dispatch metrics.

use async_trait::async_trait;
use conduit_core::{DispatchResult, Envelope, Middleware, Next};
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry};
use std::time::Instant;

const DURATION_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0, 7.5, 10.0,
];

/// Dispatch metrics middleware
///
/// Collects the following metrics:
/// - `conduit_dispatch_total{message_type, kind, outcome}` - Completed dispatches
/// - `conduit_dispatch_duration_seconds{message_type, outcome}` - Dispatch latency
/// - `conduit_dispatch_in_flight{message_type}` - Dispatches currently running
///
/// `outcome` is `ok` or the error kind (`validation`, `circuit_open`, ...).
///
/// # Examples
///
/// ```no_run
/// use conduit_metrics::*;
///
/// let middleware = MetricsMiddleware::new(default_registry()).unwrap();
/// ```
#[derive(Clone)]
pub struct MetricsMiddleware {
    dispatched: IntCounterVec,
    duration: HistogramVec,
    in_flight: IntGaugeVec,
}

impl MetricsMiddleware {
    /// Create the collectors and register them in `registry`.
    ///
    /// Fails if the collectors are already registered there.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let dispatched = IntCounterVec::new(
            Opts::new("conduit_dispatch_total", "Total number of completed dispatches"),
            &["message_type", "kind", "outcome"],
        )?;
        let duration = HistogramVec::new(
            HistogramOpts::new(
                "conduit_dispatch_duration_seconds",
                "Dispatch duration in seconds",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["message_type", "outcome"],
        )?;
        let in_flight = IntGaugeVec::new(
            Opts::new(
                "conduit_dispatch_in_flight",
                "Number of dispatches currently being processed",
            ),
            &["message_type"],
        )?;

        registry.register(Box::new(dispatched.clone()))?;
        registry.register(Box::new(duration.clone()))?;
        registry.register(Box::new(in_flight.clone()))?;

        Ok(Self {
            dispatched,
            duration,
            in_flight,
        })
    }

    /// Completed dispatches of `message_type` with `outcome`.
    pub fn dispatched(&self, message_type: &str, kind: &str, outcome: &str) -> u64 {
        self.dispatched
            .with_label_values(&[message_type, kind, outcome])
            .get()
    }

    /// Dispatches of `message_type` currently running.
    pub fn in_flight(&self, message_type: &str) -> i64 {
        self.in_flight.with_label_values(&[message_type]).get()
    }
}

/// Decrements the in-flight gauge even when the dispatch is dropped.
struct InFlight(prometheus::IntGauge);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.dec();
    }
}

#[async_trait]
impl Middleware for MetricsMiddleware {
    fn name(&self) -> &'static str {
        "metrics"
    }

    async fn handle(&self, envelope: Envelope, next: Next<'_>) -> DispatchResult {
        let message_type = envelope.message_type();
        let kind = envelope.kind().as_str();

        let gauge = self.in_flight.with_label_values(&[message_type]);
        gauge.inc();
        let _in_flight = InFlight(gauge);

        let start = Instant::now();
        let result = next.run(envelope).await;
        let elapsed = start.elapsed().as_secs_f64();

        let outcome = match &result {
            Ok(_) => "ok",
            Err(err) => err.kind().as_str(),
        };

        self.dispatched
            .with_label_values(&[message_type, kind, outcome])
            .inc();
        self.duration
            .with_label_values(&[message_type, outcome])
            .observe(elapsed);

        result
    }
}
