//! Prometheus metrics for Conduit
//!
//! # Features
//!
//! - **Dispatch Metrics** - Count, latency and in-flight gauge per request type
//! - **Outcome Labels** - Errors broken down by kind
//! - **Custom Registries** - Register into any [`prometheus::Registry`]
//!
//! # Quick Start
//!
//! ```no_run
//! use conduit_metrics::*;
//!
//! let metrics = MetricsMiddleware::new(default_registry()).unwrap();
//! // command_bus.use_middleware(metrics.clone());
//!
//! // Export metrics
//! let metrics_text = export_metrics();
//! ```

pub mod middleware;

pub use middleware::*;
pub use prometheus;

use once_cell::sync::Lazy;
use prometheus::{Encoder, Registry, TextEncoder};

/// Global default registry
static DEFAULT_REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// Get the default metrics registry
pub fn default_registry() -> &'static Registry {
    &DEFAULT_REGISTRY
}

/// Export the default registry in Prometheus text format
pub fn export_metrics() -> String {
    export_metrics_from_registry(&DEFAULT_REGISTRY)
}

/// Export metrics from a specific registry
///
/// # Examples
///
/// ```
/// use conduit_metrics::*;
/// use prometheus::Registry;
///
/// let registry = Registry::new();
/// let metrics = export_metrics_from_registry(&registry);
/// ```
pub fn export_metrics_from_registry(registry: &Registry) -> String {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::from("# Error encoding metrics\n");
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|_| String::from("# Error converting metrics to UTF-8\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_contains_registered_families() {
        let registry = Registry::new();
        let metrics = MetricsMiddleware::new(&registry).unwrap();
        assert_eq!(metrics.in_flight("Warmup"), 0);

        let text = export_metrics_from_registry(&registry);
        assert!(text.contains("conduit_dispatch_in_flight"));
    }
}
