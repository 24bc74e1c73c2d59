use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`, `gauge!`,
/// `histogram!`) can be used anywhere in the codebase. The `PrometheusHandle`
/// is retained solely for rendering the `/metrics` endpoint.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric descriptions.
    ///
    /// Must be called **once** at startup before any `counter!` / `gauge!` /
    /// `histogram!` calls.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher")
            .install_recorder()
            .expect("failed to install metrics recorder");

        describe_counter!(
            "rate_limiter_http_requests_total",
            Unit::Count,
            "Total HTTP requests processed"
        );
        describe_histogram!(
            "rate_limiter_http_request_duration_seconds",
            Unit::Seconds,
            "Request duration from client perspective"
        );
        describe_gauge!(
            "rate_limiter_http_requests_in_flight",
            Unit::Count,
            "Number of requests currently being processed"
        );

        describe_counter!(
            "rate_limiter_allowed_total",
            Unit::Count,
            "Total requests admitted by the decision engine"
        );
        describe_counter!(
            "rate_limiter_rejected_total",
            Unit::Count,
            "Total requests rejected by the decision engine, by dimension"
        );
        describe_counter!(
            "rate_limiter_store_errors_total",
            Unit::Count,
            "Total store round-trips that failed"
        );
        describe_histogram!(
            "rate_limiter_store_eval_duration_seconds",
            Unit::Seconds,
            "Store script evaluation round-trip duration"
        );

        describe_gauge!(
            "rate_limiter_connections_active",
            Unit::Count,
            "Number of active downstream connections"
        );
        describe_counter!(
            "rate_limiter_connections_total",
            Unit::Count,
            "Total connections accepted"
        );

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
