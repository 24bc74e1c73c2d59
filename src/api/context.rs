use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use std::time::Instant;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

/// Per-request bookkeeping: start time plus the single exit point for
/// recording metrics alongside whatever response is produced.
pub struct RequestContext {
    pub route: &'static str,
    pub start: Instant,
}

impl RequestContext {
    pub fn new(route: &'static str) -> Self {
        metrics::gauge!("rate_limiter_http_requests_in_flight", "route" => route).increment(1.0);
        Self {
            route,
            start: Instant::now(),
        }
    }

    /// Build a JSON error body, record the request-duration histogram, and
    /// return the finished response — the single exit point for every error
    /// path so metrics are never forgotten on one branch.
    pub fn error_response(&self, status: hyper::StatusCode, body: String) -> hyper::Response<BoxBody> {
        self.finalize(status.as_u16());
        hyper::Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(full_body(body))
            .unwrap()
    }

    pub fn finalize(&self, status_code: u16) {
        let mut buf = itoa::Buffer::new();
        metrics::counter!(
            "rate_limiter_http_requests_total",
            "route" => self.route,
            "status_code" => buf.format(status_code).to_owned(),
        )
        .increment(1);
        metrics::histogram!(
            "rate_limiter_http_request_duration_seconds",
            "route" => self.route,
        )
        .record(self.start.elapsed().as_secs_f64());
        metrics::gauge!("rate_limiter_http_requests_in_flight", "route" => self.route).decrement(1.0);
    }
}
