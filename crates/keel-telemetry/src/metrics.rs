//! Counters emitted by the request pipeline.
//!
//! Recording goes through the `metrics` facade; without an installed recorder
//! every call is a no-op, so applications opt in by installing one.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `keel_requests_total` | Counter | `status` |
//! | `keel_rate_limit_denied_total` | Counter | `action` |
//! | `keel_unhandled_errors_total` | Counter | `code` |
//! | `keel_request_duration_seconds` | Histogram | - |

use std::time::Duration;

use metrics::{counter, describe_counter, describe_histogram, histogram};

/// Registers descriptions for the standard metrics with the installed recorder.
pub fn describe_metrics() {
    describe_counter!("keel_requests_total", "Total number of HTTP requests handled");
    describe_counter!(
        "keel_rate_limit_denied_total",
        "Requests rejected by a rate-limit check"
    );
    describe_counter!(
        "keel_unhandled_errors_total",
        "Errors converted to responses by the error-handling frame"
    );
    describe_histogram!(
        "keel_request_duration_seconds",
        "HTTP request duration in seconds"
    );
}

/// Records a completed request.
pub fn record_request(status_code: u16, duration: Duration) {
    counter!("keel_requests_total", "status" => status_code.to_string()).increment(1);
    histogram!("keel_request_duration_seconds").record(duration.as_secs_f64());
}

/// Records a rate-limit denial for `action`.
pub fn record_rate_limit_denied(action: &str) {
    counter!("keel_rate_limit_denied_total", "action" => action.to_string()).increment(1);
}

/// Records an error turned into a response.
pub fn record_unhandled_error(code: &'static str) {
    counter!("keel_unhandled_errors_total", "code" => code).increment(1);
}
