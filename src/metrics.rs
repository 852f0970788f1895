//! Lightweight metrics helpers for Portcullis.
//!
//! This module exposes a small set of convenience functions and an RAII timer
//! wrapping the `metrics` crate macros. It does not embed a concrete exporter
//! (the application can install any compatible recorder) while still
//! describing Portcullis-specific metric names.
//!
//! Provided metrics:
//! * `portcullis_requests_total` (counter, label `outcome`)
//! * `portcullis_request_duration_seconds` (histogram, label `stage`)
//! * `portcullis_security_events_total` (counter, labels `event`, `severity`)
//! * `portcullis_rate_limit_rejections_total` (counter, label `scope`)
//!
//! [`RequestTimer`] leverages `Drop` to record durations even on early returns.
use std::time::Instant;

use metrics::{Unit, counter, describe_counter, describe_histogram, histogram};
use once_cell::sync::Lazy;

use crate::core::events::Severity;

pub const PORTCULLIS_REQUESTS_TOTAL: &str = "portcullis_requests_total";
pub const PORTCULLIS_REQUEST_DURATION_SECONDS: &str = "portcullis_request_duration_seconds";
pub const PORTCULLIS_SECURITY_EVENTS_TOTAL: &str = "portcullis_security_events_total";
pub const PORTCULLIS_RATE_LIMIT_REJECTIONS_TOTAL: &str = "portcullis_rate_limit_rejections_total";

static DESCRIPTIONS: Lazy<()> = Lazy::new(|| {
    describe_counter!(
        PORTCULLIS_REQUESTS_TOTAL,
        Unit::Count,
        "Requests seen by the gate, by outcome (proceed, bypass, redirect, blocked...)."
    );
    describe_histogram!(
        PORTCULLIS_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Time spent inside a pipeline stage, including the wrapped handler."
    );
    describe_counter!(
        PORTCULLIS_SECURITY_EVENTS_TOTAL,
        Unit::Count,
        "Security events emitted, by event name and severity."
    );
    describe_counter!(
        PORTCULLIS_RATE_LIMIT_REJECTIONS_TOTAL,
        Unit::Count,
        "Requests refused by a rate limiter, by scope (api, login)."
    );
});

/// Increment the request counter for a gate outcome.
pub fn increment_request_outcome(outcome: &'static str) {
    counter!(PORTCULLIS_REQUESTS_TOTAL, "outcome" => outcome).increment(1);
}

/// Count one emitted security event.
pub fn increment_security_event(event: &str, severity: Severity) {
    counter!(
        PORTCULLIS_SECURITY_EVENTS_TOTAL,
        "event" => event.to_string(),
        "severity" => severity.as_str()
    )
    .increment(1);
}

/// Count one rate-limit rejection.
pub fn increment_rate_limit_rejection(scope: &'static str) {
    counter!(PORTCULLIS_RATE_LIMIT_REJECTIONS_TOTAL, "scope" => scope).increment(1);
}

/// Record how long a stage took.
pub fn record_stage_duration(stage: &'static str, duration: std::time::Duration) {
    histogram!(PORTCULLIS_REQUEST_DURATION_SECONDS, "stage" => stage)
        .record(duration.as_secs_f64());
}

/// RAII helper measuring a pipeline stage.
pub struct RequestTimer {
    start: Instant,
    stage: &'static str,
}

impl RequestTimer {
    pub fn new(stage: &'static str) -> Self {
        Self {
            start: Instant::now(),
            stage,
        }
    }

    /// Time elapsed since the timer started
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        record_stage_duration(self.stage, self.start.elapsed());
    }
}

/// Initialize metric descriptions (idempotent).
pub fn init_metrics() -> eyre::Result<()> {
    tracing::info!("Initializing Portcullis metrics descriptions");
    Lazy::force(&DESCRIPTIONS);
    Ok(())
}
