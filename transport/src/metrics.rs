//! Prometheus metrics for outbound requests

use crate::error::ConfigError;
use prometheus::{
    CounterVec, Encoder, HistogramVec, TextEncoder, register_counter_vec, register_histogram_vec,
};
use parking_lot::Mutex;
use std::sync::OnceLock;

/// Global metrics instance
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Held while registering, so concurrent `init` calls register only once
static INIT_LOCK: Mutex<()> = Mutex::new(());

/// All transport metrics
pub struct Metrics {
    /// Requests completed (by client, outcome)
    pub requests_total: CounterVec,

    /// Attempts made by policies (by policy)
    pub attempts_total: CounterVec,

    /// End-to-end request duration (by client)
    pub request_duration: HistogramVec,
}

impl Metrics {
    /// Initialize metrics (call once at startup)
    ///
    /// Returns error if metric registration fails.
    pub fn init() -> Result<&'static Metrics, ConfigError> {
        if let Some(metrics) = METRICS.get() {
            return Ok(metrics);
        }

        let _guard = INIT_LOCK.lock();
        if let Some(metrics) = METRICS.get() {
            return Ok(metrics);
        }

        let metrics = Self::register()?;
        Ok(METRICS.get_or_init(|| metrics))
    }

    fn register() -> Result<Metrics, ConfigError> {
        Ok(Metrics {
            requests_total: register_counter_vec!(
                "lanka_requests_total",
                "Total requests sent through a client",
                &["client", "outcome"]
            )
            .map_err(|e| ConfigError::Metrics(format!("requests_total: {e}")))?,

            attempts_total: register_counter_vec!(
                "lanka_attempts_total",
                "Total attempts made by resilience policies",
                &["policy"]
            )
            .map_err(|e| ConfigError::Metrics(format!("attempts_total: {e}")))?,

            request_duration: register_histogram_vec!(
                "lanka_request_duration_seconds",
                "Request duration including all attempts",
                &["client"],
                vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
            )
            .map_err(|e| ConfigError::Metrics(format!("request_duration: {e}")))?,
        })
    }

    /// Get the global metrics instance
    ///
    /// Returns None if metrics haven't been initialized yet.
    pub fn get() -> Option<&'static Metrics> {
        METRICS.get()
    }

    /// Record a finished request
    pub fn record_request(&self, client: &str, outcome: Outcome, seconds: f64) {
        self.requests_total
            .with_label_values(&[client, outcome.as_str()])
            .inc();
        self.request_duration
            .with_label_values(&[client])
            .observe(seconds);
    }

    /// Record attempts made under one policy execution
    pub fn record_attempts(&self, policy: &str, count: u32) {
        self.attempts_total
            .with_label_values(&[policy])
            .inc_by(f64::from(count));
    }
}

/// How a request ended, as a metric label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    Cancelled,
    Timeout,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Cancelled => "cancelled",
            Outcome::Timeout => "timeout",
        }
    }
}

/// Gather all metrics and encode as Prometheus text format
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_ok() {
        String::from_utf8(buffer).unwrap_or_default()
    } else {
        String::new()
    }
}

/// Record a finished request if metrics are initialized, otherwise skip
pub fn try_record_request(client: &str, outcome: Outcome, seconds: f64) {
    if let Some(m) = Metrics::get() {
        m.record_request(client, outcome, seconds);
    }
}

/// Record policy attempts if metrics are initialized, otherwise skip
pub fn try_record_attempts(policy: &str, count: u32) {
    if let Some(m) = Metrics::get() {
        m.record_attempts(policy, count);
    }
}
