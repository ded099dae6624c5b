//! Prometheus metrics for security decisions.
//!
//! Metrics are exposed via a dedicated HTTP listener (default: `0.0.0.0:9090`).
//!
//! # Available Metrics
//!
//! ## Counters
//! - `gatekeeper_tokens_issued_total` - Tokens minted (labels: kind)
//! - `gatekeeper_tokens_revoked_total` - Revocation records written
//! - `gatekeeper_auth_failures_total` - Rejected credentials (labels: reason)
//! - `gatekeeper_rate_limited_total` - Requests over a limit (labels: rule)
//! - `gatekeeper_validation_violations_total` - Validator findings (labels: rule, action)
//! - `gatekeeper_store_failures_total` - Shared store errors (labels: operation)
//! - `gatekeeper_key_rotations_total` - DEK rotations
//!
//! ## Histograms
//! - `gatekeeper_request_duration_seconds` - Time spent in the pipeline and
//!   handler (labels: method, status)
//!
//! ## Gauges
//! - `gatekeeper_keyring_keys` - DEKs held in the keyring
//!
//! # Usage
//!
//! ```rust,ignore
//! use gatekeeper::metrics::{init_metrics, record_auth_failure};
//!
//! // Initialize metrics (call once at startup)
//! init_metrics("0.0.0.0:9090".parse()?)?;
//!
//! record_auth_failure("expired_token");
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{error, info};

use crate::token::TokenKind;

/// Metric names as constants for consistency.
pub mod names {
    pub const TOKENS_ISSUED_TOTAL: &str = "gatekeeper_tokens_issued_total";
    pub const TOKENS_REVOKED_TOTAL: &str = "gatekeeper_tokens_revoked_total";
    pub const AUTH_FAILURES_TOTAL: &str = "gatekeeper_auth_failures_total";
    pub const RATE_LIMITED_TOTAL: &str = "gatekeeper_rate_limited_total";
    pub const VALIDATION_VIOLATIONS_TOTAL: &str = "gatekeeper_validation_violations_total";
    pub const STORE_FAILURES_TOTAL: &str = "gatekeeper_store_failures_total";
    pub const KEY_ROTATIONS_TOTAL: &str = "gatekeeper_key_rotations_total";
    pub const REQUEST_DURATION_SECONDS: &str = "gatekeeper_request_duration_seconds";
    pub const KEYRING_KEYS: &str = "gatekeeper_keyring_keys";
}

/// Initialize the Prometheus metrics exporter.
///
/// Sets up metric descriptions and starts the Prometheus HTTP listener on
/// `metrics_addr`.
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(names::TOKENS_ISSUED_TOTAL, "Total number of tokens issued");
    describe_counter!(
        names::TOKENS_REVOKED_TOTAL,
        "Total number of tokens revoked, including refresh rotation"
    );
    describe_counter!(
        names::AUTH_FAILURES_TOTAL,
        "Total number of requests rejected for missing, invalid or insufficient credentials"
    );
    describe_counter!(
        names::RATE_LIMITED_TOTAL,
        "Total number of requests rejected by the rate limiter"
    );
    describe_counter!(
        names::VALIDATION_VIOLATIONS_TOTAL,
        "Total number of input validation findings"
    );
    describe_counter!(
        names::STORE_FAILURES_TOTAL,
        "Total number of shared store operations that failed"
    );
    describe_counter!(
        names::KEY_ROTATIONS_TOTAL,
        "Total number of data encryption key rotations"
    );

    describe_histogram!(
        names::REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );

    describe_gauge!(names::KEYRING_KEYS, "Number of data encryption keys retained");

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Try to initialize metrics, logging any errors but not failing.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

// =============================================================================
// Counter Recording Functions
// =============================================================================

pub fn record_token_issued(kind: TokenKind) {
    counter!(names::TOKENS_ISSUED_TOTAL, "kind" => kind.to_string()).increment(1);
}

pub fn record_token_revoked() {
    counter!(names::TOKENS_REVOKED_TOTAL).increment(1);
}

/// Record a rejected credential. `reason` is the internal reason, which is
/// finer grained than what the client is told.
pub fn record_auth_failure(reason: &'static str) {
    counter!(names::AUTH_FAILURES_TOTAL, "reason" => reason).increment(1);
}

pub fn record_rate_limited(rule: &str) {
    counter!(names::RATE_LIMITED_TOTAL, "rule" => rule.to_string()).increment(1);
}

/// `action` is `blocked` or `logged` depending on the validation mode.
pub fn record_validation_violation(rule: &'static str, action: &'static str) {
    counter!(names::VALIDATION_VIOLATIONS_TOTAL, "rule" => rule, "action" => action).increment(1);
}

pub fn record_store_failure(operation: &'static str) {
    counter!(names::STORE_FAILURES_TOTAL, "operation" => operation).increment(1);
}

pub fn record_key_rotation() {
    counter!(names::KEY_ROTATIONS_TOTAL).increment(1);
}

// =============================================================================
// Histogram Recording Functions
// =============================================================================

/// Record HTTP request duration.
pub fn record_request_duration(method: &str, status: u16, duration_secs: f64) {
    histogram!(names::REQUEST_DURATION_SECONDS, "method" => method.to_string(), "status" => status.to_string())
        .record(duration_secs);
}

// =============================================================================
// Gauge Recording Functions
// =============================================================================

pub fn set_keyring_size(keys: usize) {
    gauge!(names::KEYRING_KEYS).set(keys as f64);
}
