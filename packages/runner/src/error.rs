//! Error taxonomy and the persisted failure record.
//!
//! Failures are never stringly-typed: every failed task carries a structured
//! [`FailureRecord`] inside its execution row's `output_data`, and admission
//! surfaces a closed set of error kinds to its caller.

use chrono::{DateTime, Utc};
use router_client::RouterError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use typed_builder::TypedBuilder;

/// Failure code written when a receipt fails verification. Non-transient:
/// no retry is attempted automatically.
pub const RECEIPT_SIGNATURE_INVALID: &str = "RECEIPT_SIGNATURE_INVALID";

/// Failure code for a task that exceeded its per-task deadline on our side
/// (as opposed to the router reporting its own timeout).
pub const TASK_DEADLINE_EXCEEDED: &str = "TASK_DEADLINE_EXCEEDED";

/// Failure code for a panic captured inside a worker.
pub const INTERNAL_PANIC: &str = "INTERNAL_PANIC";

/// Failure code written by the timeout sweeper.
pub const JOB_TIMEOUT: &str = "JOB_TIMEOUT";

// ============================================================================
// Admission errors
// ============================================================================

/// Failures surfaced by the admission service. Idempotent reuse is not a
/// failure and is reported through the success path.
#[derive(Debug, Error)]
pub enum AdmitError {
    /// Structural validation failed; the job is never created.
    #[error("invalid job spec: {0}")]
    InvalidSpec(String),

    /// The spec's signature does not match its canonical bytes.
    #[error("spec signature verification failed: {0}")]
    SignatureInvalid(String),

    /// Transient database failure; the caller may retry.
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[source] sqlx::Error),

    /// The 5 s admission deadline elapsed; the transaction rolled back.
    #[error("admission deadline exceeded")]
    DeadlineExceeded,
}

impl From<sqlx::Error> for AdmitError {
    fn from(e: sqlx::Error) -> Self {
        AdmitError::StoreUnavailable(e)
    }
}

// ============================================================================
// Failure record
// ============================================================================

/// The structured failure document persisted with an execution row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
pub struct FailureRecord {
    /// Pipeline stage that observed the failure (`admission`, `inference`,
    /// `verification`, `sweep`).
    #[builder(setter(into))]
    pub stage: String,

    /// Component that produced the failure.
    #[builder(setter(into))]
    pub component: String,

    #[builder(default, setter(into, strip_option))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subcomponent: Option<String>,

    /// Stable machine-readable code, e.g. `ROUTER_TIMEOUT`.
    #[builder(setter(into))]
    pub code: String,

    /// Coarse error family (`timeout`, `network`, `http`, ...).
    #[serde(rename = "type")]
    #[builder(setter(into))]
    pub error_type: String,

    #[builder(default, setter(into, strip_option))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    #[builder(setter(into))]
    pub message: String,

    /// Whether a retry could plausibly succeed without operator action.
    pub transient: bool,

    #[builder(default = Utc::now())]
    pub timestamp: DateTime<Utc>,
}

impl FailureRecord {
    /// Serialize for the `output_data.failure` sub-document.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({
            "code": self.code,
            "message": self.message,
        }))
    }
}

/// Classify a router outcome into a persisted failure record.
pub fn classify_router_error(err: &RouterError, region: &str) -> FailureRecord {
    let (code, error_type) = match err {
        RouterError::Timeout { .. } => (err.code().to_string(), "timeout"),
        RouterError::Network(_) => (err.code().to_string(), "network"),
        RouterError::NotFound { .. } => (err.code().to_string(), "not_found"),
        RouterError::Http { status, .. } => (format!("ROUTER_HTTP_{status}"), "http"),
        RouterError::Json(_) => (err.code().to_string(), "json"),
        RouterError::Router { .. } => (err.code().to_string(), "router"),
    };

    FailureRecord::builder()
        .stage("inference")
        .component("router_client")
        .code(code)
        .error_type(error_type)
        .region(region.to_string())
        .message(err.to_string())
        .transient(err.is_transient())
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_record_serializes_type_field() {
        let record = FailureRecord::builder()
            .stage("inference")
            .component("router_client")
            .code("ROUTER_TIMEOUT")
            .error_type("timeout")
            .region("US".to_string())
            .message("timed out")
            .transient(true)
            .build();

        let json = record.to_json();
        assert_eq!(json["type"], "timeout");
        assert_eq!(json["code"], "ROUTER_TIMEOUT");
        assert_eq!(json["transient"], true);
        assert!(json.get("subcomponent").is_none());
    }

    #[test]
    fn http_errors_carry_the_status_in_the_code() {
        let err = RouterError::Http {
            status: 503,
            url: "http://r/inference".to_string(),
            body: String::new(),
            metadata: serde_json::json!({}),
        };
        let record = classify_router_error(&err, "EU");
        assert_eq!(record.code, "ROUTER_HTTP_503");
        assert!(record.transient);
        assert_eq!(record.region.as_deref(), Some("EU"));
    }

    #[test]
    fn not_found_is_not_transient() {
        let err = RouterError::NotFound { tried: vec![] };
        let record = classify_router_error(&err, "US");
        assert_eq!(record.code, "ROUTER_NOT_FOUND");
        assert!(!record.transient);
    }
}
