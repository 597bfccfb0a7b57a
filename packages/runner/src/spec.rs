//! The canonical job specification document.
//!
//! A job spec is a signed declaration of what to run: a benchmark, a
//! question list, a model list, and region constraints. The signature (when
//! present) covers the exact canonical bytes the client serialized, so the
//! document itself is stored verbatim and re-serialization is never treated
//! as canonical.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Default success fraction a job must reach to complete (used when the
/// spec omits `min_success_rate`).
pub const DEFAULT_MIN_SUCCESS_RATE: f64 = 0.67;

/// Region literal recorded when a job carries no region constraint.
pub const UNKNOWN_REGION: &str = "unknown";

/// Structural problems found while validating a spec.
#[derive(Debug, Error)]
pub enum SpecError {
    #[error("missing required field: {0}")]
    Missing(&'static str),
    #[error("{0}")]
    Invalid(String),
}

/// Canonical, signed declaration of what to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// Client-chosen, globally unique job ID.
    pub id: String,
    #[serde(default)]
    pub version: Option<String>,
    pub benchmark: Benchmark,
    #[serde(default)]
    pub constraints: Constraints,
    /// Question IDs (or literal prompts). May be empty for legacy batches.
    #[serde(default)]
    pub questions: Vec<String>,
    pub models: Vec<String>,
    /// Base64 Ed25519 signature over the canonical bytes.
    #[serde(default)]
    pub signature: Option<String>,
    /// Base64 Ed25519 public key.
    #[serde(default)]
    pub public_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Benchmark {
    pub name: String,
    #[serde(default)]
    pub container: Option<ContainerRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRef {
    pub image: String,
    #[serde(default)]
    pub digest: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Constraints {
    #[serde(default)]
    pub regions: Vec<String>,
    #[serde(default)]
    pub min_regions: Option<i32>,
    #[serde(default)]
    pub min_success_rate: Option<f64>,
}

impl JobSpec {
    /// Structural validation. Signature checks are a separate concern.
    pub fn validate(&self) -> Result<(), SpecError> {
        if self.id.trim().is_empty() {
            return Err(SpecError::Missing("id"));
        }
        if self.id.len() > 128 {
            return Err(SpecError::Invalid("id exceeds 128 characters".to_string()));
        }
        if self.benchmark.name.trim().is_empty() {
            return Err(SpecError::Missing("benchmark.name"));
        }
        if self.models.is_empty() {
            return Err(SpecError::Missing("models"));
        }
        if self.models.iter().any(|m| m.trim().is_empty()) {
            return Err(SpecError::Invalid("models contains an empty entry".to_string()));
        }
        if self.constraints.regions.iter().any(|r| r.trim().is_empty()) {
            return Err(SpecError::Invalid("regions contains an empty entry".to_string()));
        }
        if let Some(rate) = self.constraints.min_success_rate {
            if !(rate > 0.0 && rate <= 1.0) {
                return Err(SpecError::Invalid(format!(
                    "min_success_rate must be in (0, 1], got {rate}"
                )));
            }
        }
        if let Some(min_regions) = self.constraints.min_regions {
            if min_regions < 1 {
                return Err(SpecError::Invalid(format!(
                    "min_regions must be at least 1, got {min_regions}"
                )));
            }
        }
        Ok(())
    }

    /// Regions to fan out across. A spec without region constraints runs
    /// once under the `"unknown"` region literal.
    pub fn effective_regions(&self) -> Vec<String> {
        if self.constraints.regions.is_empty() {
            vec![UNKNOWN_REGION.to_string()]
        } else {
            self.constraints.regions.clone()
        }
    }

    /// Success fraction required for the job to complete.
    pub fn min_success_rate(&self) -> f64 {
        self.constraints
            .min_success_rate
            .unwrap_or(DEFAULT_MIN_SUCCESS_RATE)
    }

    /// Whether this spec targets more than one region.
    pub fn is_cross_region(&self) -> bool {
        self.constraints.regions.len() > 1
    }
}

/// Hex SHA-256 digest of the canonical spec bytes, used for logging and
/// receipt correlation.
pub fn canonical_digest(canonical: &[u8]) -> String {
    hex::encode(Sha256::digest(canonical))
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_spec() -> JobSpec {
        serde_json::from_value(serde_json::json!({
            "id": "who-are-you-1",
            "benchmark": {"name": "identity-probe"},
            "constraints": {"regions": ["US"]},
            "questions": ["Who are you?"],
            "models": ["llama3.2-1b"],
            "created_at": "2026-01-01T00:00:00Z"
        }))
        .unwrap()
    }

    #[test]
    fn sample_spec_validates() {
        assert!(sample_spec().validate().is_ok());
    }

    #[test]
    fn empty_id_is_rejected() {
        let mut spec = sample_spec();
        spec.id = "  ".to_string();
        assert!(matches!(spec.validate(), Err(SpecError::Missing("id"))));
    }

    #[test]
    fn empty_models_are_rejected() {
        let mut spec = sample_spec();
        spec.models.clear();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn out_of_range_success_rate_is_rejected() {
        let mut spec = sample_spec();
        spec.constraints.min_success_rate = Some(1.5);
        assert!(spec.validate().is_err());
        spec.constraints.min_success_rate = Some(0.0);
        assert!(spec.validate().is_err());
        spec.constraints.min_success_rate = Some(0.67);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn regionless_spec_runs_under_unknown() {
        let mut spec = sample_spec();
        spec.constraints.regions.clear();
        assert_eq!(spec.effective_regions(), vec!["unknown".to_string()]);
        assert!(!spec.is_cross_region());
    }

    #[test]
    fn min_success_rate_defaults() {
        let mut spec = sample_spec();
        spec.constraints.min_success_rate = None;
        assert!((spec.min_success_rate() - 0.67).abs() < f64::EPSILON);
    }

    #[test]
    fn canonical_digest_is_stable_hex() {
        let digest = canonical_digest(b"payload");
        assert_eq!(digest.len(), 64);
        assert_eq!(digest, canonical_digest(b"payload"));
        assert_ne!(digest, canonical_digest(b"payload2"));
    }
}
