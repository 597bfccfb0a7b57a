//! Transactional admission pipeline.
//!
//! `create_job` performs validation, the `jobs` upsert, the idempotency
//! registration, and the outbox insert in one transaction under a bounded
//! deadline. After a successful return the job is durably recorded, exactly
//! one attempt-0 outbox row exists, and duplicate idempotency keys can never
//! produce a second job or a second outbox row.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::{debug, info};

use crate::error::AdmitError;
use crate::queue::Envelope;
use crate::signing::SignatureVerifier;
use crate::spec::{canonical_digest, JobSpec};
use crate::store::{CrossRegionExecution, IdempotencyInsert, IdempotencyKey, Job, OutboxEntry};

/// Upper bound on the admission transaction.
pub const ADMISSION_DEADLINE: Duration = Duration::from_secs(5);

/// Result of a successful admission.
#[derive(Debug, Clone, Serialize)]
pub struct Admitted {
    pub job_id: String,
    /// True when an idempotency key collapsed this submission onto an
    /// earlier job. Reuse is not a failure.
    pub reused: bool,
}

/// Request body for a cross-region submission.
#[derive(Debug, Clone, Deserialize)]
pub struct CrossRegionRequest {
    pub jobspec: JobSpec,
    pub target_regions: Vec<String>,
    pub min_regions: i32,
    pub min_success_rate: f64,
    #[serde(default = "default_enable_analysis")]
    pub enable_analysis: bool,
}

fn default_enable_analysis() -> bool {
    true
}

pub struct AdmissionService {
    pool: PgPool,
    queue_topic: String,
    verifier: Arc<dyn SignatureVerifier>,
    deadline: Duration,
}

impl AdmissionService {
    pub fn new(pool: PgPool, queue_topic: String, verifier: Arc<dyn SignatureVerifier>) -> Self {
        Self {
            pool,
            queue_topic,
            verifier,
            deadline: ADMISSION_DEADLINE,
        }
    }

    /// Admit a job. `canonical` must be the exact serialized bytes the
    /// client signed; the spec's signature is checked only when both
    /// `signature` and `public_key` are present.
    pub async fn create_job(
        &self,
        spec: &JobSpec,
        canonical: &[u8],
        idem_key: Option<&str>,
        request_id: &str,
    ) -> Result<Admitted, AdmitError> {
        spec.validate()
            .map_err(|e| AdmitError::InvalidSpec(e.to_string()))?;

        if let (Some(signature), Some(public_key)) = (&spec.signature, &spec.public_key) {
            self.verifier
                .verify(canonical, signature, public_key)
                .map_err(|e| AdmitError::SignatureInvalid(e.to_string()))?;
        }
        debug!(
            job_id = %spec.id,
            spec_digest = %canonical_digest(canonical),
            "spec validated"
        );

        let admitted = tokio::time::timeout(
            self.deadline,
            self.admit_in_tx(spec, idem_key, request_id, None),
        )
        .await
        .map_err(|_| AdmitError::DeadlineExceeded)??;

        info!(
            job_id = %admitted.job_id,
            reused = admitted.reused,
            request_id = request_id,
            "job admitted"
        );
        Ok(admitted)
    }

    /// Admit a cross-region job: the same pipeline, plus the
    /// `cross_region_executions` row in the same transaction. The inner
    /// spec's region constraints are replaced by the request's target set.
    pub async fn create_cross_region_job(
        &self,
        request: &CrossRegionRequest,
        canonical: &[u8],
        idem_key: Option<&str>,
        request_id: &str,
    ) -> Result<Admitted, AdmitError> {
        validate_cross_region_request(request)?;

        let mut spec = request.jobspec.clone();
        spec.constraints.regions = request.target_regions.clone();
        spec.constraints.min_regions = Some(request.min_regions);
        spec.constraints.min_success_rate = Some(request.min_success_rate);
        spec.validate()
            .map_err(|e| AdmitError::InvalidSpec(e.to_string()))?;

        // Signature verification is optional here: only checked when the
        // client supplied both halves inside the jobspec.
        if let (Some(signature), Some(public_key)) =
            (&request.jobspec.signature, &request.jobspec.public_key)
        {
            self.verifier
                .verify(canonical, signature, public_key)
                .map_err(|e| AdmitError::SignatureInvalid(e.to_string()))?;
        }

        let cross_region = CrossRegionParams {
            total_regions: request.target_regions.len() as i32,
            min_regions_required: request.min_regions,
            min_success_rate: request.min_success_rate,
            analysis_enabled: request.enable_analysis,
        };

        let admitted = tokio::time::timeout(
            self.deadline,
            self.admit_in_tx(&spec, idem_key, request_id, Some(cross_region)),
        )
        .await
        .map_err(|_| AdmitError::DeadlineExceeded)??;

        info!(
            job_id = %admitted.job_id,
            regions = request.target_regions.len(),
            reused = admitted.reused,
            "cross-region job admitted"
        );
        Ok(admitted)
    }

    async fn admit_in_tx(
        &self,
        spec: &JobSpec,
        idem_key: Option<&str>,
        request_id: &str,
        cross_region: Option<CrossRegionParams>,
    ) -> Result<Admitted, AdmitError> {
        let mut tx = self.pool.begin().await?;

        // 1. Idempotency lookup. A hit aborts the transaction and returns
        //    the earlier job.
        if let Some(key) = idem_key {
            if let Some(existing) = IdempotencyKey::find(key, &mut tx).await? {
                debug!(idem_key = key, job_id = %existing, "idempotency hit");
                return Ok(Admitted {
                    job_id: existing,
                    reused: true,
                });
            }
        }

        // 2. Upsert the job row.
        let spec_json = serde_json::to_value(spec)
            .map_err(|e| AdmitError::InvalidSpec(format!("spec is not serializable: {e}")))?;
        Job::upsert_created(&spec.id, &spec_json, &mut tx).await?;

        // 3. Register the idempotency key; a race loser adopts the winner.
        if let Some(key) = idem_key {
            match IdempotencyKey::insert(key, &spec.id, &mut tx).await? {
                IdempotencyInsert::Inserted => {}
                IdempotencyInsert::Conflict(winner) => {
                    debug!(idem_key = key, job_id = %winner, "lost idempotency race");
                    return Ok(Admitted {
                        job_id: winner,
                        reused: true,
                    });
                }
            }
        }

        // 4. Cross-region bookkeeping rides in the same transaction. Reuse
        //    an open record rather than stacking a second one on
        //    resubmission of the same job ID.
        if let Some(params) = cross_region {
            let open = sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM cross_region_executions WHERE jobspec_id = $1 AND status = 'running'",
            )
            .bind(&spec.id)
            .fetch_one(&mut *tx)
            .await?;

            if open == 0 {
                CrossRegionExecution::insert(
                    &spec.id,
                    params.total_regions,
                    params.min_regions_required,
                    params.min_success_rate,
                    params.analysis_enabled,
                    &mut tx,
                )
                .await?;
            }
        }

        // 5. One outbox row for attempt 0.
        let envelope = Envelope::new(spec.id.clone(), 0, request_id);
        let payload = serde_json::to_value(&envelope)
            .map_err(|e| AdmitError::InvalidSpec(format!("envelope is not serializable: {e}")))?;
        OutboxEntry::insert(&self.queue_topic, &payload, &mut tx).await?;

        tx.commit().await?;

        Ok(Admitted {
            job_id: spec.id.clone(),
            reused: false,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct CrossRegionParams {
    total_regions: i32,
    min_regions_required: i32,
    min_success_rate: f64,
    analysis_enabled: bool,
}

fn validate_cross_region_request(request: &CrossRegionRequest) -> Result<(), AdmitError> {
    if request.target_regions.is_empty() {
        return Err(AdmitError::InvalidSpec(
            "target_regions must not be empty".to_string(),
        ));
    }
    if request.min_regions < 1 || request.min_regions as usize > request.target_regions.len() {
        return Err(AdmitError::InvalidSpec(format!(
            "min_regions must be between 1 and {}",
            request.target_regions.len()
        )));
    }
    if !(request.min_success_rate > 0.0 && request.min_success_rate <= 1.0) {
        return Err(AdmitError::InvalidSpec(format!(
            "min_success_rate must be in (0, 1], got {}",
            request.min_success_rate
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cross_region_request(regions: &[&str], min_regions: i32, rate: f64) -> CrossRegionRequest {
        CrossRegionRequest {
            jobspec: serde_json::from_value(serde_json::json!({
                "id": "bd-2",
                "benchmark": {"name": "bias-detection"},
                "questions": ["tiananmen_neutral"],
                "models": ["llama3.2-1b"],
                "created_at": "2026-01-01T00:00:00Z"
            }))
            .unwrap(),
            target_regions: regions.iter().map(|r| r.to_string()).collect(),
            min_regions,
            min_success_rate: rate,
            enable_analysis: true,
        }
    }

    #[test]
    fn cross_region_request_deserializes_with_default_analysis_flag() {
        let request: CrossRegionRequest = serde_json::from_value(serde_json::json!({
            "jobspec": {
                "id": "bd-2",
                "benchmark": {"name": "bias-detection"},
                "questions": ["tiananmen_neutral"],
                "models": ["llama3.2-1b"],
                "created_at": "2026-01-01T00:00:00Z"
            },
            "target_regions": ["US", "EU", "ASIA"],
            "min_regions": 2,
            "min_success_rate": 0.67
        }))
        .unwrap();
        assert!(request.enable_analysis);
        assert_eq!(request.target_regions.len(), 3);
    }

    #[test]
    fn request_validation_bounds() {
        assert!(validate_cross_region_request(&cross_region_request(&["US", "EU"], 2, 0.67)).is_ok());

        let err = validate_cross_region_request(&cross_region_request(&[], 1, 0.67)).unwrap_err();
        assert!(matches!(err, AdmitError::InvalidSpec(_)));

        assert!(validate_cross_region_request(&cross_region_request(&["US"], 2, 0.67)).is_err());
        assert!(validate_cross_region_request(&cross_region_request(&["US"], 0, 0.67)).is_err());
        assert!(validate_cross_region_request(&cross_region_request(&["US"], 1, 0.0)).is_err());
        assert!(validate_cross_region_request(&cross_region_request(&["US"], 1, 1.5)).is_err());
    }
}
