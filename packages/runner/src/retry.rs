//! Operator-triggered retry of a single failed task.
//!
//! Re-runs one question of one execution on demand. The retry budget
//! (`max_retries`) is informational; enforcement is the caller's
//! responsibility. The parent job's status is left alone; callers
//! re-evaluate aggregation separately.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use router_client::{InferenceRequest, RouterClient};
use sqlx::PgPool;
use thiserror::Error;
use tracing::{info, warn};

use crate::runner::bias;
use crate::runner::prompts::{self, DEFAULT_MODEL};
use crate::spec::UNKNOWN_REGION;
use crate::store::{Execution, ExecutionStatus, Job, RetryAttempt};

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("execution {0} not found")]
    ExecutionNotFound(i64),
    #[error("job {0} not found")]
    JobNotFound(String),
    #[error("execution {0} is cancelled and cannot be retried")]
    Cancelled(i64),
    #[error("question index {index} out of range (spec has {len} questions)")]
    QuestionOutOfRange { index: usize, len: usize },
    #[error("stored job spec is undecodable: {0}")]
    BadSpec(String),
    #[error("store unavailable: {0}")]
    Store(#[from] sqlx::Error),
    #[error("{0}")]
    Internal(String),
}

fn store_err(e: anyhow::Error) -> RetryError {
    match e.downcast::<sqlx::Error>() {
        Ok(sql) => RetryError::Store(sql),
        Err(other) => RetryError::Internal(other.to_string()),
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub deadline: Duration,
    pub temperature: f64,
    pub max_tokens: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(300),
            temperature: 0.0,
            max_tokens: 1024,
        }
    }
}

pub struct RetryService {
    pool: PgPool,
    router: Arc<RouterClient>,
    config: RetryConfig,
}

impl RetryService {
    pub fn new(pool: PgPool, router: Arc<RouterClient>) -> Self {
        Self::with_config(pool, router, RetryConfig::default())
    }

    pub fn with_config(pool: PgPool, router: Arc<RouterClient>, config: RetryConfig) -> Self {
        Self { pool, router, config }
    }

    /// Re-run `spec.questions[question_index]` for an execution in the given
    /// region. The updated row is returned whether the attempt succeeded or
    /// failed; only precondition violations are errors.
    pub async fn retry_question_execution(
        &self,
        execution_id: i64,
        region: &str,
        question_index: usize,
    ) -> Result<Execution, RetryError> {
        let execution = Execution::find_by_id(execution_id, &self.pool)
            .await
            .map_err(store_err)?
            .ok_or(RetryError::ExecutionNotFound(execution_id))?;

        if execution.status == ExecutionStatus::Cancelled {
            return Err(RetryError::Cancelled(execution_id));
        }

        let job = Job::find_by_id(&execution.job_id, &self.pool)
            .await
            .map_err(store_err)?
            .ok_or_else(|| RetryError::JobNotFound(execution.job_id.clone()))?;
        let spec = job.spec().map_err(|e| RetryError::BadSpec(e.to_string()))?;

        let question = spec
            .questions
            .get(question_index)
            .ok_or(RetryError::QuestionOutOfRange {
                index: question_index,
                len: spec.questions.len(),
            })?;

        let model = if execution.model_id.trim().is_empty() {
            DEFAULT_MODEL.to_string()
        } else {
            execution.model_id.clone()
        };

        let request = InferenceRequest {
            model,
            prompt: prompts::resolve(question),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            region_preference: Some(region.to_string()).filter(|r| r != UNKNOWN_REGION),
            cost_priority: false,
        };

        let attempt_number = execution.retry_count + 1;
        let outcome =
            tokio::time::timeout(self.config.deadline, self.router.run_inference(&request, None))
                .await;

        let mut conn = self.pool.acquire().await?;
        let updated = match outcome {
            Ok(Ok(response)) => {
                let scoring = bias::score_response(&response.response);
                let output = serde_json::json!({
                    "response": response.response,
                    "bias_score": scoring.score,
                    "refusal": scoring.refusal,
                    "provider_used": response.provider_used,
                    "inference_time": response.inference_time,
                    "metadata": response.metadata,
                });
                let attempt = RetryAttempt {
                    attempt: attempt_number,
                    at: Utc::now(),
                    success: true,
                    error: None,
                    provider_id: response.provider_used.clone(),
                };
                info!(
                    execution_id = execution_id,
                    attempt = attempt_number,
                    region = region,
                    "retry succeeded"
                );
                Execution::record_retry(
                    execution_id,
                    ExecutionStatus::Completed,
                    Some(&output),
                    &attempt,
                    None,
                    &mut conn,
                )
                .await?
            }
            Ok(Err(err)) => {
                let message = err.to_string();
                let attempt = RetryAttempt {
                    attempt: attempt_number,
                    at: Utc::now(),
                    success: false,
                    error: Some(message.clone()),
                    provider_id: None,
                };
                warn!(
                    execution_id = execution_id,
                    attempt = attempt_number,
                    error = %message,
                    "retry failed"
                );
                Execution::record_retry(
                    execution_id,
                    ExecutionStatus::Failed,
                    None,
                    &attempt,
                    Some(&message),
                    &mut conn,
                )
                .await?
            }
            Err(_) => {
                let message = format!(
                    "retry exceeded its {}s deadline",
                    self.config.deadline.as_secs()
                );
                let attempt = RetryAttempt {
                    attempt: attempt_number,
                    at: Utc::now(),
                    success: false,
                    error: Some(message.clone()),
                    provider_id: None,
                };
                warn!(execution_id = execution_id, "retry timed out");
                Execution::record_retry(
                    execution_id,
                    ExecutionStatus::Failed,
                    None,
                    &attempt,
                    Some(&message),
                    &mut conn,
                )
                .await?
            }
        };

        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_config_defaults_match_task_defaults() {
        let config = RetryConfig::default();
        assert_eq!(config.deadline, Duration::from_secs(300));
        assert_eq!(config.max_tokens, 1024);
    }

    #[test]
    fn error_messages_name_the_offender() {
        let err = RetryError::QuestionOutOfRange { index: 5, len: 2 };
        assert!(err.to_string().contains("5"));
        assert!(err.to_string().contains("2"));
    }
}
