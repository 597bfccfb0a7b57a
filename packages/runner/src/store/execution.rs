//! Execution rows: one per (job, region, model, question) task.
//!
//! The uniqueness constraint on that tuple is the system's idempotency
//! anchor: envelope redelivery, crash re-dispatch, and concurrent workers
//! all collapse onto a single row per task.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection, PgPool};

use crate::error::FailureRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "execution_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::Cancelled
                | ExecutionStatus::Timeout
        )
    }
}

/// One attempt appended to `retry_history`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryAttempt {
    pub attempt: i32,
    pub at: DateTime<Utc>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: i64,
    pub job_id: String,
    pub model_id: String,
    pub region: String,
    pub question_id: Option<String>,
    pub provider_id: Option<String>,
    pub status: ExecutionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output_data: Option<serde_json::Value>,
    pub receipt_data: Option<serde_json::Value>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub retry_history: serde_json::Value,
    pub original_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of claiming a task slot.
#[derive(Debug)]
pub enum TaskClaim {
    /// New row inserted with `status='running'`.
    Fresh(Execution),
    /// Existing non-terminal row reclaimed (crash re-entry).
    Resumed(Execution),
    /// Existing terminal row; the runner must not re-dispatch.
    AlreadyTerminal(Execution),
}

impl Execution {
    pub async fn find_by_id(id: i64, db: &PgPool) -> Result<Option<Self>> {
        let execution = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, job_id, model_id, region, question_id, provider_id, status,
                   started_at, completed_at, output_data, receipt_data,
                   retry_count, max_retries, last_retry_at, retry_history,
                   original_error, created_at, updated_at
            FROM executions
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(db)
        .await?;

        Ok(execution)
    }

    pub async fn find_by_job(job_id: &str, db: &PgPool) -> Result<Vec<Self>> {
        let executions = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, job_id, model_id, region, question_id, provider_id, status,
                   started_at, completed_at, output_data, receipt_data,
                   retry_count, max_retries, last_retry_at, retry_history,
                   original_error, created_at, updated_at
            FROM executions
            WHERE job_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(job_id)
        .fetch_all(db)
        .await?;

        Ok(executions)
    }

    /// Latest receipts for the status endpoint.
    pub async fn latest_for_job(job_id: &str, limit: i64, db: &PgPool) -> Result<Vec<Self>> {
        let executions = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, job_id, model_id, region, question_id, provider_id, status,
                   started_at, completed_at, output_data, receipt_data,
                   retry_count, max_retries, last_retry_at, retry_history,
                   original_error, created_at, updated_at
            FROM executions
            WHERE job_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(job_id)
        .bind(limit)
        .fetch_all(db)
        .await?;

        Ok(executions)
    }

    /// Claim the task slot for `(job_id, region, model_id, question_id)`.
    ///
    /// Inserts a `running` row, or resolves the conflict against the
    /// existing row: terminal rows are returned untouched so the caller can
    /// skip, non-terminal rows are moved back to `running`.
    pub async fn claim_task(
        job_id: &str,
        region: &str,
        model_id: &str,
        question_id: Option<&str>,
        conn: &mut PgConnection,
    ) -> Result<TaskClaim, sqlx::Error> {
        let inserted = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO executions (job_id, model_id, region, question_id, status, started_at)
            VALUES ($1, $2, $3, $4, 'running', NOW())
            ON CONFLICT (job_id, region, model_id, question_id) DO NOTHING
            RETURNING id, job_id, model_id, region, question_id, provider_id, status,
                      started_at, completed_at, output_data, receipt_data,
                      retry_count, max_retries, last_retry_at, retry_history,
                      original_error, created_at, updated_at
            "#,
        )
        .bind(job_id)
        .bind(model_id)
        .bind(region)
        .bind(question_id)
        .fetch_optional(&mut *conn)
        .await?;

        if let Some(execution) = inserted {
            return Ok(TaskClaim::Fresh(execution));
        }

        let existing = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, job_id, model_id, region, question_id, provider_id, status,
                   started_at, completed_at, output_data, receipt_data,
                   retry_count, max_retries, last_retry_at, retry_history,
                   original_error, created_at, updated_at
            FROM executions
            WHERE job_id = $1 AND region = $2 AND model_id = $3
              AND question_id IS NOT DISTINCT FROM $4
            "#,
        )
        .bind(job_id)
        .bind(region)
        .bind(model_id)
        .bind(question_id)
        .fetch_one(&mut *conn)
        .await?;

        if existing.status.is_terminal() {
            return Ok(TaskClaim::AlreadyTerminal(existing));
        }

        let resumed = sqlx::query_as::<_, Self>(
            r#"
            UPDATE executions
            SET status = 'running',
                started_at = COALESCE(started_at, NOW()),
                updated_at = NOW()
            WHERE id = $1
            RETURNING id, job_id, model_id, region, question_id, provider_id, status,
                      started_at, completed_at, output_data, receipt_data,
                      retry_count, max_retries, last_retry_at, retry_history,
                      original_error, created_at, updated_at
            "#,
        )
        .bind(existing.id)
        .fetch_one(&mut *conn)
        .await?;

        Ok(TaskClaim::Resumed(resumed))
    }

    /// Record a successful inference.
    pub async fn complete(
        id: i64,
        provider_id: Option<&str>,
        output_data: &serde_json::Value,
        receipt_data: Option<&serde_json::Value>,
        conn: &mut PgConnection,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE executions
            SET status = 'completed',
                completed_at = NOW(),
                provider_id = COALESCE($2, provider_id),
                output_data = $3,
                receipt_data = $4,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(provider_id)
        .bind(output_data)
        .bind(receipt_data)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Record a failed, timed-out, or cancelled task. The structured
    /// failure document is merged into `output_data.failure`, `extra`
    /// (router response details, when any) is merged alongside it, and
    /// `original_error` is written only if empty.
    pub async fn fail(
        id: i64,
        status: ExecutionStatus,
        failure: &FailureRecord,
        extra: Option<&serde_json::Value>,
        conn: &mut PgConnection,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE executions
            SET status = $2,
                completed_at = NOW(),
                output_data = COALESCE(output_data, '{}'::jsonb)
                    || COALESCE($5::jsonb, '{}'::jsonb)
                    || jsonb_build_object('failure', $3::jsonb),
                original_error = COALESCE(original_error, $4),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(failure.to_json())
        .bind(&failure.message)
        .bind(extra)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// External cancellation. Only non-terminal rows can be cancelled.
    pub async fn cancel(id: i64, db: &PgPool) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE executions
            SET status = 'cancelled', completed_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status IN ('pending', 'running')
            "#,
        )
        .bind(id)
        .execute(db)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Statuses of every task of a job, inside the caller's transaction.
    pub async fn statuses_for_job(
        job_id: &str,
        conn: &mut PgConnection,
    ) -> Result<Vec<ExecutionStatus>, sqlx::Error> {
        sqlx::query_scalar::<_, ExecutionStatus>(
            "SELECT status FROM executions WHERE job_id = $1",
        )
        .bind(job_id)
        .fetch_all(&mut *conn)
        .await
    }

    /// Record a retry outcome: bumps the counters, appends to
    /// `retry_history`, and overwrites the terminal fields.
    pub async fn record_retry(
        id: i64,
        status: ExecutionStatus,
        output_data: Option<&serde_json::Value>,
        attempt: &RetryAttempt,
        error_message: Option<&str>,
        conn: &mut PgConnection,
    ) -> Result<Self, sqlx::Error> {
        let attempt_json =
            serde_json::to_value(attempt).unwrap_or(serde_json::Value::Null);

        sqlx::query_as::<_, Self>(
            r#"
            UPDATE executions
            SET status = $2,
                output_data = COALESCE($3, output_data),
                completed_at = NOW(),
                retry_count = retry_count + 1,
                last_retry_at = NOW(),
                retry_history = retry_history || jsonb_build_array($4::jsonb),
                original_error = COALESCE(original_error, $5),
                updated_at = NOW()
            WHERE id = $1
            RETURNING id, job_id, model_id, region, question_id, provider_id, status,
                      started_at, completed_at, output_data, receipt_data,
                      retry_count, max_retries, last_retry_at, retry_history,
                      original_error, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(output_data)
        .bind(attempt_json)
        .bind(error_message)
        .fetch_one(&mut *conn)
        .await
    }

    /// Sweep every open task of a job into a terminal status, writing the
    /// failure document on each. Used by the timeout sweeper and the panic
    /// path. Returns affected rows.
    pub async fn fail_open_tasks(
        job_id: &str,
        status: ExecutionStatus,
        failure: &FailureRecord,
        conn: &mut PgConnection,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE executions
            SET status = $2,
                completed_at = NOW(),
                output_data = COALESCE(output_data, '{}'::jsonb)
                    || jsonb_build_object('failure', $3::jsonb),
                original_error = COALESCE(original_error, $4),
                updated_at = NOW()
            WHERE job_id = $1 AND status IN ('pending', 'running')
            "#,
        )
        .bind(job_id)
        .bind(status)
        .bind(failure.to_json())
        .bind(&failure.message)
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected())
    }

    /// Placeholder row written when a stuck job never produced any
    /// executions, so the failure document stays discoverable.
    pub async fn insert_failure_placeholder(
        job_id: &str,
        status: ExecutionStatus,
        failure: &FailureRecord,
        conn: &mut PgConnection,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO executions
                (job_id, model_id, region, question_id, status, started_at, completed_at,
                 output_data, original_error)
            VALUES ($1, 'unknown', 'unknown', NULL, $2, NOW(), NOW(),
                    jsonb_build_object('failure', $3::jsonb), $4)
            ON CONFLICT (job_id, region, model_id, question_id) DO NOTHING
            "#,
        )
        .bind(job_id)
        .bind(status)
        .bind(failure.to_json())
        .bind(&failure.message)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Decode the persisted failure document, if any.
    pub fn failure(&self) -> Option<FailureRecord> {
        self.output_data
            .as_ref()
            .and_then(|data| data.get("failure"))
            .and_then(|f| serde_json::from_value(f.clone()).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
        assert!(ExecutionStatus::Timeout.is_terminal());
        assert!(!ExecutionStatus::Pending.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
    }

    #[test]
    fn unknown_execution_status_is_rejected() {
        assert!(serde_json::from_str::<ExecutionStatus>("\"paused\"").is_err());
        let ok: ExecutionStatus = serde_json::from_str("\"timeout\"").unwrap();
        assert_eq!(ok, ExecutionStatus::Timeout);
    }

    #[test]
    fn retry_attempt_serializes_compactly() {
        let attempt = RetryAttempt {
            attempt: 2,
            at: Utc::now(),
            success: true,
            error: None,
            provider_id: Some("modal-us-east".to_string()),
        };
        let json = serde_json::to_value(&attempt).unwrap();
        assert!(json.get("error").is_none());
        assert_eq!(json["attempt"], 2);
    }
}
