//! Job rows: the admission-time record of a benchmark run.

use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::types::PgInterval;
use sqlx::{FromRow, PgConnection, PgPool};

use crate::spec::JobSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Created,
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Statuses from which the runner may claim an envelope.
    pub fn is_runnable(&self) -> bool {
        matches!(self, JobStatus::Created | JobStatus::Queued)
    }
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub spec: serde_json::Value,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Decode the stored spec document.
    pub fn spec(&self) -> Result<JobSpec> {
        Ok(serde_json::from_value(self.spec.clone())?)
    }

    pub async fn find_by_id(id: &str, db: &PgPool) -> Result<Option<Self>> {
        let job = sqlx::query_as::<_, Self>(
            "SELECT id, spec, status, created_at, updated_at FROM jobs WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(db)
        .await?;

        Ok(job)
    }

    /// Insert or overwrite the job with `status='created'`. On conflict by
    /// ID the spec is replaced and `updated_at` bumped; the status of an
    /// existing row is left alone so re-admission of a finished job does not
    /// resurrect it.
    pub async fn upsert_created(
        id: &str,
        spec: &serde_json::Value,
        conn: &mut PgConnection,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO jobs (id, spec, status)
            VALUES ($1, $2, 'created')
            ON CONFLICT (id) DO UPDATE SET
                spec = EXCLUDED.spec,
                updated_at = NOW()
            RETURNING id, spec, status, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(spec)
        .fetch_one(&mut *conn)
        .await
    }

    /// Claim the job for processing. Returns false if another worker got
    /// there first or the job already moved on.
    pub async fn mark_processing(id: &str, db: &PgPool) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'processing', updated_at = NOW()
            WHERE id = $1 AND status IN ('created', 'queued')
            "#,
        )
        .bind(id)
        .execute(db)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Unconditional status write inside a caller's transaction.
    pub async fn set_status(
        id: &str,
        status: JobStatus,
        conn: &mut PgConnection,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE jobs SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(status)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Terminal transition guarded on the job still being `processing`,
    /// so concurrent evaluators settle on exactly one outcome.
    pub async fn finish_processing(
        id: &str,
        status: JobStatus,
        conn: &mut PgConnection,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(status)
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Jobs stuck in `processing` for longer than the threshold.
    pub async fn find_stale_processing(
        threshold: PgInterval,
        db: &PgPool,
    ) -> Result<Vec<Self>> {
        let jobs = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, spec, status, created_at, updated_at
            FROM jobs
            WHERE status = 'processing' AND updated_at < NOW() - $1
            ORDER BY updated_at
            "#,
        )
        .bind(threshold)
        .fetch_all(db)
        .await?;

        Ok(jobs)
    }

    /// Re-checked reset used by the recovery sweeper inside its
    /// transaction. Returns false if the job moved meanwhile.
    pub async fn reset_stale(
        id: &str,
        threshold: PgInterval,
        conn: &mut PgConnection,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'created', updated_at = NOW()
            WHERE id = $1 AND status = 'processing' AND updated_at < NOW() - $2
            "#,
        )
        .bind(id)
        .bind(threshold)
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Re-checked timeout transition used by the timeout sweeper. Returns
    /// how long the job had sat in `processing`, or None if it moved
    /// meanwhile. The duration is measured against the pre-update
    /// `updated_at` via a self-join, since RETURNING sees the new row.
    pub async fn fail_timed_out(
        id: &str,
        threshold: PgInterval,
        conn: &mut PgConnection,
    ) -> Result<Option<Duration>, sqlx::Error> {
        let stuck_for: Option<f64> = sqlx::query_scalar(
            r#"
            UPDATE jobs
            SET status = 'failed', updated_at = NOW()
            FROM (SELECT id AS prev_id, updated_at AS prev_updated_at FROM jobs WHERE id = $1) prev
            WHERE jobs.id = prev.prev_id
              AND jobs.status = 'processing'
              AND jobs.updated_at < NOW() - $2
            RETURNING EXTRACT(EPOCH FROM NOW() - prev.prev_updated_at)::FLOAT8
            "#,
        )
        .bind(id)
        .bind(threshold)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(stuck_for.map(|secs| Duration::from_secs_f64(secs.max(0.0))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(!JobStatus::Created.is_terminal());
    }

    #[test]
    fn runnable_statuses() {
        assert!(JobStatus::Created.is_runnable());
        assert!(JobStatus::Queued.is_runnable());
        assert!(!JobStatus::Processing.is_runnable());
        assert!(!JobStatus::Completed.is_runnable());
    }

    #[test]
    fn unknown_status_values_are_rejected_at_parse_time() {
        let err = serde_json::from_str::<JobStatus>("\"paused\"");
        assert!(err.is_err());
        let ok: JobStatus = serde_json::from_str("\"processing\"").unwrap();
        assert_eq!(ok, JobStatus::Processing);
    }
}
