//! Trace span rows. Append-only diagnostics; every write here is
//! best-effort and the tracer swallows its own errors.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct TraceSpan {
    pub span_id: Uuid,
    pub trace_id: Uuid,
    pub parent_span_id: Option<Uuid>,
    pub service: String,
    pub operation: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub status: String,
    pub job_id: Option<String>,
    pub execution_id: Option<i64>,
    pub model_id: Option<String>,
    pub region: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub error_type: Option<String>,
}

impl TraceSpan {
    pub async fn insert_started(
        span_id: Uuid,
        trace_id: Uuid,
        parent_span_id: Option<Uuid>,
        service: &str,
        operation: &str,
        metadata: Option<&serde_json::Value>,
        db: &PgPool,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO trace_spans
                (span_id, trace_id, parent_span_id, service, operation, metadata)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(span_id)
        .bind(trace_id)
        .bind(parent_span_id)
        .bind(service)
        .bind(operation)
        .bind(metadata)
        .execute(db)
        .await?;
        Ok(())
    }

    pub async fn set_execution_context(
        span_id: Uuid,
        job_id: &str,
        execution_id: Option<i64>,
        model_id: &str,
        region: &str,
        db: &PgPool,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE trace_spans
            SET job_id = $2, execution_id = $3, model_id = $4, region = $5
            WHERE span_id = $1
            "#,
        )
        .bind(span_id)
        .bind(job_id)
        .bind(execution_id)
        .bind(model_id)
        .bind(region)
        .execute(db)
        .await?;
        Ok(())
    }

    pub async fn complete(
        span_id: Uuid,
        status: &str,
        duration_ms: i64,
        error_message: Option<&str>,
        error_type: Option<&str>,
        db: &PgPool,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE trace_spans
            SET completed_at = NOW(),
                duration_ms = $2,
                status = $3,
                error_message = $4,
                error_type = $5
            WHERE span_id = $1
            "#,
        )
        .bind(span_id)
        .bind(duration_ms)
        .bind(status)
        .bind(error_message)
        .bind(error_type)
        .execute(db)
        .await?;
        Ok(())
    }

    /// Per-trace waterfall: every span of a trace in start order. Read-only
    /// diagnostic surface.
    pub async fn waterfall(trace_id: Uuid, db: &PgPool) -> Result<Vec<Self>> {
        let spans = sqlx::query_as::<_, Self>(
            r#"
            SELECT span_id, trace_id, parent_span_id, service, operation,
                   started_at, completed_at, duration_ms, status, job_id,
                   execution_id, model_id, region, metadata, error_message, error_type
            FROM trace_spans
            WHERE trace_id = $1
            ORDER BY started_at
            "#,
        )
        .bind(trace_id)
        .fetch_all(db)
        .await?;
        Ok(spans)
    }

    /// Total span rows; used by the tracer-non-interference tests.
    pub async fn count_all(db: &PgPool) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM trace_spans")
            .fetch_one(db)
            .await?;
        Ok(count)
    }

    /// Spans started but never completed; should be empty at end of test.
    pub async fn count_incomplete(db: &PgPool) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM trace_spans WHERE completed_at IS NULL",
        )
        .fetch_one(db)
        .await?;
        Ok(count)
    }
}
