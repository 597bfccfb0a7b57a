//! Cross-region executions, their per-region results, and the stored
//! comparison analyses.
//!
//! The cross-region path writes both these tables and the flat `executions`
//! table, so the per-job and per-region query endpoints resolve
//! consistently.

use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection, PgPool};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "cross_region_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CrossRegionStatus {
    #[default]
    Running,
    Completed,
    Partial,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "region_result_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RegionResultStatus {
    #[default]
    Running,
    Success,
    Failed,
    Timeout,
}

impl RegionResultStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RegionResultStatus::Running)
    }
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct CrossRegionExecution {
    pub id: Uuid,
    pub jobspec_id: String,
    pub total_regions: i32,
    pub success_count: i32,
    pub failure_count: i32,
    pub min_regions_required: i32,
    pub min_success_rate: f64,
    pub analysis_enabled: bool,
    pub status: CrossRegionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct RegionResult {
    pub id: Uuid,
    pub cross_region_execution_id: Uuid,
    pub region: String,
    pub provider_id: Option<String>,
    pub model_id: Option<String>,
    pub question_id: Option<String>,
    pub status: RegionResultStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub execution_output: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub scoring: Option<serde_json::Value>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct CrossRegionAnalysis {
    pub id: Uuid,
    pub cross_region_execution_id: Uuid,
    pub bias_variance: f64,
    pub censorship_rate: f64,
    pub factual_consistency: f64,
    pub narrative_divergence: f64,
    pub key_differences: serde_json::Value,
    pub risk_level: String,
    pub summary: String,
    pub recommendation: String,
    pub created_at: DateTime<Utc>,
}

/// Per-region rollup computed from region results. A region counts as a
/// success once any of its tasks succeeded; as a failure once all its tasks
/// are terminal and none succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegionRollup {
    pub success_count: i32,
    pub failure_count: i32,
    pub open_count: i32,
}

impl CrossRegionExecution {
    /// Insert at admission time, inside the admission transaction.
    pub async fn insert(
        jobspec_id: &str,
        total_regions: i32,
        min_regions_required: i32,
        min_success_rate: f64,
        analysis_enabled: bool,
        conn: &mut PgConnection,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO cross_region_executions
                (id, jobspec_id, total_regions, min_regions_required,
                 min_success_rate, analysis_enabled)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, jobspec_id, total_regions, success_count, failure_count,
                      min_regions_required, min_success_rate, analysis_enabled,
                      status, started_at, completed_at, duration_ms
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(jobspec_id)
        .bind(total_regions)
        .bind(min_regions_required)
        .bind(min_success_rate)
        .bind(analysis_enabled)
        .fetch_one(&mut *conn)
        .await
    }

    pub async fn find_by_id(id: Uuid, db: &PgPool) -> Result<Option<Self>> {
        let execution = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, jobspec_id, total_regions, success_count, failure_count,
                   min_regions_required, min_success_rate, analysis_enabled,
                   status, started_at, completed_at, duration_ms
            FROM cross_region_executions
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(db)
        .await?;

        Ok(execution)
    }

    /// The open cross-region record for a job, if any.
    pub async fn find_running_by_jobspec(
        jobspec_id: &str,
        db: &PgPool,
    ) -> Result<Option<Self>> {
        let execution = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, jobspec_id, total_regions, success_count, failure_count,
                   min_regions_required, min_success_rate, analysis_enabled,
                   status, started_at, completed_at, duration_ms
            FROM cross_region_executions
            WHERE jobspec_id = $1 AND status = 'running'
            ORDER BY started_at DESC
            LIMIT 1
            "#,
        )
        .bind(jobspec_id)
        .fetch_optional(db)
        .await?;

        Ok(execution)
    }

    /// Refresh the counters; when `terminal` is set, also stamp the final
    /// status, `completed_at`, and `duration_ms`. Runs inside the caller's
    /// transaction so the job transition and this update are observed
    /// together.
    pub async fn update_rollup(
        id: Uuid,
        rollup: RegionRollup,
        terminal: Option<CrossRegionStatus>,
        conn: &mut PgConnection,
    ) -> Result<(), sqlx::Error> {
        match terminal {
            Some(status) => {
                sqlx::query(
                    r#"
                    UPDATE cross_region_executions
                    SET success_count = $2,
                        failure_count = $3,
                        status = $4,
                        completed_at = NOW(),
                        duration_ms = (EXTRACT(EPOCH FROM NOW() - started_at) * 1000)::BIGINT
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(rollup.success_count)
                .bind(rollup.failure_count)
                .bind(status)
                .execute(&mut *conn)
                .await?;
            }
            None => {
                sqlx::query(
                    r#"
                    UPDATE cross_region_executions
                    SET success_count = $2, failure_count = $3
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(rollup.success_count)
                .bind(rollup.failure_count)
                .execute(&mut *conn)
                .await?;
            }
        }
        Ok(())
    }

    /// Terminal status given a finished rollup.
    pub fn terminal_status(&self, rollup: RegionRollup) -> CrossRegionStatus {
        if rollup.failure_count == 0 {
            CrossRegionStatus::Completed
        } else if rollup.success_count >= self.min_regions_required {
            CrossRegionStatus::Partial
        } else {
            CrossRegionStatus::Failed
        }
    }
}

impl RegionRollup {
    /// Group region results by region and count outcomes.
    pub fn from_results(results: &[RegionResult]) -> Self {
        let mut by_region: HashMap<&str, Vec<RegionResultStatus>> = HashMap::new();
        for result in results {
            by_region.entry(result.region.as_str()).or_default().push(result.status);
        }

        let mut rollup = RegionRollup::default();
        for statuses in by_region.values() {
            if statuses.iter().any(|s| *s == RegionResultStatus::Success) {
                rollup.success_count += 1;
            } else if statuses.iter().all(|s| s.is_terminal()) {
                rollup.failure_count += 1;
            } else {
                rollup.open_count += 1;
            }
        }
        rollup
    }
}

impl RegionResult {
    /// Record a task's terminal outcome under its cross-region execution.
    /// Idempotent on `(execution, region, model, question)`.
    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_terminal(
        cross_region_execution_id: Uuid,
        region: &str,
        provider_id: Option<&str>,
        model_id: &str,
        question_id: Option<&str>,
        status: RegionResultStatus,
        execution_output: Option<&serde_json::Value>,
        error_message: Option<&str>,
        scoring: Option<&serde_json::Value>,
        conn: &mut PgConnection,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO region_results
                (id, cross_region_execution_id, region, provider_id, model_id,
                 question_id, status, completed_at, duration_ms,
                 execution_output, error_message, scoring)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW(), NULL, $8, $9, $10)
            ON CONFLICT (cross_region_execution_id, region, model_id, question_id)
            DO UPDATE SET
                provider_id = EXCLUDED.provider_id,
                status = EXCLUDED.status,
                completed_at = NOW(),
                duration_ms =
                    (EXTRACT(EPOCH FROM NOW() - region_results.started_at) * 1000)::BIGINT,
                execution_output = EXCLUDED.execution_output,
                error_message = EXCLUDED.error_message,
                scoring = EXCLUDED.scoring
            RETURNING id, cross_region_execution_id, region, provider_id, model_id,
                      question_id, status, started_at, completed_at, duration_ms,
                      execution_output, error_message, scoring, metadata
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(cross_region_execution_id)
        .bind(region)
        .bind(provider_id)
        .bind(model_id)
        .bind(question_id)
        .bind(status)
        .bind(execution_output)
        .bind(error_message)
        .bind(scoring)
        .fetch_one(&mut *conn)
        .await
    }

    /// All results of a cross-region execution, inside the caller's
    /// transaction.
    pub async fn find_by_execution(
        cross_region_execution_id: Uuid,
        conn: &mut PgConnection,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT id, cross_region_execution_id, region, provider_id, model_id,
                   question_id, status, started_at, completed_at, duration_ms,
                   execution_output, error_message, scoring, metadata
            FROM region_results
            WHERE cross_region_execution_id = $1
            ORDER BY region, started_at
            "#,
        )
        .bind(cross_region_execution_id)
        .fetch_all(&mut *conn)
        .await
    }

    /// Pool-side variant for the query endpoints.
    pub async fn list_for(cross_region_execution_id: Uuid, db: &PgPool) -> Result<Vec<Self>> {
        let results = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, cross_region_execution_id, region, provider_id, model_id,
                   question_id, status, started_at, completed_at, duration_ms,
                   execution_output, error_message, scoring, metadata
            FROM region_results
            WHERE cross_region_execution_id = $1
            ORDER BY region, started_at
            "#,
        )
        .bind(cross_region_execution_id)
        .fetch_all(db)
        .await?;

        Ok(results)
    }
}

impl CrossRegionAnalysis {
    /// Write (or rewrite) the analysis row for an execution, inside the
    /// caller's transaction.
    #[allow(clippy::too_many_arguments)]
    pub async fn upsert(
        cross_region_execution_id: Uuid,
        bias_variance: f64,
        censorship_rate: f64,
        factual_consistency: f64,
        narrative_divergence: f64,
        key_differences: &serde_json::Value,
        risk_level: &str,
        summary: &str,
        recommendation: &str,
        conn: &mut PgConnection,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO cross_region_analyses
                (id, cross_region_execution_id, bias_variance, censorship_rate,
                 factual_consistency, narrative_divergence, key_differences,
                 risk_level, summary, recommendation)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (cross_region_execution_id) DO UPDATE SET
                bias_variance = EXCLUDED.bias_variance,
                censorship_rate = EXCLUDED.censorship_rate,
                factual_consistency = EXCLUDED.factual_consistency,
                narrative_divergence = EXCLUDED.narrative_divergence,
                key_differences = EXCLUDED.key_differences,
                risk_level = EXCLUDED.risk_level,
                summary = EXCLUDED.summary,
                recommendation = EXCLUDED.recommendation
            RETURNING id, cross_region_execution_id, bias_variance, censorship_rate,
                      factual_consistency, narrative_divergence, key_differences,
                      risk_level, summary, recommendation, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(cross_region_execution_id)
        .bind(bias_variance)
        .bind(censorship_rate)
        .bind(factual_consistency)
        .bind(narrative_divergence)
        .bind(key_differences)
        .bind(risk_level)
        .bind(summary)
        .bind(recommendation)
        .fetch_one(&mut *conn)
        .await
    }

    pub async fn find_by_execution(
        cross_region_execution_id: Uuid,
        db: &PgPool,
    ) -> Result<Option<Self>> {
        let analysis = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, cross_region_execution_id, bias_variance, censorship_rate,
                   factual_consistency, narrative_divergence, key_differences,
                   risk_level, summary, recommendation, created_at
            FROM cross_region_analyses
            WHERE cross_region_execution_id = $1
            "#,
        )
        .bind(cross_region_execution_id)
        .fetch_optional(db)
        .await?;

        Ok(analysis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(region: &str, status: RegionResultStatus) -> RegionResult {
        RegionResult {
            id: Uuid::new_v4(),
            cross_region_execution_id: Uuid::new_v4(),
            region: region.to_string(),
            provider_id: None,
            model_id: Some("llama3.2-1b".to_string()),
            question_id: Some("tiananmen_neutral".to_string()),
            status,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            execution_output: None,
            error_message: None,
            scoring: None,
            metadata: None,
        }
    }

    #[test]
    fn rollup_counts_distinct_regions() {
        let results = vec![
            result("US", RegionResultStatus::Success),
            result("EU", RegionResultStatus::Success),
            result("ASIA", RegionResultStatus::Failed),
        ];
        let rollup = RegionRollup::from_results(&results);
        assert_eq!(rollup.success_count, 2);
        assert_eq!(rollup.failure_count, 1);
        assert_eq!(rollup.open_count, 0);
    }

    #[test]
    fn region_with_any_success_counts_as_success() {
        let results = vec![
            result("US", RegionResultStatus::Failed),
            result("US", RegionResultStatus::Success),
        ];
        let rollup = RegionRollup::from_results(&results);
        assert_eq!(rollup.success_count, 1);
        assert_eq!(rollup.failure_count, 0);
    }

    #[test]
    fn region_with_open_tasks_is_neither() {
        let results = vec![
            result("US", RegionResultStatus::Failed),
            result("US", RegionResultStatus::Running),
        ];
        let rollup = RegionRollup::from_results(&results);
        assert_eq!(rollup.success_count, 0);
        assert_eq!(rollup.failure_count, 0);
        assert_eq!(rollup.open_count, 1);
    }

    #[test]
    fn terminal_status_reflects_min_regions() {
        let execution = CrossRegionExecution {
            id: Uuid::new_v4(),
            jobspec_id: "bd-2".to_string(),
            total_regions: 3,
            success_count: 0,
            failure_count: 0,
            min_regions_required: 2,
            min_success_rate: 0.67,
            analysis_enabled: true,
            status: CrossRegionStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
        };

        let all_good = RegionRollup { success_count: 3, failure_count: 0, open_count: 0 };
        assert_eq!(execution.terminal_status(all_good), CrossRegionStatus::Completed);

        let partial = RegionRollup { success_count: 2, failure_count: 1, open_count: 0 };
        assert_eq!(execution.terminal_status(partial), CrossRegionStatus::Partial);

        let failed = RegionRollup { success_count: 1, failure_count: 2, open_count: 0 };
        assert_eq!(execution.terminal_status(failed), CrossRegionStatus::Failed);
    }
}
