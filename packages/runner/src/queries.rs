//! Read-side operations for the status endpoints.
//!
//! The HTTP layer in front of this crate is a thin external collaborator;
//! these functions are the whole of what it calls for reads.

use anyhow::Result;
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::store::{
    CrossRegionAnalysis, CrossRegionExecution, Execution, Job, RegionResult,
};

/// A job plus (optionally) its latest receipts.
#[derive(Debug, Serialize)]
pub struct JobView {
    pub job: Job,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executions: Option<Vec<Execution>>,
}

/// `GET /jobs/{id}?include=executions&exec_limit=N`
pub async fn get_job(
    pool: &PgPool,
    id: &str,
    include_executions: bool,
    exec_limit: i64,
) -> Result<Option<JobView>> {
    let Some(job) = Job::find_by_id(id, pool).await? else {
        return Ok(None);
    };

    let executions = if include_executions {
        Some(Execution::latest_for_job(id, exec_limit.max(1), pool).await?)
    } else {
        None
    };

    Ok(Some(JobView { job, executions }))
}

/// `GET /jobs/{id}/executions/all`
pub async fn list_executions(pool: &PgPool, job_id: &str) -> Result<Vec<Execution>> {
    Execution::find_by_job(job_id, pool).await
}

/// Region results and analysis for one cross-region execution.
#[derive(Debug, Serialize)]
pub struct CrossRegionView {
    pub execution: CrossRegionExecution,
    pub results: Vec<RegionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<CrossRegionAnalysis>,
}

/// `GET /executions/{cross_region_id}/cross-region`
pub async fn get_cross_region(pool: &PgPool, id: Uuid) -> Result<Option<CrossRegionView>> {
    let Some(execution) = CrossRegionExecution::find_by_id(id, pool).await? else {
        return Ok(None);
    };

    let results = RegionResult::list_for(id, pool).await?;
    let analysis = CrossRegionAnalysis::find_by_execution(id, pool).await?;

    Ok(Some(CrossRegionView {
        execution,
        results,
        analysis,
    }))
}
