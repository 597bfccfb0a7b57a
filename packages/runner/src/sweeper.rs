//! Recovery and timeout sweepers.
//!
//! Both run once at startup and on an interval afterwards. A failure on one
//! row is logged and never stalls the rest of the sweep. Thresholds are
//! compared with typed interval parameters, never string-built SQL.

use std::time::Duration;

use anyhow::Result;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{FailureRecord, JOB_TIMEOUT};
use crate::kernel::service_host::Service;
use crate::queue::Envelope;
use crate::store::{
    pg_interval, CrossRegionExecution, CrossRegionStatus, Execution, ExecutionStatus, Job,
    OutboxEntry, RegionResult, RegionRollup,
};

// ============================================================================
// Recovery sweeper
// ============================================================================

/// Resets stale `processing` jobs back to `created` and re-enqueues an
/// outbox row for each, so a crashed worker's jobs are re-delivered without
/// operator action.
pub struct RecoverySweeper {
    pool: PgPool,
    queue_topic: String,
    stale_threshold: Duration,
    interval: Duration,
}

impl RecoverySweeper {
    pub fn new(
        pool: PgPool,
        queue_topic: String,
        stale_threshold: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            pool,
            queue_topic,
            stale_threshold,
            interval,
        }
    }

    /// One pass. Returns the number of jobs recovered.
    pub async fn sweep(&self) -> Result<usize> {
        let stale = Job::find_stale_processing(pg_interval(self.stale_threshold), &self.pool).await?;
        let mut recovered = 0usize;

        for job in stale {
            match self.recover(&job.id).await {
                Ok(true) => {
                    info!(job_id = %job.id, "stale job reset to created and re-enqueued");
                    recovered += 1;
                }
                Ok(false) => {}
                Err(e) => warn!(job_id = %job.id, error = %e, "failed to recover stale job"),
            }
        }

        Ok(recovered)
    }

    /// Reset one job and insert a fresh outbox envelope in the same
    /// transaction. Re-checks staleness under the transaction so a job that
    /// progressed meanwhile is left alone.
    async fn recover(&self, job_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        if !Job::reset_stale(job_id, pg_interval(self.stale_threshold), &mut tx).await? {
            return Ok(false);
        }

        let attempt = OutboxEntry::attempts_for_job(job_id, &mut tx).await?;
        let envelope = Envelope::fresh(job_id, attempt as i32);
        let payload = serde_json::to_value(&envelope)?;
        OutboxEntry::insert(&self.queue_topic, &payload, &mut tx).await?;

        tx.commit().await?;
        Ok(true)
    }
}

#[async_trait::async_trait]
impl Service for RecoverySweeper {
    fn name(&self) -> &'static str {
        "recovery-sweeper"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        // Startup pass first: recover anything a previous process dropped.
        if let Err(e) = self.sweep().await {
            error!(error = %e, "recovery sweep failed");
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
            if let Err(e) = self.sweep().await {
                error!(error = %e, "recovery sweep failed");
            }
        }
        Ok(())
    }
}

// ============================================================================
// Timeout sweeper
// ============================================================================

/// Fails `processing` jobs older than the operator-set threshold, writing a
/// timeout failure record that names this sweeper as the reporter.
pub struct TimeoutSweeper {
    pool: PgPool,
    timeout_threshold: Duration,
    interval: Duration,
}

impl TimeoutSweeper {
    pub fn new(pool: PgPool, timeout_threshold: Duration, interval: Duration) -> Self {
        Self {
            pool,
            timeout_threshold,
            interval,
        }
    }

    /// One pass. Returns the number of jobs failed.
    pub async fn sweep(&self) -> Result<usize> {
        let stuck =
            Job::find_stale_processing(pg_interval(self.timeout_threshold), &self.pool).await?;
        let mut failed = 0usize;

        for job in stuck {
            match self.fail_job(&job.id).await {
                Ok(true) => failed += 1,
                Ok(false) => {}
                Err(e) => warn!(job_id = %job.id, error = %e, "failed to time out stuck job"),
            }
        }

        Ok(failed)
    }

    async fn fail_job(&self, job_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let Some(stuck_for) =
            Job::fail_timed_out(job_id, pg_interval(self.timeout_threshold), &mut tx).await?
        else {
            return Ok(false);
        };

        let failure = FailureRecord::builder()
            .stage("sweep")
            .component("timeout_sweeper")
            .code(JOB_TIMEOUT)
            .error_type("timeout")
            .message(format!(
                "job exceeded the {}s processing threshold",
                self.timeout_threshold.as_secs()
            ))
            .transient(false)
            .build();

        let touched =
            Execution::fail_open_tasks(job_id, ExecutionStatus::Timeout, &failure, &mut tx).await?;
        if touched == 0 {
            Execution::insert_failure_placeholder(
                job_id,
                ExecutionStatus::Timeout,
                &failure,
                &mut tx,
            )
            .await?;
        }

        // Settle any open cross-region record so readers never see a failed
        // job with a running cross-region execution.
        if let Some(cre) = CrossRegionExecution::find_running_by_jobspec(job_id, &self.pool).await? {
            let results = RegionResult::find_by_execution(cre.id, &mut tx).await?;
            let rollup = RegionRollup::from_results(&results);
            let status = if rollup.success_count >= cre.min_regions_required {
                CrossRegionStatus::Partial
            } else {
                CrossRegionStatus::Failed
            };
            CrossRegionExecution::update_rollup(cre.id, rollup, Some(status), &mut tx).await?;
        }

        tx.commit().await?;

        info!(
            job_id = %job_id,
            stuck_secs = stuck_for.as_secs(),
            "job failed by timeout sweeper"
        );
        Ok(true)
    }
}

#[async_trait::async_trait]
impl Service for TimeoutSweeper {
    fn name(&self) -> &'static str {
        "timeout-sweeper"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
            if let Err(e) = self.sweep().await {
                error!(error = %e, "timeout sweep failed");
            }
        }
        Ok(())
    }
}
