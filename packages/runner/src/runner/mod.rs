//! Job runner: consumes envelopes, expands jobs into per-task inference
//! calls, records receipts, and drives jobs to their terminal status.
//!
//! Envelope redelivery is expected (the publisher is at-least-once), so the
//! runner never assumes first delivery: jobs outside `{created, queued}`
//! drop the envelope, and the per-task uniqueness constraint turns
//! re-dispatch into a skip.

pub mod bias;
pub mod prompts;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::join_all;
use futures::FutureExt;
use router_client::{InferenceRequest, RouterClient, RouterError};
use serde_json::json;
use sqlx::{PgConnection, PgPool};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::analysis::{analyze, RegionSlice};
use crate::error::{
    classify_router_error, FailureRecord, INTERNAL_PANIC, RECEIPT_SIGNATURE_INVALID,
    TASK_DEADLINE_EXCEEDED,
};
use crate::kernel::service_host::Service;
use crate::queue::{Envelope, WorkQueue};
use crate::signing::{verify_receipt, ReceiptError, SignatureVerifier};
use crate::spec::{JobSpec, UNKNOWN_REGION};
use crate::store::{
    CrossRegionAnalysis, CrossRegionExecution, Execution, ExecutionStatus, Job, JobStatus,
    RegionResult, RegionResultStatus, RegionRollup, TaskClaim,
};
use crate::tracer::{trace_id_from_request, Tracer};

// ============================================================================
// Work expansion
// ============================================================================

/// One unit of work: a single (region, model, question) inference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDescriptor {
    pub region: String,
    pub model_id: String,
    /// None for legacy no-question batches.
    pub question_id: Option<String>,
}

/// Expand a spec into its task set. A legacy single-region, no-question job
/// expands to exactly one task.
pub fn expand_tasks(spec: &JobSpec) -> Vec<TaskDescriptor> {
    let mut tasks = Vec::new();
    for region in spec.effective_regions() {
        for model in &spec.models {
            if spec.questions.is_empty() {
                tasks.push(TaskDescriptor {
                    region: region.clone(),
                    model_id: model.clone(),
                    question_id: None,
                });
            } else {
                for question in &spec.questions {
                    tasks.push(TaskDescriptor {
                        region: region.clone(),
                        model_id: model.clone(),
                        question_id: Some(question.clone()),
                    });
                }
            }
        }
    }
    tasks
}

/// Group tasks by (region, model), preserving spec order of questions
/// within each group. Groups run concurrently; questions inside one group
/// run sequentially.
pub fn group_tasks(tasks: Vec<TaskDescriptor>) -> Vec<Vec<TaskDescriptor>> {
    let mut groups: Vec<((String, String), Vec<TaskDescriptor>)> = Vec::new();
    for task in tasks {
        let key = (task.region.clone(), task.model_id.clone());
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, group)) => group.push(task),
            None => groups.push((key, vec![task])),
        }
    }
    groups.into_iter().map(|(_, group)| group).collect()
}

/// Terminal decision: a pure function of the task statuses and the spec's
/// success threshold. `None` while any task is outstanding.
///
/// The fraction is quoted to two decimals before the comparison: thresholds
/// like 0.67 mean "two of three", and 2/3 must not lose to its own decimal
/// expansion.
pub fn decide_outcome(
    statuses: &[ExecutionStatus],
    expected_tasks: usize,
    min_success_rate: f64,
) -> Option<JobStatus> {
    if statuses.len() < expected_tasks {
        return None;
    }
    if statuses.iter().any(|s| !s.is_terminal()) {
        return None;
    }
    let completed = statuses
        .iter()
        .filter(|s| **s == ExecutionStatus::Completed)
        .count();
    let fraction = completed as f64 / statuses.len() as f64;
    let quoted = (fraction * 100.0).round() / 100.0;
    if quoted >= min_success_rate {
        Some(JobStatus::Completed)
    } else {
        Some(JobStatus::Failed)
    }
}

// ============================================================================
// Runner
// ============================================================================

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Per-task inference deadline.
    pub task_deadline: Duration,
    /// Max in-flight tasks within one job.
    pub job_concurrency: usize,
    pub temperature: f64,
    pub max_tokens: u32,
    pub cost_priority: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            task_deadline: Duration::from_secs(300),
            job_concurrency: 8,
            temperature: 0.0,
            max_tokens: 1024,
            cost_priority: false,
        }
    }
}

pub struct JobRunner {
    pool: PgPool,
    queue: Arc<dyn WorkQueue>,
    router: Arc<RouterClient>,
    verifier: Arc<dyn SignatureVerifier>,
    tracer: Tracer,
    /// Shared across all workers so the cap is per-router, not per-worker.
    router_limit: Arc<Semaphore>,
    config: RunnerConfig,
}

/// What a finished task wants persisted.
struct TaskOutcome {
    status: ExecutionStatus,
    provider_id: Option<String>,
    /// Success payload, or extra context merged next to the failure doc.
    output: Option<serde_json::Value>,
    receipt: Option<serde_json::Value>,
    failure: Option<FailureRecord>,
    scoring: Option<serde_json::Value>,
}

impl JobRunner {
    pub fn new(
        pool: PgPool,
        queue: Arc<dyn WorkQueue>,
        router: Arc<RouterClient>,
        verifier: Arc<dyn SignatureVerifier>,
        tracer: Tracer,
        router_limit: Arc<Semaphore>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            pool,
            queue,
            router,
            verifier,
            tracer,
            router_limit,
            config,
        }
    }

    /// Process one envelope end to end. Individual task failures never
    /// abort the job; they are aggregated.
    pub async fn process_envelope(&self, envelope: Envelope) -> Result<()> {
        let Some(job) = Job::find_by_id(&envelope.id, &self.pool).await? else {
            warn!(job_id = %envelope.id, "envelope references missing job, dropping");
            return Ok(());
        };
        if !job.status.is_runnable() {
            debug!(job_id = %job.id, status = ?job.status, "job not runnable, dropping envelope");
            return Ok(());
        }
        if !Job::mark_processing(&job.id, &self.pool).await? {
            debug!(job_id = %job.id, "lost the processing claim, dropping envelope");
            return Ok(());
        }

        let spec = job.spec().context("stored job spec is undecodable")?;
        let trace_id = trace_id_from_request(&envelope.request_id);
        let span = self
            .tracer
            .start_span(
                trace_id,
                None,
                "runner",
                "job.process",
                Some(json!({ "attempt": envelope.attempt })),
            )
            .await;

        let cross_region = CrossRegionExecution::find_running_by_jobspec(&job.id, &self.pool).await?;
        let tasks = expand_tasks(&spec);
        let expected = tasks.len();
        info!(
            job_id = %job.id,
            tasks = expected,
            cross_region = cross_region.is_some(),
            "job expanded"
        );

        let job_limit = Arc::new(Semaphore::new(self.config.job_concurrency));
        let groups = group_tasks(tasks);

        join_all(groups.into_iter().map(|group| {
            let job_limit = job_limit.clone();
            let cross_region = cross_region.as_ref();
            let spec = &spec;
            async move {
                for task in group {
                    let Ok(_permit) = job_limit.acquire().await else {
                        break;
                    };
                    self.run_task(spec, &task, expected, cross_region, trace_id)
                        .await;
                }
            }
        }))
        .await;

        // Belt-and-braces evaluation after the fan-in; normally the last
        // task's transaction already settled the job.
        self.finalize_job(&spec, expected, cross_region.as_ref())
            .await?;

        self.tracer.complete_span(&span, "completed").await;
        Ok(())
    }

    async fn run_task(
        &self,
        spec: &JobSpec,
        task: &TaskDescriptor,
        expected: usize,
        cross_region: Option<&CrossRegionExecution>,
        trace_id: Uuid,
    ) {
        if let Err(e) = self
            .try_run_task(spec, task, expected, cross_region, trace_id)
            .await
        {
            error!(
                job_id = %spec.id,
                region = %task.region,
                model_id = %task.model_id,
                error = %e,
                "task execution failed to persist"
            );
        }
    }

    async fn try_run_task(
        &self,
        spec: &JobSpec,
        task: &TaskDescriptor,
        expected: usize,
        cross_region: Option<&CrossRegionExecution>,
        trace_id: Uuid,
    ) -> Result<()> {
        // 1. Claim the task slot. Terminal rows mean a previous delivery
        //    already settled this task.
        let execution = {
            let mut conn = self.pool.acquire().await?;
            match Execution::claim_task(
                &spec.id,
                &task.region,
                &task.model_id,
                task.question_id.as_deref(),
                &mut conn,
            )
            .await?
            {
                TaskClaim::AlreadyTerminal(existing) => {
                    debug!(
                        job_id = %spec.id,
                        execution_id = existing.id,
                        status = ?existing.status,
                        "task already terminal, skipping"
                    );
                    return Ok(());
                }
                TaskClaim::Fresh(execution) | TaskClaim::Resumed(execution) => execution,
            }
        };

        // 2. Cancellation check: abort dispatch if the job moved to a
        //    terminal state under us.
        if let Some(job) = Job::find_by_id(&spec.id, &self.pool).await? {
            if job.status.is_terminal() {
                let failure = FailureRecord::builder()
                    .stage("execution")
                    .component("job_runner")
                    .code("JOB_ALREADY_TERMINAL")
                    .error_type("cancelled")
                    .region(task.region.clone())
                    .message(format!("job reached {:?} before dispatch", job.status))
                    .transient(false)
                    .build();
                let mut conn = self.pool.acquire().await?;
                Execution::fail(
                    execution.id,
                    ExecutionStatus::Cancelled,
                    &failure,
                    None,
                    &mut conn,
                )
                .await?;
                return Ok(());
            }
        }

        // 3. Build and dispatch the inference request under the per-task
        //    deadline and the router concurrency cap.
        let prompt = match &task.question_id {
            Some(question) => prompts::resolve(question),
            None => spec.benchmark.name.clone(),
        };
        let request = InferenceRequest {
            model: task.model_id.clone(),
            prompt,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            region_preference: Some(task.region.clone()).filter(|r| r != UNKNOWN_REGION),
            cost_priority: self.config.cost_priority,
        };

        let span = self
            .tracer
            .start_span(
                trace_id,
                None,
                "runner",
                "task.inference",
                Some(json!({ "question_id": task.question_id })),
            )
            .await;
        self.tracer
            .set_execution_context(&span, &spec.id, Some(execution.id), &task.model_id, &task.region)
            .await;

        let trace_header = trace_id.to_string();
        let dispatch = async {
            let _permit = self.router_limit.acquire().await;
            self.router.run_inference(&request, Some(&trace_header)).await
        };
        let outcome = match tokio::time::timeout(self.config.task_deadline, dispatch).await {
            Err(_) => self.deadline_outcome(task),
            Ok(Err(err)) => self.router_failure_outcome(task, err),
            Ok(Ok(response)) => self.success_outcome(task, response),
        };

        match &outcome.failure {
            None => self.tracer.complete_span(&span, "completed").await,
            Some(failure) => {
                self.tracer
                    .complete_span_with_error(&span, &failure.message, &failure.error_type)
                    .await;
            }
        }

        // 4. Persist the terminal transition, the region result, and the
        //    aggregation decision in one transaction.
        let mut tx = self.pool.begin().await?;
        match &outcome.failure {
            None => {
                Execution::complete(
                    execution.id,
                    outcome.provider_id.as_deref(),
                    outcome.output.as_ref().unwrap_or(&serde_json::Value::Null),
                    outcome.receipt.as_ref(),
                    &mut tx,
                )
                .await?;
            }
            Some(failure) => {
                Execution::fail(
                    execution.id,
                    outcome.status,
                    failure,
                    outcome.output.as_ref(),
                    &mut tx,
                )
                .await?;
            }
        }

        if let Some(cre) = cross_region {
            let region_status = match outcome.status {
                ExecutionStatus::Completed => RegionResultStatus::Success,
                ExecutionStatus::Timeout => RegionResultStatus::Timeout,
                _ => RegionResultStatus::Failed,
            };
            RegionResult::upsert_terminal(
                cre.id,
                &task.region,
                outcome.provider_id.as_deref(),
                &task.model_id,
                task.question_id.as_deref(),
                region_status,
                outcome.output.as_ref(),
                outcome.failure.as_ref().map(|f| f.message.as_str()),
                outcome.scoring.as_ref(),
                &mut tx,
            )
            .await?;
        }

        self.evaluate_in_tx(&mut tx, spec, expected, cross_region)
            .await?;
        tx.commit().await?;

        Ok(())
    }

    fn deadline_outcome(&self, task: &TaskDescriptor) -> TaskOutcome {
        let failure = FailureRecord::builder()
            .stage("inference")
            .component("job_runner")
            .subcomponent("deadline".to_string())
            .code(TASK_DEADLINE_EXCEEDED)
            .error_type("timeout")
            .region(task.region.clone())
            .message(format!(
                "task exceeded its {}s deadline",
                self.config.task_deadline.as_secs()
            ))
            .transient(true)
            .build();
        TaskOutcome {
            status: ExecutionStatus::Timeout,
            provider_id: None,
            output: None,
            receipt: None,
            failure: Some(failure),
            scoring: None,
        }
    }

    fn router_failure_outcome(&self, task: &TaskDescriptor, err: RouterError) -> TaskOutcome {
        let status = if matches!(err, RouterError::Timeout { .. }) {
            ExecutionStatus::Timeout
        } else {
            ExecutionStatus::Failed
        };

        // Router-level rejections ride along so operators can see what the
        // router actually said.
        let (provider_id, output) = match &err {
            RouterError::Router { response, .. } => (
                response.provider_used.clone(),
                Some(json!({
                    "router_response": {
                        "response": response.response,
                        "provider_used": response.provider_used,
                        "inference_time": response.inference_time,
                        "metadata": response.metadata,
                    }
                })),
            ),
            RouterError::Http { metadata, .. } => {
                (None, Some(json!({ "router_metadata": metadata })))
            }
            _ => (None, None),
        };

        TaskOutcome {
            status,
            provider_id,
            output,
            receipt: None,
            failure: Some(classify_router_error(&err, &task.region)),
            scoring: None,
        }
    }

    fn success_outcome(
        &self,
        task: &TaskDescriptor,
        response: router_client::InferenceResponse,
    ) -> TaskOutcome {
        // Receipts arrive inside the router response metadata. Tampered
        // receipts fail the execution; an absent receipt is tolerated with
        // a warning.
        let receipt = response.metadata.get("receipt").cloned();
        if let Some(receipt_doc) = &receipt {
            match verify_receipt(self.verifier.as_ref(), receipt_doc) {
                Ok(()) => {}
                Err(ReceiptError::Unsigned) => {
                    warn!(
                        region = %task.region,
                        model_id = %task.model_id,
                        "router receipt carries no signature, storing response unverified"
                    );
                }
                Err(e) => {
                    let failure = FailureRecord::builder()
                        .stage("verification")
                        .component("job_runner")
                        .subcomponent("receipt".to_string())
                        .code(RECEIPT_SIGNATURE_INVALID)
                        .error_type("signature")
                        .region(task.region.clone())
                        .message(format!("receipt verification failed: {e}"))
                        .transient(false)
                        .build();
                    return TaskOutcome {
                        status: ExecutionStatus::Failed,
                        provider_id: response.provider_used.clone(),
                        output: None,
                        receipt: None,
                        failure: Some(failure),
                        scoring: None,
                    };
                }
            }
        } else {
            debug!(region = %task.region, "router response carried no receipt");
        }

        let scoring = bias::score_response(&response.response);
        let scoring_json = serde_json::to_value(&scoring).ok();
        let provider_id = response.provider_used.clone();
        let output = json!({
            "response": response.response,
            "bias_score": scoring.score,
            "refusal": scoring.refusal,
            "bias_markers": scoring.markers,
            "provider_used": response.provider_used,
            "inference_time": response.inference_time,
            "metadata": response.metadata,
        });

        TaskOutcome {
            status: ExecutionStatus::Completed,
            provider_id,
            output: Some(output),
            receipt,
            failure: None,
            scoring: scoring_json,
        }
    }

    /// Evaluate the job inside the caller's transaction: the terminal job
    /// transition, the cross-region rollup, and the analysis are observed
    /// together or not at all.
    async fn evaluate_in_tx(
        &self,
        conn: &mut PgConnection,
        spec: &JobSpec,
        expected: usize,
        cross_region: Option<&CrossRegionExecution>,
    ) -> Result<()> {
        let statuses = Execution::statuses_for_job(&spec.id, &mut *conn).await?;
        let outcome = decide_outcome(&statuses, expected, spec.min_success_rate());

        if let Some(cre) = cross_region {
            let results = RegionResult::find_by_execution(cre.id, &mut *conn).await?;
            let rollup = RegionRollup::from_results(&results);
            let terminal_status = outcome.map(|_| cre.terminal_status(rollup));
            CrossRegionExecution::update_rollup(cre.id, rollup, terminal_status, &mut *conn)
                .await?;

            if outcome.is_some() && cre.analysis_enabled {
                let slices: Vec<RegionSlice> =
                    results.iter().map(RegionSlice::from_result).collect();
                let report = analyze(&slices);
                CrossRegionAnalysis::upsert(
                    cre.id,
                    report.bias_variance,
                    report.censorship_rate,
                    report.factual_consistency,
                    report.narrative_divergence,
                    &serde_json::to_value(&report.key_differences)
                        .unwrap_or_else(|_| json!([])),
                    report.risk_level.as_str(),
                    &report.summary,
                    &report.recommendation,
                    &mut *conn,
                )
                .await?;
            }
        }

        if let Some(status) = outcome {
            if Job::finish_processing(&spec.id, status, &mut *conn).await? {
                info!(job_id = %spec.id, status = ?status, "job reached terminal state");
            }
        }

        Ok(())
    }

    async fn finalize_job(
        &self,
        spec: &JobSpec,
        expected: usize,
        cross_region: Option<&CrossRegionExecution>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        self.evaluate_in_tx(&mut tx, spec, expected, cross_region)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// A panic escaped a worker task: capture it as a failure record so the
    /// job does not dangle, then let the worker loop continue.
    async fn record_panic(&self, job_id: &str, message: &str) {
        let failure = FailureRecord::builder()
            .stage("execution")
            .component("job_runner")
            .code(INTERNAL_PANIC)
            .error_type("panic")
            .message(message.to_string())
            .transient(false)
            .build();

        let result: Result<()> = async {
            let mut tx = self.pool.begin().await?;
            Execution::fail_open_tasks(job_id, ExecutionStatus::Failed, &failure, &mut tx).await?;
            Job::finish_processing(job_id, JobStatus::Failed, &mut tx).await?;
            tx.commit().await?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            error!(job_id = %job_id, error = %e, "failed to record worker panic");
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

#[async_trait::async_trait]
impl Service for JobRunner {
    fn name(&self) -> &'static str {
        "job-runner"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        let runner = Arc::new(*self);
        let mut inflight: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                envelope = runner.queue.pop() => {
                    let Some(envelope) = envelope else { break };
                    let worker = runner.clone();
                    inflight.spawn(async move {
                        let job_id = envelope.id.clone();
                        let result = std::panic::AssertUnwindSafe(worker.process_envelope(envelope))
                            .catch_unwind()
                            .await;
                        match result {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                error!(job_id = %job_id, error = %e, "envelope processing failed");
                            }
                            Err(panic) => {
                                let message = panic_message(panic.as_ref());
                                error!(job_id = %job_id, panic = %message, "worker panicked");
                                worker.record_panic(&job_id, &message).await;
                            }
                        }
                    });
                }
                Some(_) = inflight.join_next(), if !inflight.is_empty() => {}
            }
        }

        // Drain in-flight envelopes before stopping.
        while inflight.join_next().await.is_some() {}
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(regions: &[&str], models: &[&str], questions: &[&str]) -> JobSpec {
        serde_json::from_value(json!({
            "id": "job-1",
            "benchmark": {"name": "bias-detection"},
            "constraints": {"regions": regions},
            "questions": questions,
            "models": models,
            "created_at": "2026-01-01T00:00:00Z"
        }))
        .unwrap()
    }

    #[test]
    fn expansion_is_the_region_model_question_product() {
        let tasks = expand_tasks(&spec(
            &["US", "EU"],
            &["llama3.2-1b", "mistral-7b"],
            &["q1", "q2", "q3"],
        ));
        assert_eq!(tasks.len(), 12);
    }

    #[test]
    fn legacy_job_expands_to_one_task() {
        let tasks = expand_tasks(&spec(&[], &["llama3.2-1b"], &[]));
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].region, "unknown");
        assert_eq!(tasks[0].question_id, None);
    }

    #[test]
    fn groups_preserve_question_order() {
        let tasks = expand_tasks(&spec(&["US", "EU"], &["llama3.2-1b"], &["q1", "q2"]));
        let groups = group_tasks(tasks);
        assert_eq!(groups.len(), 2);
        for group in &groups {
            let questions: Vec<_> = group
                .iter()
                .map(|t| t.question_id.clone().unwrap())
                .collect();
            assert_eq!(questions, vec!["q1".to_string(), "q2".to_string()]);
        }
    }

    #[test]
    fn outcome_is_none_while_tasks_are_outstanding() {
        use ExecutionStatus::*;
        assert_eq!(decide_outcome(&[Completed, Running], 2, 0.67), None);
        // Rows not yet inserted also block the decision.
        assert_eq!(decide_outcome(&[Completed], 2, 0.67), None);
    }

    #[test]
    fn outcome_respects_min_success_rate() {
        use ExecutionStatus::*;
        // 2/3 ≥ 0.67 → completed
        assert_eq!(
            decide_outcome(&[Completed, Completed, Failed], 3, 0.67),
            Some(JobStatus::Completed)
        );
        // 1/3 < 0.67 → failed
        assert_eq!(
            decide_outcome(&[Completed, Failed, Timeout], 3, 0.67),
            Some(JobStatus::Failed)
        );
        // Cancellations count against the fraction.
        assert_eq!(
            decide_outcome(&[Cancelled, Cancelled], 2, 0.5),
            Some(JobStatus::Failed)
        );
        // A stricter threshold flips the same inputs.
        assert_eq!(
            decide_outcome(&[Completed, Completed, Failed], 3, 1.0),
            Some(JobStatus::Failed)
        );
    }

    #[test]
    fn panic_messages_are_extracted() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom".to_string());
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(42u32);
        assert_eq!(panic_message(boxed.as_ref()), "worker panicked");
    }
}
