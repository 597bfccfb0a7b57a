//! Dependency container and service wiring.
//!
//! The kernel owns the shared resources (pool, queue, router client,
//! tracer) and hands out configured component instances. There are no
//! singletons: everything is constructed here once and injected.

pub mod service_host;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::ConnectOptions;
use sqlx::PgPool;
use tokio::sync::Semaphore;

use router_client::RouterClient;

use crate::admission::AdmissionService;
use crate::config::Config;
use crate::publisher::OutboxPublisher;
use crate::queue::{from_queue_url, WorkQueue};
use crate::retry::{RetryConfig, RetryService};
use crate::runner::{JobRunner, RunnerConfig};
use crate::signing::{Ed25519Verifier, SignatureVerifier};
use crate::store::{OutboxEntry, MIGRATOR};
use crate::sweeper::{RecoverySweeper, TimeoutSweeper};
use crate::tracer::Tracer;

/// Buffered envelopes in the in-memory queue.
const QUEUE_CAPACITY: usize = 1024;

pub struct RunnerKernel {
    pub pool: PgPool,
    pub queue: Arc<dyn WorkQueue>,
    pub router: Arc<RouterClient>,
    pub tracer: Tracer,
    pub verifier: Arc<dyn SignatureVerifier>,
    pub config: Config,
    /// Shared across workers so the router cap is global.
    router_limit: Arc<Semaphore>,
}

impl RunnerKernel {
    /// Connect, migrate, and wire everything from config.
    pub async fn from_config(config: Config) -> Result<Self> {
        let mut connect_options: PgConnectOptions = config
            .database_url
            .parse()
            .context("DATABASE_URL is not a valid Postgres URL")?;
        if config.db_audit {
            connect_options = connect_options.log_statements(log::LevelFilter::Debug);
        }

        let pool = PgPoolOptions::new()
            .max_connections(20)
            .connect_with(connect_options)
            .await
            .context("failed to connect to Postgres")?;
        MIGRATOR.run(&pool).await.context("failed to run migrations")?;

        let queue = from_queue_url(&config.queue_url, QUEUE_CAPACITY)?;
        let router = Arc::new(
            RouterClient::new(config.router.clone())
                .context("failed to build router client")?,
        );

        Ok(Self::new(pool, queue, router, config))
    }

    /// Wire a kernel around already-constructed resources (tests).
    pub fn new(
        pool: PgPool,
        queue: Arc<dyn WorkQueue>,
        router: Arc<RouterClient>,
        config: Config,
    ) -> Self {
        let tracer = Tracer::new(pool.clone(), config.enable_db_tracing);
        let router_limit = Arc::new(Semaphore::new(config.router_concurrency));
        Self {
            pool,
            queue,
            router,
            tracer,
            verifier: Arc::new(Ed25519Verifier),
            config,
            router_limit,
        }
    }

    pub fn admission(&self) -> AdmissionService {
        AdmissionService::new(
            self.pool.clone(),
            self.config.jobs_queue_name.clone(),
            self.verifier.clone(),
        )
    }

    pub fn retry(&self) -> RetryService {
        RetryService::with_config(
            self.pool.clone(),
            self.router.clone(),
            RetryConfig {
                deadline: self.config.task_deadline,
                ..RetryConfig::default()
            },
        )
    }

    pub fn publisher(&self) -> OutboxPublisher {
        OutboxPublisher::new(self.pool.clone(), self.queue.clone())
    }

    pub fn job_runner(&self) -> JobRunner {
        JobRunner::new(
            self.pool.clone(),
            self.queue.clone(),
            self.router.clone(),
            self.verifier.clone(),
            self.tracer.clone(),
            self.router_limit.clone(),
            RunnerConfig {
                task_deadline: self.config.task_deadline,
                job_concurrency: self.config.job_concurrency,
                ..RunnerConfig::default()
            },
        )
    }

    pub fn recovery_sweeper(&self) -> RecoverySweeper {
        RecoverySweeper::new(
            self.pool.clone(),
            self.config.jobs_queue_name.clone(),
            self.config.stale_threshold,
            self.config.sweep_interval,
        )
    }

    pub fn timeout_sweeper(&self) -> TimeoutSweeper {
        TimeoutSweeper::new(
            self.pool.clone(),
            self.config.timeout_threshold,
            self.config.sweep_interval,
        )
    }

    /// Per-subsystem health snapshot for the status surface.
    pub async fn health(&self) -> HealthSnapshot {
        let database = match tokio::time::timeout(
            Duration::from_secs(5),
            sqlx::query("SELECT 1").execute(&self.pool),
        )
        .await
        {
            Ok(Ok(_)) => SubsystemHealth::ok(),
            Ok(Err(e)) => SubsystemHealth::error(format!("query failed: {e}")),
            Err(_) => SubsystemHealth::error("query timeout (>5s)".to_string()),
        };

        let outbox = match OutboxEntry::unpublished_count(&self.pool).await {
            Ok(backlog) => OutboxHealth {
                status: "ok".to_string(),
                backlog,
            },
            Err(e) => OutboxHealth {
                status: format!("error: {e}"),
                backlog: -1,
            },
        };

        let queue = QueueHealth {
            status: "ok".to_string(),
            depth: self.queue.depth(),
        };

        let healthy = database.status == "ok" && outbox.status == "ok";
        HealthSnapshot {
            status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
            database,
            queue,
            outbox,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthSnapshot {
    pub status: String,
    pub database: SubsystemHealth,
    pub queue: QueueHealth,
    pub outbox: OutboxHealth,
}

#[derive(Debug, Serialize)]
pub struct SubsystemHealth {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SubsystemHealth {
    fn ok() -> Self {
        Self {
            status: "ok".to_string(),
            error: None,
        }
    }

    fn error(message: String) -> Self {
        Self {
            status: "error".to_string(),
            error: Some(message),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct QueueHealth {
    pub status: String,
    pub depth: usize,
}

#[derive(Debug, Serialize)]
pub struct OutboxHealth {
    pub status: String,
    pub backlog: i64,
}
