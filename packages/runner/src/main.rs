//! Runner daemon: boots the publisher, the worker pool, and both sweepers,
//! then runs until ctrl-c.

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use runner_core::{Config, RunnerKernel, ServiceHost};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    let kernel = RunnerKernel::from_config(config).await?;

    info!(
        router = kernel.router.base_url(),
        queue = %kernel.config.jobs_queue_name,
        workers = kernel.config.worker_count,
        tracing = kernel.tracer.is_enabled(),
        "benchmark runner starting"
    );

    let mut host = ServiceHost::new()
        .with_service(kernel.publisher())
        .with_service(kernel.recovery_sweeper())
        .with_service(kernel.timeout_sweeper());
    for _ in 0..kernel.config.worker_count {
        host = host.with_service(kernel.job_runner());
    }

    host.run_until_shutdown().await
}
