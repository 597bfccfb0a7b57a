//! Long-running service plumbing.
//!
//! Each background component (publisher, workers, sweepers) implements
//! [`Service`]; the [`ServiceHost`] owns the shutdown token, spawns every
//! service, and cancels them together on ctrl-c or an explicit shutdown.

use anyhow::Result;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// A long-running background component.
#[async_trait::async_trait]
pub trait Service: Send {
    fn name(&self) -> &'static str;

    /// Run until the shutdown token fires. Implementations should return
    /// promptly once cancelled.
    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()>;
}

/// Owns and supervises a set of services.
#[derive(Default)]
pub struct ServiceHost {
    services: Vec<Box<dyn Service>>,
    shutdown: CancellationToken,
}

impl ServiceHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, service: impl Service + 'static) -> Self {
        self.services.push(Box::new(service));
        self
    }

    /// Token callers can use to stop the host programmatically (tests,
    /// embedding).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawn every service, then block until ctrl-c or cancellation, then
    /// wait for the services to drain.
    pub async fn run_until_shutdown(self) -> Result<()> {
        let mut tasks = JoinSet::new();

        for service in self.services {
            let name = service.name();
            let token = self.shutdown.clone();
            tasks.spawn(async move {
                info!(service = name, "service starting");
                if let Err(e) = service.run(token).await {
                    error!(service = name, error = %e, "service exited with error");
                } else {
                    info!(service = name, "service stopped");
                }
            });
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                self.shutdown.cancel();
            }
            _ = self.shutdown.cancelled() => {}
        }

        while tasks.join_next().await.is_some() {}
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct FlagService(Arc<AtomicBool>);

    #[async_trait::async_trait]
    impl Service for FlagService {
        fn name(&self) -> &'static str {
            "flag"
        }

        async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
            shutdown.cancelled().await;
            self.0.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn host_cancels_services_on_shutdown() {
        let flag = Arc::new(AtomicBool::new(false));
        let host = ServiceHost::new().with_service(FlagService(flag.clone()));
        let token = host.shutdown_token();

        let handle = tokio::spawn(host.run_until_shutdown());
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        token.cancel();
        handle.await.unwrap().unwrap();

        assert!(flag.load(Ordering::SeqCst));
    }
}
