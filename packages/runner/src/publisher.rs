//! Outbox publisher: claims unpublished rows and hands envelopes to the
//! work queue.
//!
//! The push and the `published_at` mark commit in one transaction, so a
//! crash between them simply leaves the rows claimable and the queue sees
//! the envelope again (at-least-once; the runner's per-task uniqueness
//! absorbs the duplicate). A push failure rolls the whole batch back and
//! backs off exponentially. Rows whose payloads cannot be decoded are
//! poison: after enough consecutive failures they are dead-lettered and
//! never re-pushed.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::kernel::service_host::Service;
use crate::queue::{Envelope, WorkQueue};
use crate::store::OutboxEntry;

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Poll interval between claim attempts.
    pub tick: Duration,
    /// Max rows claimed per transaction.
    pub batch_size: i64,
    /// Ceiling for the failure backoff.
    pub max_backoff: Duration,
    /// Consecutive decode failures before a row is dead-lettered.
    pub dead_letter_after: i32,
    /// How long published rows are kept before cleanup.
    pub retention: Duration,
    /// How often the cleanup pass runs.
    pub cleanup_interval: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(500),
            batch_size: 50,
            max_backoff: Duration::from_secs(30),
            dead_letter_after: 5,
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            cleanup_interval: Duration::from_secs(60 * 60),
        }
    }
}

pub struct OutboxPublisher {
    pool: PgPool,
    queue: Arc<dyn WorkQueue>,
    config: PublisherConfig,
}

impl OutboxPublisher {
    pub fn new(pool: PgPool, queue: Arc<dyn WorkQueue>) -> Self {
        Self::with_config(pool, queue, PublisherConfig::default())
    }

    pub fn with_config(pool: PgPool, queue: Arc<dyn WorkQueue>, config: PublisherConfig) -> Self {
        Self { pool, queue, config }
    }

    /// Claim a batch, push every decodable envelope, and mark the pushed
    /// rows published, all in one transaction. Returns the number published.
    ///
    /// Poison rows are recorded outside the claim transaction so their
    /// attempt counters survive the batch outcome.
    pub async fn publish_batch(&self) -> Result<usize> {
        let mut poison: Vec<i64> = Vec::new();

        let published = {
            let mut tx = self.pool.begin().await.context("begin claim transaction")?;
            let entries = OutboxEntry::claim_batch(self.config.batch_size, &mut tx)
                .await
                .context("claim outbox batch")?;

            if entries.is_empty() {
                return Ok(0);
            }

            let mut pushed: Vec<i64> = Vec::with_capacity(entries.len());
            for entry in &entries {
                let envelope: Envelope = match serde_json::from_value(entry.payload.clone()) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!(
                            outbox_id = entry.id,
                            error = %e,
                            "undecodable outbox payload, recording poison"
                        );
                        poison.push(entry.id);
                        continue;
                    }
                };

                // Queue down or full: roll the batch back so every claimed
                // row (including ones already pushed this batch) is
                // re-claimable. Redelivery is safe downstream.
                self.queue
                    .push(envelope)
                    .await
                    .with_context(|| format!("push outbox row {}", entry.id))?;
                pushed.push(entry.id);
            }

            OutboxEntry::mark_published(&pushed, &mut tx)
                .await
                .context("mark outbox rows published")?;
            tx.commit().await.context("commit claim transaction")?;
            pushed.len()
        };

        for id in poison {
            match OutboxEntry::record_poison(id, self.config.dead_letter_after, &self.pool).await {
                Ok(true) => error!(outbox_id = id, "outbox row dead-lettered"),
                Ok(false) => {}
                Err(e) => warn!(outbox_id = id, error = %e, "failed to record poison row"),
            }
        }

        Ok(published)
    }
}

#[async_trait::async_trait]
impl Service for OutboxPublisher {
    fn name(&self) -> &'static str {
        "outbox-publisher"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        let mut backoff = self.config.tick;
        let mut last_cleanup = tokio::time::Instant::now();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }

            match self.publish_batch().await {
                Ok(count) => {
                    if count > 0 {
                        debug!(count = count, "published outbox batch");
                    }
                    backoff = self.config.tick;
                }
                Err(e) => {
                    warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "publish failed, backing off");
                    backoff = (backoff * 2).min(self.config.max_backoff);
                }
            }

            if last_cleanup.elapsed() >= self.config.cleanup_interval {
                last_cleanup = tokio::time::Instant::now();
                let cutoff = chrono::Utc::now()
                    - chrono::Duration::from_std(self.config.retention)
                        .unwrap_or_else(|_| chrono::Duration::days(7));
                match OutboxEntry::cleanup_published(cutoff, &self.pool).await {
                    Ok(0) => {}
                    Ok(deleted) => debug!(deleted = deleted, "cleaned up published outbox rows"),
                    Err(e) => warn!(error = %e, "outbox cleanup failed"),
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_bounded() {
        let config = PublisherConfig::default();
        let mut backoff = config.tick;
        for _ in 0..20 {
            backoff = (backoff * 2).min(config.max_backoff);
        }
        assert_eq!(backoff, config.max_backoff);
    }

    #[test]
    fn config_defaults() {
        let config = PublisherConfig::default();
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.dead_letter_after, 5);
        assert!(config.tick >= Duration::from_millis(250));
        assert!(config.tick <= Duration::from_millis(1000));
    }
}
