//! Work queue carrying job envelopes from the outbox publisher to the
//! runner workers.
//!
//! The envelope is the only inter-component message in the system; it is
//! deliberately minimal so redelivery is cheap and consumers treat each one
//! as independent. Delivery is at-least-once: the per-task uniqueness
//! constraint downstream makes duplicates harmless.

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

/// The wire message between outbox and workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Job ID.
    pub id: String,
    pub enqueued_at: DateTime<Utc>,
    /// 0 for the admission-time envelope; incremented on recovery re-enqueue.
    pub attempt: i32,
    pub request_id: String,
}

impl Envelope {
    pub fn new(id: impl Into<String>, attempt: i32, request_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            enqueued_at: Utc::now(),
            attempt,
            request_id: request_id.into(),
        }
    }

    /// Fresh envelope with a generated request ID.
    pub fn fresh(id: impl Into<String>, attempt: i32) -> Self {
        Self::new(id, attempt, Uuid::new_v4().to_string())
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    /// Backpressure; the publisher leaves the outbox row claimable and
    /// retries later.
    #[error("queue is full")]
    Full,
    #[error("queue is closed")]
    Closed,
}

/// FIFO-ish queue of job envelopes.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn push(&self, envelope: Envelope) -> Result<(), QueueError>;

    /// Receive the next envelope. `None` once the queue is closed and
    /// drained.
    async fn pop(&self) -> Option<Envelope>;

    /// Approximate number of buffered envelopes.
    fn depth(&self) -> usize;
}

/// Bounded in-process queue backed by a tokio channel.
pub struct InMemoryQueue {
    tx: mpsc::Sender<Envelope>,
    rx: Mutex<mpsc::Receiver<Envelope>>,
}

impl InMemoryQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }
}

#[async_trait]
impl WorkQueue for InMemoryQueue {
    async fn push(&self, envelope: Envelope) -> Result<(), QueueError> {
        self.tx.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => QueueError::Full,
            mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
        })
    }

    async fn pop(&self) -> Option<Envelope> {
        self.rx.lock().await.recv().await
    }

    fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

/// Build the queue backend named by `QUEUE_URL`. Only the in-process
/// `memory:` backend ships in this repo.
pub fn from_queue_url(queue_url: &str, capacity: usize) -> Result<Arc<dyn WorkQueue>> {
    let scheme = queue_url.split(':').next().unwrap_or_default();
    match scheme {
        "memory" => Ok(Arc::new(InMemoryQueue::new(capacity))),
        other => bail!("unsupported queue backend {other:?} in QUEUE_URL"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_through_json() {
        let envelope = Envelope::new("bd-2", 0, "req-1");
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["id"], "bd-2");
        assert_eq!(json["attempt"], 0);
        let back: Envelope = serde_json::from_value(json).unwrap();
        assert_eq!(back, envelope);
    }

    #[tokio::test]
    async fn queue_is_fifo_within_capacity() {
        let queue = InMemoryQueue::new(4);
        queue.push(Envelope::new("a", 0, "r1")).await.unwrap();
        queue.push(Envelope::new("b", 0, "r2")).await.unwrap();
        assert_eq!(queue.depth(), 2);
        assert_eq!(queue.pop().await.unwrap().id, "a");
        assert_eq!(queue.pop().await.unwrap().id, "b");
    }

    #[tokio::test]
    async fn full_queue_reports_backpressure() {
        let queue = InMemoryQueue::new(1);
        queue.push(Envelope::new("a", 0, "r1")).await.unwrap();
        let err = queue.push(Envelope::new("b", 0, "r2")).await.unwrap_err();
        assert!(matches!(err, QueueError::Full));
    }

    #[test]
    fn queue_url_scheme_selects_backend() {
        assert!(from_queue_url("memory://local", 16).is_ok());
        assert!(from_queue_url("redis://localhost:6379", 16).is_err());
    }
}
