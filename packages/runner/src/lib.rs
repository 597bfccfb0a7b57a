//! Multi-region benchmark execution engine.
//!
//! Accepts signed job specifications, durably enqueues them through a
//! transactional outbox, fans work out across (region × model × question)
//! inference tasks against an external router, records signed execution
//! receipts, and aggregates cross-region comparison analyses.
//!
//! The pipeline, front to back:
//!
//! ```text
//! AdmissionService ──► jobs + outbox (one transaction)
//!       │
//! OutboxPublisher ──► WorkQueue ──► JobRunner ──► RouterClient
//!       │                               │
//!       │                               └─► executions / region_results
//! RecoverySweeper / TimeoutSweeper ◄── repair stuck jobs
//! ```
//!
//! Delivery is at-least-once end to end; the per-task uniqueness constraint
//! on `(job_id, region, model_id, question_id)` is what turns redelivery
//! into a no-op.

pub mod admission;
pub mod analysis;
pub mod config;
pub mod error;
pub mod kernel;
pub mod publisher;
pub mod queries;
pub mod queue;
pub mod retry;
pub mod runner;
pub mod signing;
pub mod spec;
pub mod store;
pub mod sweeper;
pub mod tracer;

pub use admission::{Admitted, AdmissionService, CrossRegionRequest};
pub use config::Config;
pub use kernel::service_host::{Service, ServiceHost};
pub use kernel::RunnerKernel;
pub use queue::{Envelope, InMemoryQueue, WorkQueue};
pub use spec::JobSpec;
