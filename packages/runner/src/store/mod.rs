//! Persistence layer. The relational store is the authoritative state; all
//! mutation funnels through here.
//!
//! Convention: reads take `&PgPool`; writes that must compose into a caller's
//! transaction take `&mut PgConnection` so the admission pipeline, the
//! publisher's claim-and-mark, and the runner's double updates each commit
//! atomically.

pub mod cross_region;
pub mod execution;
pub mod idempotency;
pub mod job;
pub mod outbox;
pub mod trace;

use std::time::Duration;

use sqlx::postgres::types::PgInterval;

pub use cross_region::{
    CrossRegionAnalysis, CrossRegionExecution, CrossRegionStatus, RegionResult,
    RegionResultStatus, RegionRollup,
};
pub use execution::{Execution, ExecutionStatus, RetryAttempt, TaskClaim};
pub use idempotency::{IdempotencyInsert, IdempotencyKey};
pub use job::{Job, JobStatus};
pub use outbox::OutboxEntry;
pub use trace::TraceSpan;

/// Embedded migrations for `packages/runner/migrations`.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Typed interval parameter for threshold comparisons. Never build
/// intervals by string concatenation.
pub fn pg_interval(d: Duration) -> PgInterval {
    PgInterval {
        months: 0,
        days: 0,
        microseconds: d.as_micros() as i64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pg_interval_converts_to_microseconds() {
        let interval = pg_interval(Duration::from_secs(600));
        assert_eq!(interval.microseconds, 600_000_000);
        assert_eq!(interval.months, 0);
        assert_eq!(interval.days, 0);
    }
}
