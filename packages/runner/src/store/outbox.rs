//! Transactional outbox rows.
//!
//! A row with NULL `published_at` is unclaimed and eligible for claim by any
//! publisher instance; a non-NULL `published_at` is never re-published. The
//! claim query uses `FOR UPDATE SKIP LOCKED` so concurrent publishers never
//! block each other on the same batch.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgConnection, PgPool};

#[derive(FromRow, Debug, Clone)]
pub struct OutboxEntry {
    pub id: i64,
    pub topic: String,
    pub payload: serde_json::Value,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub dead_letter_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    /// Insert inside the caller's transaction (admission, recovery sweep).
    pub async fn insert(
        topic: &str,
        payload: &serde_json::Value,
        conn: &mut PgConnection,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO outbox (topic, payload)
            VALUES ($1, $2)
            RETURNING id, topic, payload, attempts, created_at, published_at, dead_letter_at
            "#,
        )
        .bind(topic)
        .bind(payload)
        .fetch_one(&mut *conn)
        .await
    }

    /// Claim up to `limit` unpublished rows, FIFO by id, skipping rows
    /// locked by other publishers. Must run inside a transaction; the locks
    /// are held until it commits or rolls back.
    pub async fn claim_batch(
        limit: i64,
        conn: &mut PgConnection,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT id, topic, payload, attempts, created_at, published_at, dead_letter_at
            FROM outbox
            WHERE published_at IS NULL AND dead_letter_at IS NULL
            ORDER BY id
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(limit)
        .fetch_all(&mut *conn)
        .await
    }

    /// Mark rows published, in the same transaction as the successful push.
    pub async fn mark_published(
        ids: &[i64],
        conn: &mut PgConnection,
    ) -> Result<(), sqlx::Error> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query("UPDATE outbox SET published_at = NOW() WHERE id = ANY($1)")
            .bind(ids)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Record a deterministic decode failure. Once `attempts` reaches the
    /// threshold the row is dead-lettered and never re-pushed. Returns true
    /// when the row was dead-lettered by this call.
    pub async fn record_poison(id: i64, threshold: i32, db: &PgPool) -> Result<bool> {
        let dead_lettered: bool = sqlx::query_scalar(
            r#"
            UPDATE outbox
            SET attempts = attempts + 1,
                dead_letter_at = CASE
                    WHEN attempts + 1 >= $2 THEN NOW()
                    ELSE dead_letter_at
                END
            WHERE id = $1
            RETURNING dead_letter_at IS NOT NULL
            "#,
        )
        .bind(id)
        .bind(threshold)
        .fetch_one(db)
        .await?;

        Ok(dead_lettered)
    }

    /// Delete old published rows. Returns the number deleted.
    pub async fn cleanup_published(older_than: DateTime<Utc>, db: &PgPool) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM outbox WHERE published_at IS NOT NULL AND published_at < $1",
        )
        .bind(older_than)
        .execute(db)
        .await?;

        Ok(result.rows_affected())
    }

    /// Unpublished backlog, surfaced by the health snapshot.
    pub async fn unpublished_count(db: &PgPool) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM outbox WHERE published_at IS NULL AND dead_letter_at IS NULL",
        )
        .fetch_one(db)
        .await?;

        Ok(count)
    }

    /// Number of envelopes ever written for a job; used as the attempt
    /// counter when the recovery sweeper re-enqueues.
    pub async fn attempts_for_job(
        job_id: &str,
        conn: &mut PgConnection,
    ) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM outbox WHERE payload->>'id' = $1")
            .bind(job_id)
            .fetch_one(&mut *conn)
            .await
    }
}
