//! Idempotency keys: client-supplied tokens mapped to the job they first
//! created. The primary-key constraint is what makes concurrent duplicate
//! submissions collapse; a race loser observes the conflict and adopts the
//! winner's job ID.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgConnection};

#[derive(FromRow, Debug, Clone)]
pub struct IdempotencyKey {
    pub idem_key: String,
    pub jobspec_id: String,
    pub created_at: DateTime<Utc>,
}

/// Outcome of attempting to register a key.
#[derive(Debug)]
pub enum IdempotencyInsert {
    Inserted,
    /// Another submission holds the key; carries the winner's job ID.
    Conflict(String),
}

impl IdempotencyKey {
    pub async fn find(
        key: &str,
        conn: &mut PgConnection,
    ) -> Result<Option<String>, sqlx::Error> {
        sqlx::query_scalar::<_, String>(
            "SELECT jobspec_id FROM idempotency_keys WHERE idem_key = $1",
        )
        .bind(key)
        .fetch_optional(&mut *conn)
        .await
    }

    pub async fn insert(
        key: &str,
        jobspec_id: &str,
        conn: &mut PgConnection,
    ) -> Result<IdempotencyInsert, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO idempotency_keys (idem_key, jobspec_id)
            VALUES ($1, $2)
            ON CONFLICT (idem_key) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(jobspec_id)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(IdempotencyInsert::Inserted);
        }

        let winner = sqlx::query_scalar::<_, String>(
            "SELECT jobspec_id FROM idempotency_keys WHERE idem_key = $1",
        )
        .bind(key)
        .fetch_one(&mut *conn)
        .await?;

        Ok(IdempotencyInsert::Conflict(winner))
    }
}
