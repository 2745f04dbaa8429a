use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::Handle;
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use super::{Compensable, RemoveOutcome, ReplicaStore, ReplicaUser, UpsertOutcome};
use crate::error::StoreError;

/// PostgreSQL-backed replica store.
///
/// Upsert and remove for the same handle are serialised through a
/// transaction-scoped advisory lock, so a compensation racing a `created`
/// delivery always observes or leaves the tombstone.
#[derive(Clone)]
pub struct PostgresReplicaStore {
    pool: PgPool,
}

impl PostgresReplicaStore {
    /// Creates a new store on an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn lock_handle(tx: &mut Transaction<'_, Postgres>, handle: Handle) -> Result<(), StoreError> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1::text))")
            .bind(handle.as_uuid())
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    fn row_to_user(row: PgRow) -> Result<ReplicaUser, StoreError> {
        Ok(ReplicaUser {
            handle: Handle::from_uuid(row.try_get::<Uuid, _>("handle")?),
            email: row.try_get("email")?,
            replicated_at: row.try_get::<DateTime<Utc>, _>("replicated_at")?,
        })
    }
}

#[async_trait]
impl Compensable for PostgresReplicaStore {
    async fn remove(&self, handle: Handle) -> Result<RemoveOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        Self::lock_handle(&mut tx, handle).await?;

        sqlx::query(
            r#"
            INSERT INTO user_account_tombstone (handle)
            VALUES ($1)
            ON CONFLICT (handle) DO NOTHING
            "#,
        )
        .bind(handle.as_uuid())
        .execute(&mut *tx)
        .await?;

        let deleted = sqlx::query("DELETE FROM user_account WHERE handle = $1")
            .bind(handle.as_uuid())
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;

        Ok(if deleted > 0 {
            RemoveOutcome::Removed
        } else {
            RemoveOutcome::Absent
        })
    }
}

#[async_trait]
impl ReplicaStore for PostgresReplicaStore {
    async fn upsert(&self, user: &ReplicaUser) -> Result<UpsertOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        Self::lock_handle(&mut tx, user.handle).await?;

        let tombstoned: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM user_account_tombstone WHERE handle = $1)",
        )
        .bind(user.handle.as_uuid())
        .fetch_one(&mut *tx)
        .await?;

        if tombstoned {
            return Ok(UpsertOutcome::Compensated);
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO user_account (handle, email, replicated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (handle) DO NOTHING
            "#,
        )
        .bind(user.handle.as_uuid())
        .bind(&user.email)
        .bind(user.replicated_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        Ok(if inserted > 0 {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::AlreadyPresent
        })
    }

    async fn get(&self, handle: Handle) -> Result<Option<ReplicaUser>, StoreError> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT handle, email, replicated_at
            FROM user_account
            WHERE handle = $1
            "#,
        )
        .bind(handle.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_user).transpose()
    }

    async fn count(&self) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM user_account")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }
}
