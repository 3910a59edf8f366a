//! Repository for trace database operations.
//!
//! Trace content is immutable once written. The only mutable column is
//! `fanned_out_at`, set once every destination has a delivery record. Expiry
//! deletes traces, cancelling any delivery still in flight for the trace in
//! the same transaction.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::{
    error::Result,
    models::{ExpirySummary, Trace, TraceId},
};

/// Error message recorded on deliveries cancelled by trace expiry.
pub const TRACE_EXPIRED: &str = "trace expired";

/// Repository for trace database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Stores a trace.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails or the organization does not exist.
    pub async fn create(&self, trace: &Trace) -> Result<TraceId> {
        self.create_impl(&*self.pool, trace).await
    }

    /// Stores a trace within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn create_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        trace: &Trace,
    ) -> Result<TraceId> {
        self.create_impl(&mut **tx, trace).await
    }

    async fn create_impl<'e, E>(&self, executor: E, trace: &Trace) -> Result<TraceId>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let id: Uuid = sqlx::query_scalar(
            r"
            INSERT INTO traces (
                id, org_id, external_trace_id, span_id, parent_span_id,
                data, metadata, created_at, expires_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id
            ",
        )
        .bind(trace.id)
        .bind(trace.org_id)
        .bind(&trace.external_trace_id)
        .bind(&trace.span_id)
        .bind(&trace.parent_span_id)
        .bind(&trace.data)
        .bind(&trace.metadata)
        .bind(trace.created_at)
        .bind(trace.expires_at)
        .fetch_one(executor)
        .await?;

        Ok(TraceId(id))
    }

    /// Finds a trace by ID.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, trace_id: TraceId) -> Result<Option<Trace>> {
        let trace = sqlx::query_as::<_, Trace>(
            r"
            SELECT id, org_id, external_trace_id, span_id, parent_span_id,
                   data, metadata, created_at, expires_at
            FROM traces
            WHERE id = $1
            ",
        )
        .bind(trace_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(trace)
    }

    /// Marks a trace as fanned out. Returns false if it was already marked
    /// or no longer exists.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_fanned_out(&self, trace_id: TraceId, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE traces SET fanned_out_at = $2 WHERE id = $1 AND fanned_out_at IS NULL",
        )
        .bind(trace_id)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Lists up to `limit` traces created before `created_before` that were
    /// never fully fanned out, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn list_pending_fan_out(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<TraceId>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r"
            SELECT id FROM traces
            WHERE fanned_out_at IS NULL AND created_at < $1
            ORDER BY created_at ASC
            LIMIT $2
            ",
        )
        .bind(created_before)
        .bind(limit)
        .fetch_all(&*self.pool)
        .await?;

        Ok(ids.into_iter().map(TraceId).collect())
    }

    /// Expires up to `batch_size` traces whose `expires_at` is before `now`.
    ///
    /// Within one transaction, every non-terminal delivery record of the
    /// selected traces is cancelled with [`TRACE_EXPIRED`] and the trace rows
    /// are deleted. Delivery records themselves are kept. Rows locked by a
    /// concurrent sweep are skipped.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails; nothing is applied then.
    pub async fn expire_batch(&self, now: DateTime<Utc>, batch_size: i64) -> Result<ExpirySummary> {
        let mut tx = self.pool.begin().await?;

        let trace_ids: Vec<Uuid> = sqlx::query_scalar(
            r"
            SELECT id FROM traces
            WHERE expires_at < $1
            ORDER BY expires_at ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            ",
        )
        .bind(now)
        .bind(batch_size)
        .fetch_all(&mut *tx)
        .await?;

        if trace_ids.is_empty() {
            tx.rollback().await?;
            return Ok(ExpirySummary::default());
        }

        let cancelled = sqlx::query(
            r"
            UPDATE delivery_records
            SET status = 'cancelled',
                last_error = $2,
                last_error_at = $3,
                next_retry_at = NULL,
                claim_token = NULL,
                claimed_until = NULL,
                rate_slot_at = NULL,
                updated_at = $3
            WHERE trace_id = ANY($1)
              AND status IN ('pending', 'retrying')
            ",
        )
        .bind(&trace_ids)
        .bind(TRACE_EXPIRED)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let deleted = sqlx::query("DELETE FROM traces WHERE id = ANY($1)")
            .bind(&trace_ids)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(ExpirySummary {
            traces_deleted: deleted.rows_affected(),
            deliveries_cancelled: cancelled.rows_affected(),
        })
    }
}
