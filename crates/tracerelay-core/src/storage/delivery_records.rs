//! Repository for delivery record database operations.
//!
//! Delivery records are the unit of work. Processors take a lease-bounded
//! claim on a record and every state change is a conditional update keyed
//! on the claim token, so two processors never write the same attempt.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::{
    error::Result,
    models::{
        Claim, ClaimedRecord, DeliveryId, DeliveryRecord, DestinationId, TraceId, Transition,
    },
};

const RECORD_COLUMNS: &str = "id, trace_id, destination_id, status, attempts, \
     transformed_payload, response_data, last_error, last_error_at, last_attempt_at, \
     next_retry_at, delivered_at, claim_token, claimed_until, rate_slot_at, created_at, \
     updated_at";

/// Repository for delivery record database operations.
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

    /// Creates the record for a trace/destination pair unless one exists.
    ///
    /// Returns the stored record and whether this call created it.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn upsert(
        &self,
        trace_id: TraceId,
        destination_id: DestinationId,
        now: DateTime<Utc>,
    ) -> Result<(DeliveryRecord, bool)> {
        let fresh = DeliveryRecord::new(trace_id, destination_id, now);

        let inserted = sqlx::query_as::<_, DeliveryRecord>(&format!(
            r"
            INSERT INTO delivery_records (id, trace_id, destination_id, status, attempts,
                                          created_at, updated_at)
            VALUES ($1, $2, $3, 'pending', 0, $4, $4)
            ON CONFLICT (trace_id, destination_id) DO NOTHING
            RETURNING {RECORD_COLUMNS}
            "
        ))
        .bind(fresh.id)
        .bind(trace_id)
        .bind(destination_id)
        .bind(now)
        .fetch_optional(&*self.pool)
        .await?;

        if let Some(record) = inserted {
            return Ok((record, true));
        }

        let existing = sqlx::query_as::<_, DeliveryRecord>(&format!(
            "SELECT {RECORD_COLUMNS} FROM delivery_records \
             WHERE trace_id = $1 AND destination_id = $2"
        ))
        .bind(trace_id)
        .bind(destination_id)
        .fetch_one(&*self.pool)
        .await?;

        Ok((existing, false))
    }

    /// Finds a delivery record by ID.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, id: DeliveryId) -> Result<Option<DeliveryRecord>> {
        let record = sqlx::query_as::<_, DeliveryRecord>(&format!(
            "SELECT {RECORD_COLUMNS} FROM delivery_records WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(record)
    }

    /// Lists all delivery records of a trace, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_trace(&self, trace_id: TraceId) -> Result<Vec<DeliveryRecord>> {
        let records = sqlx::query_as::<_, DeliveryRecord>(&format!(
            "SELECT {RECORD_COLUMNS} FROM delivery_records \
             WHERE trace_id = $1 ORDER BY created_at ASC, id ASC"
        ))
        .bind(trace_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(records)
    }

    /// Claims a single record if it is claimable at `now`.
    ///
    /// A record is claimable when it is `pending` or `retrying`, its retry
    /// time has elapsed (or is unset) and no unexpired claim is held.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn claim(
        &self,
        id: DeliveryId,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<ClaimedRecord>> {
        let token = Uuid::new_v4();

        let record = sqlx::query_as::<_, DeliveryRecord>(&format!(
            r"
            UPDATE delivery_records
            SET claim_token = $2, claimed_until = $3, updated_at = $4
            WHERE id = $1
              AND status IN ('pending', 'retrying')
              AND (next_retry_at IS NULL OR next_retry_at <= $4)
              AND (claimed_until IS NULL OR claimed_until < $4)
            RETURNING {RECORD_COLUMNS}
            "
        ))
        .bind(id)
        .bind(token)
        .bind(lease_until)
        .bind(now)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(record.map(|record| {
            let claim = Claim { record_id: record.id, token };
            ClaimedRecord { claim, record }
        }))
    }

    /// Claims up to `batch_size` due records.
    ///
    /// Uses `FOR UPDATE SKIP LOCKED` so concurrent sweepers, in this
    /// process or another, claim disjoint sets. Oldest retry times first.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails.
    pub async fn claim_due(
        &self,
        now: DateTime<Utc>,
        batch_size: i64,
        lease_until: DateTime<Utc>,
    ) -> Result<Vec<ClaimedRecord>> {
        let token = Uuid::new_v4();
        let mut tx = self.pool.begin().await?;

        let ids: Vec<Uuid> = sqlx::query_scalar(
            r"
            SELECT id FROM delivery_records
            WHERE status IN ('pending', 'retrying')
              AND (next_retry_at IS NULL OR next_retry_at <= $1)
              AND (claimed_until IS NULL OR claimed_until < $1)
            ORDER BY next_retry_at ASC NULLS FIRST, created_at ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            ",
        )
        .bind(now)
        .bind(batch_size)
        .fetch_all(&mut *tx)
        .await?;

        if ids.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        let records = sqlx::query_as::<_, DeliveryRecord>(&format!(
            r"
            UPDATE delivery_records
            SET claim_token = $2, claimed_until = $3, updated_at = $4
            WHERE id = ANY($1)
            RETURNING {RECORD_COLUMNS}
            "
        ))
        .bind(&ids)
        .bind(token)
        .bind(lease_until)
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(records
            .into_iter()
            .map(|record| ClaimedRecord { claim: Claim { record_id: record.id, token }, record })
            .collect())
    }

    /// Applies a transition to a claimed record and releases the claim.
    ///
    /// Returns false, writing nothing, when the claim is no longer held or
    /// the record is already terminal.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn apply_transition(
        &self,
        claim: Claim,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let query = match transition {
            Transition::Delivered { at, transformed_payload, response_data } => sqlx::query(
                r"
                UPDATE delivery_records
                SET status = 'success', delivered_at = $3, last_attempt_at = $3,
                    next_retry_at = NULL, transformed_payload = $4, response_data = $5,
                    claim_token = NULL, claimed_until = NULL, updated_at = $6
                WHERE id = $1 AND claim_token = $2 AND status IN ('pending', 'retrying')
                ",
            )
            .bind(claim.record_id)
            .bind(claim.token)
            .bind(*at)
            .bind(transformed_payload)
            .bind(response_data)
            .bind(now),
            Transition::RetryScheduled { attempts, at, next_retry_at, error } => sqlx::query(
                r"
                UPDATE delivery_records
                SET status = 'retrying', attempts = $3, last_attempt_at = $4,
                    next_retry_at = $5, last_error = $6, last_error_at = $4,
                    rate_slot_at = NULL, claim_token = NULL, claimed_until = NULL,
                    updated_at = $7
                WHERE id = $1 AND claim_token = $2 AND status IN ('pending', 'retrying')
                ",
            )
            .bind(claim.record_id)
            .bind(claim.token)
            .bind(*attempts)
            .bind(*at)
            .bind(*next_retry_at)
            .bind(error)
            .bind(now),
            Transition::Deferred { next_retry_at } => sqlx::query(
                r"
                UPDATE delivery_records
                SET next_retry_at = $3, claim_token = NULL, claimed_until = NULL,
                    updated_at = $4
                WHERE id = $1 AND claim_token = $2 AND status IN ('pending', 'retrying')
                ",
            )
            .bind(claim.record_id)
            .bind(claim.token)
            .bind(*next_retry_at)
            .bind(now),
            Transition::Failed { attempts, at, attempted, error } => sqlx::query(
                r"
                UPDATE delivery_records
                SET status = 'failed', attempts = $3,
                    last_attempt_at = CASE WHEN $5 THEN $4 ELSE last_attempt_at END,
                    next_retry_at = NULL, last_error = $6, last_error_at = $4,
                    rate_slot_at = NULL, claim_token = NULL, claimed_until = NULL,
                    updated_at = $7
                WHERE id = $1 AND claim_token = $2 AND status IN ('pending', 'retrying')
                ",
            )
            .bind(claim.record_id)
            .bind(claim.token)
            .bind(*attempts)
            .bind(*at)
            .bind(*attempted)
            .bind(error)
            .bind(now),
            Transition::Cancelled { at, reason } => sqlx::query(
                r"
                UPDATE delivery_records
                SET status = 'cancelled', next_retry_at = NULL, last_error = $3,
                    last_error_at = $4, rate_slot_at = NULL, claim_token = NULL,
                    claimed_until = NULL, updated_at = $5
                WHERE id = $1 AND claim_token = $2 AND status IN ('pending', 'retrying')
                ",
            )
            .bind(claim.record_id)
            .bind(claim.token)
            .bind(reason)
            .bind(*at)
            .bind(now),
        };

        let result = query.execute(&*self.pool).await?;
        Ok(result.rows_affected() == 1)
    }

    /// Atomically checks a destination's rate limit and reserves a slot.
    ///
    /// Counts successful deliveries since `window_start` plus live
    /// reservations of other in-flight records. Under the limit, the slot
    /// is reserved on the claimed record and true is returned. The count and
    /// the reservation run under a per-destination advisory lock.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails.
    pub async fn reserve_rate_slot(
        &self,
        claim: Claim,
        destination_id: DestinationId,
        limit: i64,
        window_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        lock_destination(&mut tx, destination_id).await?;

        let in_window: i64 = sqlx::query_scalar(
            r"
            SELECT COUNT(*) FROM delivery_records
            WHERE destination_id = $1
              AND (
                (status = 'success' AND delivered_at > $2)
                OR (status IN ('pending', 'retrying') AND rate_slot_at > $2 AND id <> $3)
              )
            ",
        )
        .bind(destination_id)
        .bind(window_start)
        .bind(claim.record_id)
        .fetch_one(&mut *tx)
        .await?;

        if in_window >= limit {
            tx.rollback().await?;
            return Ok(false);
        }

        let reserved = sqlx::query(
            r"
            UPDATE delivery_records
            SET rate_slot_at = $3
            WHERE id = $1 AND claim_token = $2
            ",
        )
        .bind(claim.record_id)
        .bind(claim.token)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(reserved.rows_affected() == 1)
    }

    /// Cancels a non-terminal record regardless of who holds its claim.
    ///
    /// Returns false if the record does not exist or is already terminal.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn cancel(&self, id: DeliveryId, reason: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE delivery_records
            SET status = 'cancelled', next_retry_at = NULL, last_error = $2,
                last_error_at = $3, rate_slot_at = NULL, claim_token = NULL,
                claimed_until = NULL, updated_at = $3
            WHERE id = $1 AND status IN ('pending', 'retrying')
            ",
        )
        .bind(id)
        .bind(reason)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

/// Takes the transaction-scoped advisory lock serializing rate-limit
/// admission for one destination.
async fn lock_destination(
    tx: &mut Transaction<'_, Postgres>,
    destination_id: DestinationId,
) -> Result<()> {
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(advisory_key(destination_id))
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Folds a destination UUID into the 64-bit advisory lock key space.
fn advisory_key(destination_id: DestinationId) -> i64 {
    let (high, low) = destination_id.0.as_u64_pair();
    i64::from_ne_bytes((high ^ low).to_ne_bytes())
}
