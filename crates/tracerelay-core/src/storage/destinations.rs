//! Repository for destination database operations.
//!
//! Destinations are written by the configuration surface. The engine reads
//! them to fan traces out and to re-process claimed records.

use std::sync::Arc;

use sqlx::{Executor, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::{
    error::Result,
    models::{Destination, DestinationId, OrgId},
};

/// Repository for destination database operations.
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

    /// Creates a new destination.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails or constraints are violated.
    pub async fn create(&self, destination: &Destination) -> Result<DestinationId> {
        self.create_impl(&*self.pool, destination).await
    }

    /// Creates a destination within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn create_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        destination: &Destination,
    ) -> Result<DestinationId> {
        self.create_impl(&mut **tx, destination).await
    }

    async fn create_impl<'e, E>(
        &self,
        executor: E,
        destination: &Destination,
    ) -> Result<DestinationId>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let id: Uuid = sqlx::query_scalar(
            r"
            INSERT INTO destinations (
                id, org_id, name, provider_type, config, is_active, priority,
                transform_function, rate_limit, retry_enabled, max_retries,
                retry_delay_ms_base, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING id
            ",
        )
        .bind(destination.id)
        .bind(destination.org_id)
        .bind(&destination.name)
        .bind(&destination.provider_type)
        .bind(&destination.config)
        .bind(destination.is_active)
        .bind(destination.priority)
        .bind(&destination.transform_function)
        .bind(destination.rate_limit)
        .bind(destination.retry_enabled)
        .bind(destination.max_retries)
        .bind(destination.retry_delay_ms_base)
        .bind(destination.created_at)
        .fetch_one(executor)
        .await?;

        Ok(DestinationId(id))
    }

    /// Finds a destination by ID, active or not.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, destination_id: DestinationId) -> Result<Option<Destination>> {
        let destination = sqlx::query_as::<_, Destination>(
            r"
            SELECT id, org_id, name, provider_type, config, is_active, priority,
                   transform_function, rate_limit, retry_enabled, max_retries,
                   retry_delay_ms_base, created_at
            FROM destinations
            WHERE id = $1
            ",
        )
        .bind(destination_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(destination)
    }

    /// Lists an organization's active destinations.
    ///
    /// Ordered by priority descending, then creation time ascending, then
    /// ID so the order is total.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn list_active(&self, org_id: OrgId) -> Result<Vec<Destination>> {
        let destinations = sqlx::query_as::<_, Destination>(
            r"
            SELECT id, org_id, name, provider_type, config, is_active, priority,
                   transform_function, rate_limit, retry_enabled, max_retries,
                   retry_delay_ms_base, created_at
            FROM destinations
            WHERE org_id = $1 AND is_active
            ORDER BY priority DESC, created_at ASC, id ASC
            ",
        )
        .bind(org_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(destinations)
    }

    /// Activates or deactivates a destination.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no destination has this ID.
    pub async fn set_active(&self, destination_id: DestinationId, is_active: bool) -> Result<()> {
        let result = sqlx::query("UPDATE destinations SET is_active = $2 WHERE id = $1")
            .bind(destination_id)
            .bind(is_active)
            .execute(&*self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(crate::error::CoreError::NotFound(format!(
                "destination {destination_id}"
            )));
        }

        Ok(())
    }
}
