//! Repository for organization database operations.
//!
//! The engine only needs existence checks; creation exists for the
//! configuration surface and for seeding.

use std::sync::Arc;

use sqlx::{Executor, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::{
    error::Result,
    models::{OrgId, Organization},
};

/// Repository for organization database operations.
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

    /// Creates a new organization.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails or constraints are violated.
    pub async fn create(&self, organization: &Organization) -> Result<OrgId> {
        self.create_impl(&*self.pool, organization).await
    }

    /// Creates an organization within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn create_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        organization: &Organization,
    ) -> Result<OrgId> {
        self.create_impl(&mut **tx, organization).await
    }

    async fn create_impl<'e, E>(&self, executor: E, organization: &Organization) -> Result<OrgId>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let id: Uuid = sqlx::query_scalar(
            r"
            INSERT INTO organizations (id, name, created_at)
            VALUES ($1, $2, $3)
            RETURNING id
            ",
        )
        .bind(organization.id)
        .bind(&organization.name)
        .bind(organization.created_at)
        .fetch_one(executor)
        .await?;

        Ok(OrgId(id))
    }

    /// Finds an organization by ID.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, org_id: OrgId) -> Result<Option<Organization>> {
        let organization = sqlx::query_as::<_, Organization>(
            r"
            SELECT id, name, created_at
            FROM organizations
            WHERE id = $1
            ",
        )
        .bind(org_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(organization)
    }

    /// Returns true if the organization exists.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn exists(&self, org_id: OrgId) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM organizations WHERE id = $1)")
                .bind(org_id)
                .fetch_one(&*self.pool)
                .await?;

        Ok(exists)
    }
}
