//! Isolated PostgreSQL databases for repository tests.
//!
//! Each test gets its own database, created from `DATABASE_URL` and dropped
//! at the end. Without `DATABASE_URL` the tests return early.

#![allow(dead_code)]

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions},
    PgPool,
};
use tracerelay_core::{
    models::{Destination, DestinationId, OrgId, Organization, Trace, TraceId},
    storage::Storage,
};
use uuid::Uuid;

/// A throwaway database with the schema applied.
pub struct TestDatabase {
    options: PgConnectOptions,
    admin: PgPool,
    pool: PgPool,
    name: String,
}

impl TestDatabase {
    /// Creates and migrates a fresh database, or `None` when `DATABASE_URL`
    /// is unset.
    pub async fn new() -> Result<Option<Self>> {
        let Ok(database_url) = std::env::var("DATABASE_URL") else {
            eprintln!("DATABASE_URL is not set, skipping database test");
            return Ok(None);
        };
        let options: PgConnectOptions =
            database_url.parse().context("failed to parse DATABASE_URL")?;

        let admin = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(options.clone().database("postgres"))
            .await
            .context("failed to connect to admin database")?;

        let name = format!("tracerelay_test_{}", Uuid::new_v4().simple());
        sqlx::query(&format!("CREATE DATABASE \"{name}\""))
            .execute(&admin)
            .await
            .with_context(|| format!("failed to create database {name}"))?;

        let options = options.database(&name);
        let pool = connect(&options).await?;
        Storage::new(pool.clone()).migrate().await?;

        Ok(Some(Self { options, admin, pool, name }))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn storage(&self) -> Storage {
        Storage::new(self.pool.clone())
    }

    /// Storage on a second, independent pool, standing in for another
    /// process.
    pub async fn second_storage(&self) -> Result<Storage> {
        Ok(Storage::new(connect(&self.options).await?))
    }

    /// Closes the pool and drops the database.
    pub async fn drop_database(self) -> Result<()> {
        self.pool.close().await;
        sqlx::query(&format!("DROP DATABASE IF EXISTS \"{}\" WITH (FORCE)", self.name))
            .execute(&self.admin)
            .await
            .with_context(|| format!("failed to drop database {}", self.name))?;
        Ok(())
    }
}

async fn connect(options: &PgConnectOptions) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(8)
        .acquire_timeout(Duration::from_secs(5))
        .connect_with(options.clone())
        .await
        .context("failed to connect to test database")
}

/// One organization with one destination, inserted in a single transaction.
pub struct Fixture {
    pub org: Organization,
    pub destination: Destination,
}

impl Fixture {
    pub async fn seed(db: &TestDatabase, rate_limit: Option<i32>) -> Result<Self> {
        let storage = db.storage();
        let now = Utc::now();
        let org = Organization { id: OrgId::new(), name: "acme".to_string(), created_at: now };
        let destination = destination(org.id, "sink", 0, now, rate_limit);

        let mut tx = db.pool().begin().await?;
        storage.organizations.create_in_tx(&mut tx, &org).await?;
        storage.destinations.create_in_tx(&mut tx, &destination).await?;
        tx.commit().await?;

        Ok(Self { org, destination })
    }

    pub async fn trace(&self, db: &TestDatabase, expires_at: DateTime<Utc>) -> Result<Trace> {
        let trace = Trace {
            id: TraceId::new(),
            org_id: self.org.id,
            external_trace_id: Some("external".to_string()),
            span_id: None,
            parent_span_id: None,
            data: json!({"prompt": "hello"}),
            metadata: json!({}),
            created_at: Utc::now(),
            expires_at,
        };
        let mut tx = db.pool().begin().await?;
        db.storage().traces.create_in_tx(&mut tx, &trace).await?;
        tx.commit().await?;
        Ok(trace)
    }
}

pub fn destination(
    org_id: OrgId,
    name: &str,
    priority: i32,
    created_at: DateTime<Utc>,
    rate_limit: Option<i32>,
) -> Destination {
    Destination {
        id: DestinationId::new(),
        org_id,
        name: name.to_string(),
        provider_type: "webhook".to_string(),
        config: "{}".to_string(),
        is_active: true,
        priority,
        transform_function: None,
        rate_limit,
        retry_enabled: true,
        max_retries: 5,
        retry_delay_ms_base: 1000,
        created_at,
    }
}
