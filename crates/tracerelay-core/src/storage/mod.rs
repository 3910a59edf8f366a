//! Database access layer implementing the repository pattern.
//!
//! Repositories translate between domain models and the PostgreSQL schema.
//! All SQL lives in this module.

use std::sync::Arc;

use sqlx::PgPool;

pub mod delivery_records;
pub mod destinations;
pub mod organizations;
pub mod traces;

use crate::error::Result;

/// Schema statements applied at startup. Every statement is idempotent.
///
/// Delivery records reference traces without a foreign key so that their
/// outcome outlives trace expiry.
pub const SCHEMA: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS organizations (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS traces (
        id UUID PRIMARY KEY,
        org_id UUID NOT NULL REFERENCES organizations(id),
        external_trace_id TEXT,
        span_id TEXT,
        parent_span_id TEXT,
        data JSONB NOT NULL,
        metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        expires_at TIMESTAMPTZ NOT NULL
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_traces_expires_at ON traces (expires_at)",
    "ALTER TABLE traces ADD COLUMN IF NOT EXISTS fanned_out_at TIMESTAMPTZ",
    r"
    CREATE INDEX IF NOT EXISTS idx_traces_pending_fan_out
        ON traces (created_at) WHERE fanned_out_at IS NULL
    ",
    r"
    CREATE TABLE IF NOT EXISTS destinations (
        id UUID PRIMARY KEY,
        org_id UUID NOT NULL REFERENCES organizations(id),
        name TEXT NOT NULL,
        provider_type TEXT NOT NULL,
        config TEXT NOT NULL,
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        priority INTEGER NOT NULL DEFAULT 0,
        transform_function TEXT,
        rate_limit INTEGER CHECK (rate_limit IS NULL OR rate_limit > 0),
        retry_enabled BOOLEAN NOT NULL DEFAULT TRUE,
        max_retries INTEGER NOT NULL DEFAULT 5 CHECK (max_retries >= 0),
        retry_delay_ms_base BIGINT NOT NULL DEFAULT 1000 CHECK (retry_delay_ms_base >= 0),
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_destinations_org_active
        ON destinations (org_id, priority DESC, created_at ASC) WHERE is_active
    ",
    r"
    CREATE TABLE IF NOT EXISTS delivery_records (
        id UUID PRIMARY KEY,
        trace_id UUID NOT NULL,
        destination_id UUID NOT NULL REFERENCES destinations(id),
        status TEXT NOT NULL
            CHECK (status IN ('pending', 'retrying', 'success', 'failed', 'cancelled')),
        attempts INTEGER NOT NULL DEFAULT 0,
        transformed_payload JSONB,
        response_data JSONB,
        last_error TEXT,
        last_error_at TIMESTAMPTZ,
        last_attempt_at TIMESTAMPTZ,
        next_retry_at TIMESTAMPTZ,
        delivered_at TIMESTAMPTZ,
        claim_token UUID,
        claimed_until TIMESTAMPTZ,
        rate_slot_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        UNIQUE (trace_id, destination_id)
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_delivery_records_due
        ON delivery_records (next_retry_at) WHERE status IN ('pending', 'retrying')
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_delivery_records_rate_window
        ON delivery_records (destination_id, delivered_at) WHERE status = 'success'
    ",
];

/// Container for all repository instances.
///
/// Repositories share one connection pool.
#[derive(Clone)]
pub struct Storage {
    /// Organization lookups.
    pub organizations: Arc<organizations::Repository>,

    /// Trace persistence and expiry.
    pub traces: Arc<traces::Repository>,

    /// Destination configuration.
    pub destinations: Arc<destinations::Repository>,

    /// Delivery records, claims and transitions.
    pub delivery_records: Arc<delivery_records::Repository>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            organizations: Arc::new(organizations::Repository::new(pool.clone())),
            traces: Arc::new(traces::Repository::new(pool.clone())),
            destinations: Arc::new(destinations::Repository::new(pool.clone())),
            delivery_records: Arc::new(delivery_records::Repository::new(pool)),
        }
    }

    /// Applies [`SCHEMA`].
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if any statement fails.
    pub async fn migrate(&self) -> Result<()> {
        let pool = self.traces.pool();
        for statement in SCHEMA {
            sqlx::query(statement).execute(&*pool).await?;
        }
        Ok(())
    }

    /// Verifies database connectivity.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.traces.pool()).await?;

        Ok(())
    }
}
