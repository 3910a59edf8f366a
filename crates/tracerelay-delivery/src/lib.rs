//! Trace delivery engine with fan-out, retries and rate limits.
//!
//! Each captured trace is fanned out to every active destination of its
//! organization. One delivery record per trace/destination pair tracks the
//! work through a small state machine:
//!
//! 1. **Fan-out** - upsert one record per active destination, finished by a
//!    sweep if interrupted
//! 2. **Admission** - per-destination sliding-window rate limit
//! 3. **Transform** - optional sandboxed payload reshaping
//! 4. **Delivery** - provider adapter call under a timeout
//! 5. **Outcome** - success, scheduled retry with backoff, or failure
//!
//! Records are claimed with a lease before processing, and every write is
//! conditional on the claim, so concurrent sweeps and processes never
//! deliver one record twice at the same time.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tracerelay_core::{storage::Storage, RealClock};
//! use tracerelay_delivery::{
//!     adapter::{AdapterRegistry, HttpClient},
//!     storage::PostgresDeliveryStorage,
//!     DeliveryEngine, DeliveryError, EngineConfig, Orchestrator,
//! };
//!
//! # async fn example(pool: sqlx::PgPool) -> std::result::Result<(), DeliveryError> {
//! let storage = Arc::new(PostgresDeliveryStorage::new(Arc::new(Storage::new(pool))));
//! let adapters = AdapterRegistry::with_defaults(HttpClient::with_defaults()?);
//! let orchestrator = Orchestrator::new(storage, adapters, Arc::new(RealClock::new()));
//!
//! let mut engine = DeliveryEngine::new(orchestrator, EngineConfig::default());
//! engine.start().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod adapter;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod orchestrator;
pub mod rate_limit;
pub mod registry;
pub mod retry;
pub mod storage;
pub mod sweeper;
pub mod transform;
mod worker_pool;

pub use adapter::{Adapter, AdapterRegistry, AdapterResult, DeliveryContext};
pub use crypto::{ChaChaConfigDecryptor, ConfigDecryptor, PlaintextConfig};
pub use engine::{DeliveryEngine, EngineConfig, EngineStats, IngestHandle};
pub use error::{DeliveryError, Result};
pub use orchestrator::{AttemptOutcome, FanOutSummary, Orchestrator, OrchestratorConfig};
pub use transform::{TransformExecutor, TransformSandbox};

/// Default number of ingest workers.
pub const DEFAULT_INGEST_WORKERS: usize = 4;

/// Default number of records claimed per retry sweep.
pub const DEFAULT_RETRY_BATCH_SIZE: usize = 100;
