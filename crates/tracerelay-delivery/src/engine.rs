//! Delivery engine lifecycle.
//!
//! The engine owns the ingest queue, the worker pool and the shared
//! statistics. Traces enter through an [`IngestHandle`]; retries, unfinished
//! fan-outs and expiry are driven by the sweepers the pool spawns.

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracerelay_core::{models::TraceId, ExpirySummary};
use tracing::info;

use crate::{
    error::{DeliveryError, Result},
    orchestrator::Orchestrator,
    sweeper::{ExpirySweeper, FanOutSweepSummary, FanOutSweeper, RetrySweeper, SweepSummary},
    worker_pool::WorkerPool,
};

/// Configuration for the delivery engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of tasks consuming the ingest queue.
    pub ingest_workers: usize,
    /// Capacity of the ingest queue.
    pub ingest_queue_size: usize,
    /// How often due retries are swept.
    pub retry_sweep_interval: Duration,
    /// Maximum records claimed per retry sweep, and traces per fan-out sweep.
    pub retry_batch_size: usize,
    /// Age a trace must reach without being fanned out before the fan-out
    /// sweep takes it over from the ingest path.
    pub fan_out_grace: Duration,
    /// How often expired traces are swept.
    pub expiry_sweep_interval: Duration,
    /// Maximum traces expired per batch.
    pub expiry_batch_size: usize,
    /// Maximum time to wait for workers on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ingest_workers: crate::DEFAULT_INGEST_WORKERS,
            ingest_queue_size: 1024,
            retry_sweep_interval: Duration::from_secs(60),
            retry_batch_size: crate::DEFAULT_RETRY_BATCH_SIZE,
            fan_out_grace: Duration::from_secs(60),
            expiry_sweep_interval: Duration::from_secs(3600),
            expiry_batch_size: 500,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Statistics for delivery engine monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    /// Number of running worker tasks.
    pub active_workers: usize,
    /// Traces fully fanned out since startup.
    pub traces_ingested: u64,
    /// Claimed records processed since startup.
    pub records_processed: u64,
    /// Successful deliveries.
    pub delivered: u64,
    /// Failed attempts with a retry scheduled.
    pub retries_scheduled: u64,
    /// Records that reached `failed`.
    pub failed: u64,
    /// Attempts deferred by rate limits.
    pub deferred: u64,
    /// Records cancelled, including by expiry.
    pub cancelled: u64,
    /// Traces deleted by expiry.
    pub traces_expired: u64,
    /// Records currently being processed.
    pub in_flight: u64,
}

/// Cloneable handle for submitting newly ingested traces.
#[derive(Debug, Clone)]
pub struct IngestHandle {
    sender: mpsc::Sender<TraceId>,
    cancellation_token: CancellationToken,
}

impl IngestHandle {
    /// Enqueues a trace for fan-out and returns immediately.
    ///
    /// # Errors
    ///
    /// Returns `QueueFull` if the queue is at capacity and
    /// `ShutdownRequested` once the engine is stopping.
    pub fn submit(&self, trace_id: TraceId) -> Result<()> {
        if self.cancellation_token.is_cancelled() {
            return Err(DeliveryError::ShutdownRequested);
        }

        self.sender.try_send(trace_id).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::ShutdownRequested,
        })
    }
}

/// Main delivery engine coordinating ingest workers and sweepers.
pub struct DeliveryEngine {
    orchestrator: Arc<Orchestrator>,
    config: EngineConfig,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    sender: mpsc::Sender<TraceId>,
    receiver: Option<mpsc::Receiver<TraceId>>,
    worker_pool: Option<WorkerPool>,
}

impl DeliveryEngine {
    /// Creates an engine around a configured orchestrator.
    ///
    /// Statistics are shared with the orchestrator.
    pub fn new(orchestrator: Orchestrator, config: EngineConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.ingest_queue_size.max(1));
        let stats = orchestrator.stats().clone();

        Self {
            orchestrator: Arc::new(orchestrator),
            config,
            stats,
            cancellation_token: CancellationToken::new(),
            sender,
            receiver: Some(receiver),
            worker_pool: None,
        }
    }

    /// Returns a handle for submitting traces.
    ///
    /// Traces submitted before `start()` are processed once workers run.
    pub fn ingest_handle(&self) -> IngestHandle {
        IngestHandle {
            sender: self.sender.clone(),
            cancellation_token: self.cancellation_token.clone(),
        }
    }

    /// Starts ingest workers and the sweepers.
    ///
    /// Returns immediately after spawning. Use `shutdown()` to stop.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the engine was already started.
    pub async fn start(&mut self) -> Result<()> {
        let receiver = self
            .receiver
            .take()
            .ok_or_else(|| DeliveryError::internal("delivery engine already started"))?;

        info!(
            ingest_workers = self.config.ingest_workers,
            retry_sweep_interval_secs = self.config.retry_sweep_interval.as_secs(),
            expiry_sweep_interval_secs = self.config.expiry_sweep_interval.as_secs(),
            "starting delivery engine"
        );

        let mut worker_pool = WorkerPool::new(
            self.orchestrator.clone(),
            self.config.clone(),
            self.stats.clone(),
            self.cancellation_token.clone(),
        );
        worker_pool.spawn_workers(receiver).await;
        self.worker_pool = Some(worker_pool);

        info!("delivery engine started");
        Ok(())
    }

    /// Stops accepting traces and waits for workers to finish their current
    /// work.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if workers do not stop in time.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("shutting down delivery engine");

        self.cancellation_token.cancel();
        if let Some(worker_pool) = self.worker_pool.take() {
            worker_pool.shutdown_graceful(self.config.shutdown_timeout).await?;
        } else {
            info!("delivery engine was not started, shutdown completed immediately");
        }
        Ok(())
    }

    /// Returns current engine statistics.
    pub async fn stats(&self) -> EngineStats {
        self.stats.read().await.clone()
    }

    /// Orchestrator used by the engine.
    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Runs one retry sweep synchronously, without background workers.
    ///
    /// # Errors
    ///
    /// Returns a database error if records cannot be claimed.
    pub async fn sweep_retries_once(&self) -> Result<SweepSummary> {
        RetrySweeper::new(self.orchestrator.clone(), self.config.retry_batch_size)
            .sweep_once()
            .await
    }

    /// Runs one fan-out sweep synchronously.
    ///
    /// # Errors
    ///
    /// Returns a database error if pending traces cannot be listed.
    pub async fn sweep_fan_out_once(&self) -> Result<FanOutSweepSummary> {
        FanOutSweeper::new(
            self.orchestrator.clone(),
            self.config.retry_batch_size,
            self.config.fan_out_grace,
        )
        .sweep_once()
        .await
    }

    /// Runs one expiry batch synchronously.
    ///
    /// # Errors
    ///
    /// Returns a database error if the batch fails.
    pub async fn sweep_expired_once(&self) -> Result<ExpirySummary> {
        ExpirySweeper::new(self.orchestrator.clone(), self.config.expiry_batch_size)
            .sweep_once()
            .await
    }
}

#[cfg(test)]
mod tests {
    use tracerelay_core::RealClock;

    use super::*;
    use crate::{adapter::AdapterRegistry, storage::memory::MemoryStorage};

    fn engine(queue_size: usize) -> DeliveryEngine {
        let orchestrator = Orchestrator::new(
            Arc::new(MemoryStorage::new()),
            AdapterRegistry::new(),
            Arc::new(RealClock::new()),
        );
        let config = EngineConfig { ingest_queue_size: queue_size, ..Default::default() };
        DeliveryEngine::new(orchestrator, config)
    }

    #[tokio::test]
    async fn full_queue_rejects_submissions() {
        let engine = engine(1);
        let handle = engine.ingest_handle();

        handle.submit(TraceId::new()).unwrap();
        assert!(matches!(handle.submit(TraceId::new()), Err(DeliveryError::QueueFull)));
    }

    #[tokio::test]
    async fn shutdown_rejects_further_submissions() {
        let mut engine = engine(8);
        let handle = engine.ingest_handle();
        engine.start().await.unwrap();

        engine.shutdown().await.unwrap();

        assert!(matches!(handle.submit(TraceId::new()), Err(DeliveryError::ShutdownRequested)));
    }

    #[tokio::test]
    async fn engine_starts_only_once() {
        let mut engine = engine(8);
        engine.start().await.unwrap();
        assert!(engine.start().await.is_err());
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn unstarted_engine_shuts_down_immediately() {
        engine(8).shutdown().await.unwrap();
    }
}
