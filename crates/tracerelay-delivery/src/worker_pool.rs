//! Worker pool management with structured concurrency.
//!
//! Runs the ingest workers and the sweepers as supervised tasks sharing one
//! cancellation token.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, Mutex, RwLock},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracerelay_core::models::TraceId;
use tracing::{debug, error, info, warn};

use crate::{
    engine::{EngineConfig, EngineStats},
    error::{DeliveryError, Result},
    orchestrator::Orchestrator,
    sweeper::{ExpirySweeper, FanOutSweeper, RetrySweeper},
};

type SharedReceiver = Arc<Mutex<mpsc::Receiver<TraceId>>>;

/// Supervised set of engine tasks.
pub struct WorkerPool {
    orchestrator: Arc<Orchestrator>,
    config: EngineConfig,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    handles: Vec<(String, JoinHandle<()>)>,
}

impl WorkerPool {
    /// Creates an empty pool.
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        config: EngineConfig,
        stats: Arc<RwLock<EngineStats>>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self { orchestrator, config, stats, cancellation_token, handles: Vec::new() }
    }

    /// Spawns ingest workers consuming `receiver` plus the retry, fan-out
    /// and expiry sweepers. Returns immediately.
    pub async fn spawn_workers(&mut self, receiver: mpsc::Receiver<TraceId>) {
        let receiver: SharedReceiver = Arc::new(Mutex::new(receiver));
        let worker_count = self.config.ingest_workers.max(1);

        info!(worker_count, "spawning ingest workers");

        for worker_id in 0..worker_count {
            let orchestrator = self.orchestrator.clone();
            let receiver = receiver.clone();
            let token = self.cancellation_token.clone();
            let handle = tokio::spawn(async move {
                run_ingest_worker(worker_id, orchestrator, receiver, token).await;
            });
            self.handles.push((format!("ingest-{worker_id}"), handle));
        }

        let retry_sweeper =
            RetrySweeper::new(self.orchestrator.clone(), self.config.retry_batch_size);
        let interval = self.config.retry_sweep_interval;
        let token = self.cancellation_token.clone();
        self.handles.push((
            "retry-sweeper".to_string(),
            tokio::spawn(async move { retry_sweeper.run(interval, token).await }),
        ));

        let fan_out_sweeper = FanOutSweeper::new(
            self.orchestrator.clone(),
            self.config.retry_batch_size,
            self.config.fan_out_grace,
        );
        let token = self.cancellation_token.clone();
        self.handles.push((
            "fan-out-sweeper".to_string(),
            tokio::spawn(async move { fan_out_sweeper.run(interval, token).await }),
        ));

        let expiry_sweeper =
            ExpirySweeper::new(self.orchestrator.clone(), self.config.expiry_batch_size);
        let interval = self.config.expiry_sweep_interval;
        let token = self.cancellation_token.clone();
        self.handles.push((
            "expiry-sweeper".to_string(),
            tokio::spawn(async move { expiry_sweeper.run(interval, token).await }),
        ));

        self.stats.write().await.active_workers = self.handles.len();

        info!(spawned_tasks = self.handles.len(), "all engine tasks spawned");
    }

    /// Signals cancellation and waits for every task to finish its current
    /// work.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if tasks do not finish within `timeout`.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            task_count = self.handles.len(),
            timeout_seconds = timeout.as_secs(),
            "initiating graceful worker shutdown"
        );

        self.cancellation_token.cancel();

        let handles = std::mem::take(&mut self.handles);
        let shutdown_future = async {
            let mut panicked = 0;
            for (name, handle) in handles {
                if let Err(join_error) = handle.await {
                    error!(
                        task = %name,
                        error = %join_error,
                        "engine task panicked during shutdown"
                    );
                    panicked += 1;
                }
            }
            self.stats.write().await.active_workers = 0;
            panicked
        };

        match tokio::time::timeout(timeout, shutdown_future).await {
            Ok(0) => {
                info!("worker pool shutdown completed");
                Ok(())
            },
            Ok(panicked) => {
                warn!(panicked, "some engine tasks panicked");
                Err(DeliveryError::WorkerPanic { message: format!("{panicked} task(s) panicked") })
            },
            Err(_timeout) => {
                error!(
                    timeout_seconds = timeout.as_secs(),
                    "worker shutdown timed out, some tasks may still be running"
                );
                Err(DeliveryError::ShutdownTimeout { timeout_seconds: timeout.as_secs() })
            },
        }
    }
}

async fn run_ingest_worker(
    worker_id: usize,
    orchestrator: Arc<Orchestrator>,
    receiver: SharedReceiver,
    cancellation_token: CancellationToken,
) {
    debug!(worker_id, "ingest worker starting");

    loop {
        let next = tokio::select! {
            () = cancellation_token.cancelled() => break,
            trace_id = async { receiver.lock().await.recv().await } => trace_id,
        };

        let Some(trace_id) = next else {
            break;
        };

        match orchestrator.process_new_trace(trace_id).await {
            Ok(summary) => debug!(
                worker_id,
                trace_id = %trace_id,
                destinations = summary.destinations,
                records_created = summary.records_created,
                errors = summary.errors,
                "trace fanned out"
            ),
            Err(e) => warn!(
                worker_id,
                trace_id = %trace_id,
                error = %e,
                "trace fan-out failed, left for the fan-out sweep"
            ),
        }
    }

    debug!(worker_id, "ingest worker stopped");
}
