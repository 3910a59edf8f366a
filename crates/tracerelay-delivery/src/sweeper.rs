//! Periodic sweeps: due retries, unfinished fan-outs and expired traces.
//!
//! Every sweep is safe to run from several processes at once. Retry sweeps
//! claim disjoint record sets; expiry batches skip traces another sweeper has
//! locked. Repeating a fan-out never duplicates records.

use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracerelay_core::ExpirySummary;
use tracing::{debug, error, info, warn};

use crate::{
    error::Result,
    orchestrator::{AttemptOutcome, Orchestrator},
};

/// Pause after a failed sweep before trying again.
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Tally of one retry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    /// Records claimed by the sweep.
    pub claimed: usize,
    /// Records delivered.
    pub delivered: usize,
    /// Records rescheduled after a failed attempt.
    pub retries_scheduled: usize,
    /// Records pushed back by rate limits.
    pub deferred: usize,
    /// Records that failed terminally.
    pub failed: usize,
    /// Records cancelled.
    pub cancelled: usize,
    /// Records whose claim was lost mid-attempt.
    pub claims_lost: usize,
    /// Records whose processing hit an internal error.
    pub errors: usize,
}

impl SweepSummary {
    fn record(&mut self, outcome: &AttemptOutcome) {
        match outcome {
            AttemptOutcome::Delivered => self.delivered += 1,
            AttemptOutcome::RetryScheduled { .. } => self.retries_scheduled += 1,
            AttemptOutcome::Deferred { .. } => self.deferred += 1,
            AttemptOutcome::Failed { .. } => self.failed += 1,
            AttemptOutcome::Cancelled { .. } => self.cancelled += 1,
            AttemptOutcome::ClaimLost => self.claims_lost += 1,
        }
    }
}

/// Re-attempts records whose retry time has come.
#[derive(Clone)]
pub struct RetrySweeper {
    orchestrator: Arc<Orchestrator>,
    batch_size: usize,
}

impl RetrySweeper {
    /// Creates a sweeper claiming up to `batch_size` records per sweep.
    pub fn new(orchestrator: Arc<Orchestrator>, batch_size: usize) -> Self {
        Self { orchestrator, batch_size: batch_size.max(1) }
    }

    /// Claims one batch of due records and processes them concurrently.
    ///
    /// # Errors
    ///
    /// Returns a database error if the batch cannot be claimed. Failures of
    /// individual records are logged and counted.
    pub async fn sweep_once(&self) -> Result<SweepSummary> {
        let claimed = self.orchestrator.claim_due_records(self.batch_size).await?;
        let mut summary = SweepSummary { claimed: claimed.len(), ..Default::default() };
        if claimed.is_empty() {
            return Ok(summary);
        }

        debug!(batch_size = claimed.len(), "processing due deliveries");

        let results = join_all(claimed.into_iter().map(|claimed| {
            let record_id = claimed.record.id;
            async move { (record_id, self.orchestrator.process_claimed(claimed).await) }
        }))
        .await;

        for (record_id, result) in results {
            match result {
                Ok(outcome) => summary.record(&outcome),
                Err(e) => {
                    error!(record_id = %record_id, error = %e, "retry processing failed");
                    summary.errors += 1;
                },
            }
        }

        Ok(summary)
    }

    /// Sweeps every `interval` until cancelled.
    pub async fn run(&self, interval: Duration, cancellation_token: CancellationToken) {
        info!(
            interval_secs = interval.as_secs(),
            batch_size = self.batch_size,
            "retry sweeper starting"
        );
        let clock = self.orchestrator.clock().clone();

        loop {
            if cancellation_token.is_cancelled() {
                break;
            }

            let pause = match self.sweep_once().await {
                // a full batch means more may be due right away
                Ok(summary) if summary.claimed == self.batch_size => Duration::ZERO,
                Ok(summary) => {
                    if summary.claimed > 0 {
                        info!(
                            claimed = summary.claimed,
                            delivered = summary.delivered,
                            retries_scheduled = summary.retries_scheduled,
                            failed = summary.failed,
                            "retry sweep completed"
                        );
                    }
                    interval
                },
                Err(e) => {
                    error!(error = %e, "retry sweep failed");
                    ERROR_BACKOFF
                },
            };

            if pause.is_zero() {
                continue;
            }
            tokio::select! {
                () = clock.sleep(pause) => {}
                () = cancellation_token.cancelled() => break,
            }
        }

        info!("retry sweeper stopped");
    }
}

/// Tally of one fan-out sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOutSweepSummary {
    /// Traces found without the fanned-out marker.
    pub found: usize,
    /// Traces whose fan-out completed in this sweep.
    pub completed: usize,
    /// Traces still incomplete, left for the next sweep.
    pub errors: usize,
}

/// Finishes fan-outs that an ingest worker never completed.
///
/// Covers traces whose fan-out hit a storage error and traces whose
/// notification was never received. Only traces older than the grace period
/// are picked up, leaving fresh ones to the ingest workers.
#[derive(Clone)]
pub struct FanOutSweeper {
    orchestrator: Arc<Orchestrator>,
    batch_size: usize,
    grace: Duration,
}

impl FanOutSweeper {
    /// Creates a sweeper finishing up to `batch_size` traces per sweep.
    pub fn new(orchestrator: Arc<Orchestrator>, batch_size: usize, grace: Duration) -> Self {
        Self { orchestrator, batch_size: batch_size.max(1), grace }
    }

    /// Fans out one batch of traces that lack the fanned-out marker.
    ///
    /// # Errors
    ///
    /// Returns a database error if the pending traces cannot be listed.
    /// Failures of individual traces are logged and counted.
    pub async fn sweep_once(&self) -> Result<FanOutSweepSummary> {
        let grace = chrono::Duration::from_std(self.grace).unwrap_or(chrono::Duration::zero());
        let created_before = self.orchestrator.clock().now_utc() - grace;
        let storage = self.orchestrator.storage();
        let pending = storage.list_pending_fan_out(created_before, self.batch_size).await?;
        let mut summary = FanOutSweepSummary { found: pending.len(), ..Default::default() };

        for trace_id in pending {
            match self.orchestrator.process_new_trace(trace_id).await {
                Ok(fan_out) if fan_out.complete => summary.completed += 1,
                Ok(fan_out) => {
                    warn!(
                        trace_id = %trace_id,
                        errors = fan_out.errors,
                        "fan-out still incomplete"
                    );
                    summary.errors += 1;
                },
                Err(e) => {
                    warn!(trace_id = %trace_id, error = %e, "fan-out sweep failed for trace");
                    summary.errors += 1;
                },
            }
        }

        Ok(summary)
    }

    /// Sweeps every `interval` until cancelled.
    pub async fn run(&self, interval: Duration, cancellation_token: CancellationToken) {
        info!(
            interval_secs = interval.as_secs(),
            grace_secs = self.grace.as_secs(),
            "fan-out sweeper starting"
        );
        let clock = self.orchestrator.clock().clone();

        loop {
            if cancellation_token.is_cancelled() {
                break;
            }

            let pause = match self.sweep_once().await {
                Ok(summary) => {
                    if summary.found > 0 {
                        info!(
                            found = summary.found,
                            completed = summary.completed,
                            errors = summary.errors,
                            "fan-out sweep completed"
                        );
                    }
                    interval
                },
                Err(e) => {
                    error!(error = %e, "fan-out sweep failed");
                    ERROR_BACKOFF
                },
            };

            tokio::select! {
                () = clock.sleep(pause) => {}
                () = cancellation_token.cancelled() => break,
            }
        }

        info!("fan-out sweeper stopped");
    }
}

/// Deletes expired traces and cancels their open deliveries.
#[derive(Clone)]
pub struct ExpirySweeper {
    orchestrator: Arc<Orchestrator>,
    batch_size: usize,
}

impl ExpirySweeper {
    /// Creates a sweeper expiring up to `batch_size` traces per batch.
    pub fn new(orchestrator: Arc<Orchestrator>, batch_size: usize) -> Self {
        Self { orchestrator, batch_size: batch_size.max(1) }
    }

    /// Expires one batch of traces whose `expires_at` has passed.
    ///
    /// # Errors
    ///
    /// Returns a database error if the batch fails; nothing is changed then.
    pub async fn sweep_once(&self) -> Result<ExpirySummary> {
        let now = self.orchestrator.clock().now_utc();
        let summary = self.orchestrator.storage().expire_traces(now, self.batch_size).await?;

        if summary.traces_deleted > 0 {
            let mut stats = self.orchestrator.stats().write().await;
            stats.traces_expired += summary.traces_deleted;
            stats.cancelled += summary.deliveries_cancelled;
        }

        Ok(summary)
    }

    /// Expires traces every `interval` until cancelled, draining the backlog
    /// batch by batch.
    pub async fn run(&self, interval: Duration, cancellation_token: CancellationToken) {
        info!(
            interval_secs = interval.as_secs(),
            batch_size = self.batch_size,
            "expiry sweeper starting"
        );
        let clock = self.orchestrator.clock().clone();
        let batch_size = u64::try_from(self.batch_size).unwrap_or(u64::MAX);

        loop {
            if cancellation_token.is_cancelled() {
                break;
            }

            let pause = match self.sweep_once().await {
                Ok(summary) if summary.traces_deleted >= batch_size => Duration::ZERO,
                Ok(summary) => {
                    if summary.traces_deleted > 0 {
                        info!(
                            traces_deleted = summary.traces_deleted,
                            deliveries_cancelled = summary.deliveries_cancelled,
                            "expired traces removed"
                        );
                    }
                    interval
                },
                Err(e) => {
                    error!(error = %e, "expiry sweep failed");
                    ERROR_BACKOFF
                },
            };

            if pause.is_zero() {
                continue;
            }
            tokio::select! {
                () = clock.sleep(pause) => {}
                () = cancellation_token.cancelled() => break,
            }
        }

        info!("expiry sweeper stopped");
    }
}
