//! Delivery state machine and trace fan-out.
//!
//! The orchestrator owns every status change of a delivery record. Each
//! attempt runs under a claim; every write is conditional on that claim, so
//! an attempt whose record was cancelled or re-claimed writes nothing.
//! Failures are isolated per destination.

use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures::{future::join_all, FutureExt};
use tokio::sync::RwLock;
use tracerelay_core::{
    models::{
        ClaimedRecord, DeliveryId, DeliveryStatus, Destination, Trace, TraceId, Transition,
    },
    Clock, DeliveryCancelledEvent, DeliveryDeferredEvent, DeliveryEvent, DeliveryFailedEvent,
    DeliveryRetryScheduledEvent, DeliverySucceededEvent, EventHandler, NoOpEventHandler,
};
use tracing::{debug, error, info, warn};

use crate::{
    adapter::{AdapterRegistry, AdapterResult, DeliveryContext},
    crypto::{ConfigDecryptor, PlaintextConfig},
    engine::EngineStats,
    error::{DeliveryError, Result},
    rate_limit::{Admission, RateLimiter},
    registry::DestinationRegistry,
    retry::{RetryContext, RetryDecision, RetryPolicy},
    storage::DeliveryStorage,
    transform::TransformExecutor,
};

/// Error recorded when the attempt cap is hit before an attempt.
pub const MAX_RETRIES_EXCEEDED: &str = "max retries exceeded";

/// Error recorded when a non-pending record's destination disabled retries.
pub const RETRIES_DISABLED: &str = "retries disabled";

/// Reason recorded when the record's trace no longer exists.
pub const TRACE_EXPIRED: &str = tracerelay_core::storage::traces::TRACE_EXPIRED;

/// Reason recorded when the record's destination no longer exists.
pub const DESTINATION_REMOVED: &str = "destination removed";

/// Timing knobs for delivery attempts.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How long a claim stays exclusive. Must cover transform plus adapter
    /// time.
    pub claim_lease: Duration,
    /// Budget for one adapter call.
    pub adapter_timeout: Duration,
    /// Jitter fraction applied to retry delays.
    pub jitter_factor: f64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            claim_lease: Duration::from_secs(120),
            adapter_timeout: Duration::from_secs(30),
            jitter_factor: 0.0,
        }
    }
}

/// What happened to one claimed record.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// The adapter accepted the payload.
    Delivered,
    /// The attempt failed; another one is scheduled.
    RetryScheduled {
        /// When the next attempt is due
        next_retry_at: DateTime<Utc>,
    },
    /// The rate limit was saturated; no attempt was made.
    Deferred {
        /// When the record is due again
        until: DateTime<Utc>,
    },
    /// The record failed terminally.
    Failed {
        /// Final error
        error: String,
    },
    /// The record was cancelled.
    Cancelled {
        /// Recorded reason
        reason: String,
    },
    /// The claim was lost before the outcome could be written.
    ClaimLost,
}

/// Result of fanning out one trace.
#[derive(Debug, Clone, Default)]
pub struct FanOutSummary {
    /// Active destinations found for the trace's organization.
    pub destinations: usize,
    /// Records created by this call; zero on a repeated call.
    pub records_created: usize,
    /// Outcome per record processed by this call.
    pub outcomes: Vec<(DeliveryId, AttemptOutcome)>,
    /// Destinations whose processing hit an internal error.
    pub errors: usize,
    /// Every destination has a record and the trace was marked fanned out.
    pub complete: bool,
}

/// Drives delivery records through their lifecycle.
pub struct Orchestrator {
    storage: Arc<dyn DeliveryStorage>,
    destinations: DestinationRegistry,
    rate_limiter: RateLimiter,
    transforms: TransformExecutor,
    adapters: AdapterRegistry,
    decryptor: Arc<dyn ConfigDecryptor>,
    clock: Arc<dyn Clock>,
    event_handler: Arc<dyn EventHandler>,
    stats: Arc<RwLock<EngineStats>>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    /// Creates an orchestrator with the template transform sandbox,
    /// plaintext configs and no event subscribers.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        adapters: AdapterRegistry,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            destinations: DestinationRegistry::new(storage.clone()),
            rate_limiter: RateLimiter::new(storage.clone()),
            storage,
            transforms: TransformExecutor::default(),
            adapters,
            decryptor: Arc::new(PlaintextConfig),
            clock,
            event_handler: Arc::new(NoOpEventHandler::new()),
            stats: Arc::new(RwLock::new(EngineStats::default())),
            config: OrchestratorConfig::default(),
        }
    }

    /// Replaces the transform executor.
    #[must_use]
    pub fn with_transforms(mut self, transforms: TransformExecutor) -> Self {
        self.transforms = transforms;
        self
    }

    /// Replaces the config decryptor.
    #[must_use]
    pub fn with_decryptor(mut self, decryptor: Arc<dyn ConfigDecryptor>) -> Self {
        self.decryptor = decryptor;
        self
    }

    /// Replaces the event handler.
    #[must_use]
    pub fn with_event_handler(mut self, event_handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = event_handler;
        self
    }

    /// Shares a statistics handle with the caller.
    #[must_use]
    pub fn with_stats(mut self, stats: Arc<RwLock<EngineStats>>) -> Self {
        self.stats = stats;
        self
    }

    /// Replaces timing configuration.
    #[must_use]
    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Timing configuration in use.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Storage the orchestrator writes to.
    pub fn storage(&self) -> &Arc<dyn DeliveryStorage> {
        &self.storage
    }

    /// Clock the orchestrator reads.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Statistics handle.
    pub fn stats(&self) -> &Arc<RwLock<EngineStats>> {
        &self.stats
    }

    /// Claims up to `batch_size` due records under this orchestrator's lease.
    ///
    /// # Errors
    ///
    /// Returns a database error if storage fails.
    pub async fn claim_due_records(&self, batch_size: usize) -> Result<Vec<ClaimedRecord>> {
        let now = self.clock.now_utc();
        Ok(self.storage.claim_due_records(now, batch_size, self.lease_until(now)).await?)
    }

    fn lease_until(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + chrono::Duration::from_std(self.config.claim_lease)
            .unwrap_or_else(|_| chrono::Duration::seconds(120))
    }

    /// Creates one delivery record per active destination of the trace's
    /// organization and attempts each record that is due and unclaimed.
    ///
    /// Repeated calls never create duplicate records. Destinations are
    /// processed concurrently and independently. Once no destination hit an
    /// error the trace is marked fanned out; until then the fan-out sweep
    /// keeps calling this again.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the trace or its organization does not exist,
    /// or a database error if the initial lookups fail. Per-destination
    /// errors are logged and counted in the summary.
    pub async fn process_new_trace(&self, trace_id: TraceId) -> Result<FanOutSummary> {
        let trace = self
            .storage
            .find_trace(trace_id)
            .await?
            .ok_or_else(|| DeliveryError::not_found("trace", trace_id))?;

        let destinations = match self.destinations.list_active_destinations(trace.org_id).await {
            Ok(destinations) => destinations,
            Err(e @ DeliveryError::NotFound { .. }) => {
                // an unknown organization has nothing to fan out to, ever
                self.storage.mark_trace_fanned_out(trace_id, self.clock.now_utc()).await?;
                return Err(e);
            },
            Err(e) => return Err(e),
        };

        debug!(
            trace_id = %trace_id,
            org_id = %trace.org_id,
            destination_count = destinations.len(),
            "fanning out trace"
        );

        let results =
            join_all(destinations.iter().map(|destination| self.fan_out_one(&trace, destination)))
                .await;

        let mut summary = FanOutSummary { destinations: destinations.len(), ..Default::default() };
        for (destination, result) in destinations.iter().zip(results) {
            match result {
                Ok((created, outcome)) => {
                    if created {
                        summary.records_created += 1;
                    }
                    if let Some(outcome) = outcome {
                        summary.outcomes.push(outcome);
                    }
                },
                Err(e) => {
                    error!(
                        trace_id = %trace_id,
                        destination_id = %destination.id,
                        error = %e,
                        "fan-out to destination failed"
                    );
                    summary.errors += 1;
                },
            }
        }

        if summary.errors == 0 {
            self.storage.mark_trace_fanned_out(trace_id, self.clock.now_utc()).await?;
            summary.complete = true;
            self.stats.write().await.traces_ingested += 1;
        }

        Ok(summary)
    }

    async fn fan_out_one(
        &self,
        trace: &Trace,
        destination: &Destination,
    ) -> Result<(bool, Option<(DeliveryId, AttemptOutcome)>)> {
        let now = self.clock.now_utc();
        let (record, created) =
            self.storage.upsert_delivery_record(trace.id, destination.id, now).await?;

        let Some(claimed) = self.storage.claim_record(record.id, now, self.lease_until(now)).await?
        else {
            debug!(
                record_id = %record.id,
                status = %record.status,
                "record not claimable, skipping"
            );
            return Ok((created, None));
        };

        let outcome = self.run_claimed(claimed, Some(trace), destination).await?;
        Ok((created, Some((record.id, outcome))))
    }

    /// Processes a record claimed by a sweep.
    ///
    /// Loads the record's trace and destination and runs one step of the
    /// state machine.
    ///
    /// # Errors
    ///
    /// Returns a database error if storage fails.
    pub async fn process_claimed(&self, claimed: ClaimedRecord) -> Result<AttemptOutcome> {
        let Some(destination) = self.destinations.find(claimed.record.destination_id).await? else {
            return self.cancel_claimed(&claimed, DESTINATION_REMOVED.to_string()).await;
        };
        let trace = self.storage.find_trace(claimed.record.trace_id).await?;

        self.run_claimed(claimed, trace.as_ref(), &destination).await
    }

    /// Cancels a non-terminal record.
    ///
    /// Drops any claim so an in-flight attempt's result is discarded and a
    /// scheduled retry becomes a no-op. Returns false if the record does not
    /// exist or is already terminal.
    ///
    /// # Errors
    ///
    /// Returns a database error if storage fails.
    pub async fn cancel_delivery(&self, id: DeliveryId, reason: impl Into<String>) -> Result<bool> {
        let reason = reason.into();
        let now = self.clock.now_utc();
        let cancelled = self.storage.cancel_record(id, reason.clone(), now).await?;

        if cancelled {
            info!(record_id = %id, reason = %reason, "delivery cancelled");
            self.stats.write().await.cancelled += 1;
            self.publish(DeliveryEvent::Cancelled(DeliveryCancelledEvent {
                delivery_id: id,
                cancelled_at: now,
                reason,
            }))
            .await;
        }

        Ok(cancelled)
    }

    async fn run_claimed(
        &self,
        claimed: ClaimedRecord,
        trace: Option<&Trace>,
        destination: &Destination,
    ) -> Result<AttemptOutcome> {
        {
            let mut stats = self.stats.write().await;
            stats.in_flight += 1;
        }

        let result = self.step(&claimed, trace, destination).await;

        {
            let mut stats = self.stats.write().await;
            stats.in_flight -= 1;
            stats.records_processed += 1;
        }

        result
    }

    #[allow(clippy::too_many_lines)]
    async fn step(
        &self,
        claimed: &ClaimedRecord,
        trace: Option<&Trace>,
        destination: &Destination,
    ) -> Result<AttemptOutcome> {
        let record = &claimed.record;
        let now = self.clock.now_utc();

        if record.status.is_terminal() {
            return Ok(AttemptOutcome::ClaimLost);
        }

        let Some(trace) = trace else {
            return self.cancel_claimed(claimed, TRACE_EXPIRED.to_string()).await;
        };

        let attempts = u32::try_from(record.attempts).unwrap_or(0);
        let policy = RetryPolicy::for_destination(destination, self.config.jitter_factor);

        if !destination.retry_enabled && record.status != DeliveryStatus::Pending {
            return self
                .fail(claimed, destination, attempts, false, RETRIES_DISABLED.to_string(), now)
                .await;
        }

        if policy.is_exhausted(attempts) {
            return self
                .fail(claimed, destination, attempts, false, MAX_RETRIES_EXCEEDED.to_string(), now)
                .await;
        }

        if let Admission::Deferred { until } =
            self.rate_limiter.admit(claimed.claim, destination, now).await?
        {
            return self.defer(claimed, until, now).await;
        }

        let transform = self.transforms.resolve(trace, destination).await;
        if let Some(warning) = &transform.warning {
            warn!(
                record_id = %record.id,
                destination_id = %destination.id,
                warning = %warning,
                "transform fell back to raw trace data"
            );
        }

        let attempt = attempts.saturating_add(1);

        let adapter = match self.adapters.resolve(&destination.provider_type) {
            Ok(adapter) => adapter,
            Err(e) => {
                warn!(
                    record_id = %record.id,
                    provider_type = %destination.provider_type,
                    "no adapter registered for provider"
                );
                return self.fail(claimed, destination, attempt, false, e.to_string(), now).await;
            },
        };

        let config = match self.decryptor.decrypt(&destination.config) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    record_id = %record.id,
                    destination_id = %destination.id,
                    error = %e,
                    "destination config unusable"
                );
                return self.fail(claimed, destination, attempt, false, e.to_string(), now).await;
            },
        };

        debug!(
            record_id = %record.id,
            destination_id = %destination.id,
            attempt,
            provider_type = %destination.provider_type,
            "attempting delivery"
        );

        let ctx = DeliveryContext {
            trace,
            config: &config,
            payload: &transform.payload,
            attempt,
            timeout: self.config.adapter_timeout,
        };
        let result = self.call_adapter(adapter.deliver(&ctx), record.id).await;
        let finished_at = self.clock.now_utc();

        if result.success {
            let transition = Transition::Delivered {
                at: finished_at,
                transformed_payload: transform.payload,
                response_data: result.response_data,
            };
            if !self.storage.apply_transition(claimed.claim, transition, finished_at).await? {
                return Ok(self.claim_lost(claimed));
            }

            info!(
                record_id = %record.id,
                destination_id = %destination.id,
                attempt,
                "trace delivered"
            );
            self.stats.write().await.delivered += 1;
            self.publish(DeliveryEvent::Succeeded(DeliverySucceededEvent {
                delivery_id: record.id,
                trace_id: record.trace_id,
                destination_id: destination.id,
                org_id: trace.org_id,
                provider_type: destination.provider_type.clone(),
                attempt_number: attempt,
                delivered_at: finished_at,
            }))
            .await;
            return Ok(AttemptOutcome::Delivered);
        }

        let error = result.error.unwrap_or_else(|| "delivery failed".to_string());
        let decision =
            RetryContext::new(attempt, result.permanent, finished_at, policy).decide_retry();

        match decision {
            RetryDecision::Retry { next_attempt_at } => {
                self.schedule_retry(
                    claimed,
                    destination,
                    attempt,
                    next_attempt_at,
                    error,
                    finished_at,
                )
                .await
            },
            RetryDecision::GiveUp { reason } => {
                debug!(record_id = %record.id, reason = %reason, "not retrying");
                self.fail(claimed, destination, attempt, true, error, finished_at).await
            },
        }
    }

    /// Runs an adapter call under the attempt budget. Panics and timeouts
    /// become generic failures.
    async fn call_adapter<F>(&self, call: F, record_id: DeliveryId) -> AdapterResult
    where
        F: std::future::Future<Output = AdapterResult>,
    {
        let timeout = self.config.adapter_timeout;
        match tokio::time::timeout(timeout, AssertUnwindSafe(call).catch_unwind()).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                error!(record_id = %record_id, "adapter panicked");
                AdapterResult::failed("adapter panicked")
            },
            Err(_) => {
                let timeout_ms = timeout.as_millis();
                warn!(record_id = %record_id, timeout_ms, "adapter timed out");
                AdapterResult::failed(DeliveryError::timeout(timeout).to_string())
            },
        }
    }

    async fn schedule_retry(
        &self,
        claimed: &ClaimedRecord,
        destination: &Destination,
        attempts: u32,
        next_retry_at: DateTime<Utc>,
        error: String,
        at: DateTime<Utc>,
    ) -> Result<AttemptOutcome> {
        let transition = Transition::RetryScheduled {
            attempts: i32::try_from(attempts).unwrap_or(i32::MAX),
            at,
            next_retry_at,
            error: error.clone(),
        };
        if !self.storage.apply_transition(claimed.claim, transition, at).await? {
            return Ok(self.claim_lost(claimed));
        }

        warn!(
            record_id = %claimed.record.id,
            destination_id = %destination.id,
            attempt = attempts,
            next_retry_at = %next_retry_at,
            error = %error,
            "delivery failed, retry scheduled"
        );
        self.stats.write().await.retries_scheduled += 1;
        self.publish(DeliveryEvent::RetryScheduled(DeliveryRetryScheduledEvent {
            delivery_id: claimed.record.id,
            trace_id: claimed.record.trace_id,
            destination_id: destination.id,
            attempts,
            next_retry_at,
            error_message: error,
        }))
        .await;

        Ok(AttemptOutcome::RetryScheduled { next_retry_at })
    }

    async fn fail(
        &self,
        claimed: &ClaimedRecord,
        destination: &Destination,
        attempts: u32,
        attempted: bool,
        error: String,
        at: DateTime<Utc>,
    ) -> Result<AttemptOutcome> {
        let transition = Transition::Failed {
            attempts: i32::try_from(attempts).unwrap_or(i32::MAX),
            at,
            attempted,
            error: error.clone(),
        };
        if !self.storage.apply_transition(claimed.claim, transition, at).await? {
            return Ok(self.claim_lost(claimed));
        }

        error!(
            record_id = %claimed.record.id,
            destination_id = %destination.id,
            attempts,
            error = %error,
            "delivery failed permanently"
        );
        self.stats.write().await.failed += 1;
        self.publish(DeliveryEvent::Failed(DeliveryFailedEvent {
            delivery_id: claimed.record.id,
            trace_id: claimed.record.trace_id,
            destination_id: destination.id,
            attempts,
            failed_at: at,
            error_message: error.clone(),
        }))
        .await;

        Ok(AttemptOutcome::Failed { error })
    }

    async fn defer(
        &self,
        claimed: &ClaimedRecord,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<AttemptOutcome> {
        let transition = Transition::Deferred { next_retry_at: until };
        if !self.storage.apply_transition(claimed.claim, transition, now).await? {
            return Ok(self.claim_lost(claimed));
        }

        debug!(
            record_id = %claimed.record.id,
            destination_id = %claimed.record.destination_id,
            until = %until,
            "rate limit saturated, delivery deferred"
        );
        self.stats.write().await.deferred += 1;
        self.publish(DeliveryEvent::Deferred(DeliveryDeferredEvent {
            delivery_id: claimed.record.id,
            destination_id: claimed.record.destination_id,
            next_retry_at: until,
        }))
        .await;

        Ok(AttemptOutcome::Deferred { until })
    }

    async fn cancel_claimed(
        &self,
        claimed: &ClaimedRecord,
        reason: String,
    ) -> Result<AttemptOutcome> {
        let now = self.clock.now_utc();
        let transition = Transition::Cancelled { at: now, reason: reason.clone() };
        if !self.storage.apply_transition(claimed.claim, transition, now).await? {
            return Ok(self.claim_lost(claimed));
        }

        info!(record_id = %claimed.record.id, reason = %reason, "delivery cancelled");
        self.stats.write().await.cancelled += 1;
        self.publish(DeliveryEvent::Cancelled(DeliveryCancelledEvent {
            delivery_id: claimed.record.id,
            cancelled_at: now,
            reason: reason.clone(),
        }))
        .await;

        Ok(AttemptOutcome::Cancelled { reason })
    }

    fn claim_lost(&self, claimed: &ClaimedRecord) -> AttemptOutcome {
        warn!(
            record_id = %claimed.record.id,
            "claim lost before outcome was recorded, discarding"
        );
        AttemptOutcome::ClaimLost
    }

    async fn publish(&self, event: DeliveryEvent) {
        self.event_handler.handle_event(event).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;
    use tracerelay_core::{
        models::{DeliveryRecord, DestinationId, OrgId, Organization},
        TestClock,
    };

    use super::*;
    use crate::{
        adapter::{Adapter, AdapterResult},
        crypto::ChaChaConfigDecryptor,
        storage::memory::MemoryStorage,
    };

    #[derive(Debug, Default)]
    struct Scripted {
        calls: AtomicUsize,
        fail: bool,
        permanent: bool,
    }

    #[async_trait::async_trait]
    impl Adapter for Scripted {
        async fn deliver(&self, _ctx: &DeliveryContext<'_>) -> AdapterResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match (self.fail, self.permanent) {
                (false, _) => AdapterResult::delivered(json!({"ok": true})),
                (true, false) => AdapterResult::failed("server error: HTTP 500"),
                (true, true) => AdapterResult::permanent_failure("rejected"),
            }
        }
    }

    struct Fixture {
        storage: MemoryStorage,
        clock: TestClock,
        trace: Trace,
        destination: Destination,
    }

    async fn fixture(provider: &str) -> Fixture {
        let storage = MemoryStorage::new();
        let clock = TestClock::new();
        let now = clock.now_utc();
        let org = Organization { id: OrgId::new(), name: "acme".to_string(), created_at: now };
        storage.add_organization(&org).await;

        let trace = Trace {
            id: TraceId::new(),
            org_id: org.id,
            external_trace_id: None,
            span_id: None,
            parent_span_id: None,
            data: json!({"prompt": "hi"}),
            metadata: json!({}),
            created_at: now,
            expires_at: now + chrono::Duration::days(30),
        };
        storage.add_trace(trace.clone()).await;

        let destination = Destination {
            id: DestinationId::new(),
            org_id: org.id,
            name: "primary".to_string(),
            provider_type: provider.to_string(),
            config: "{}".to_string(),
            is_active: true,
            priority: 0,
            transform_function: None,
            rate_limit: None,
            retry_enabled: true,
            max_retries: 5,
            retry_delay_ms_base: 1000,
            created_at: now,
        };
        storage.add_destination(destination.clone()).await;

        Fixture { storage, clock, trace, destination }
    }

    fn orchestrator(fixture: &Fixture, adapter: Arc<Scripted>) -> Orchestrator {
        let mut adapters = AdapterRegistry::new();
        adapters.register("scripted", adapter);
        Orchestrator::new(
            Arc::new(fixture.storage.clone()),
            adapters,
            Arc::new(fixture.clock.clone()),
        )
    }

    async fn only_record(storage: &MemoryStorage) -> DeliveryRecord {
        let records = storage.all_records().await;
        assert_eq!(records.len(), 1);
        records.into_iter().next().unwrap()
    }

    #[tokio::test]
    async fn successful_delivery_persists_payload_and_response() {
        let fixture = fixture("scripted").await;
        let adapter = Arc::new(Scripted::default());
        let orchestrator = orchestrator(&fixture, adapter.clone());

        let summary = orchestrator.process_new_trace(fixture.trace.id).await.unwrap();

        assert_eq!(summary.records_created, 1);
        assert_eq!(summary.outcomes[0].1, AttemptOutcome::Delivered);
        let record = only_record(&fixture.storage).await;
        assert_eq!(record.status, DeliveryStatus::Success);
        assert_eq!(record.delivered_at, Some(fixture.clock.now_utc()));
        assert_eq!(record.transformed_payload, Some(fixture.trace.data.clone()));
        assert_eq!(record.response_data, Some(json!({"ok": true})));
        assert_eq!(record.attempts, 0);
        assert!(record.claim_token.is_none());
        assert_eq!(orchestrator.stats().read().await.delivered, 1);
    }

    #[tokio::test]
    async fn unknown_provider_fails_without_retry() {
        let fixture = fixture("carrier-pigeon").await;
        let adapter = Arc::new(Scripted::default());
        let orchestrator = orchestrator(&fixture, adapter.clone());

        orchestrator.process_new_trace(fixture.trace.id).await.unwrap();

        let record = only_record(&fixture.storage).await;
        assert_eq!(record.status, DeliveryStatus::Failed);
        assert_eq!(record.last_error.as_deref(), Some("unsupported provider"));
        assert_eq!(record.attempts, 1);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn undecryptable_config_fails_without_retry() {
        let mut fixture = fixture("scripted").await;
        let sealed = ChaChaConfigDecryptor::new([1; 32]).seal(&json!({"url": "x"})).unwrap();
        fixture.destination.config = sealed;
        fixture.storage.add_destination(fixture.destination.clone()).await;

        let adapter = Arc::new(Scripted::default());
        let orchestrator = orchestrator(&fixture, adapter.clone())
            .with_decryptor(Arc::new(ChaChaConfigDecryptor::new([2; 32])));

        orchestrator.process_new_trace(fixture.trace.id).await.unwrap();

        let record = only_record(&fixture.storage).await;
        assert_eq!(record.status, DeliveryStatus::Failed);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn permanent_adapter_failure_is_terminal() {
        let fixture = fixture("scripted").await;
        let adapter = Arc::new(Scripted { fail: true, permanent: true, ..Default::default() });
        let orchestrator = orchestrator(&fixture, adapter);

        orchestrator.process_new_trace(fixture.trace.id).await.unwrap();

        let record = only_record(&fixture.storage).await;
        assert_eq!(record.status, DeliveryStatus::Failed);
        assert_eq!(record.last_error.as_deref(), Some("rejected"));
        assert_eq!(record.attempts, 1);
    }

    #[tokio::test]
    async fn disabled_retries_fail_after_first_attempt() {
        let mut fixture = fixture("scripted").await;
        fixture.destination.retry_enabled = false;
        fixture.storage.add_destination(fixture.destination.clone()).await;

        let adapter = Arc::new(Scripted { fail: true, ..Default::default() });
        let orchestrator = orchestrator(&fixture, adapter);

        orchestrator.process_new_trace(fixture.trace.id).await.unwrap();

        let record = only_record(&fixture.storage).await;
        assert_eq!(record.status, DeliveryStatus::Failed);
        assert_eq!(record.attempts, 1);
    }

    #[tokio::test]
    async fn retrying_record_fails_once_retries_are_disabled() {
        let mut fixture = fixture("scripted").await;
        let adapter = Arc::new(Scripted::default());
        let orchestrator = orchestrator(&fixture, adapter.clone());

        let now = fixture.clock.now_utc();
        let mut record = DeliveryRecord::new(fixture.trace.id, fixture.destination.id, now);
        record.status = DeliveryStatus::Retrying;
        record.attempts = 1;
        fixture.storage.put_record(record.clone()).await;

        fixture.destination.retry_enabled = false;
        fixture.storage.add_destination(fixture.destination.clone()).await;

        let lease = now + chrono::Duration::seconds(60);
        let claimed = fixture.storage.claim_record(record.id, now, lease).await.unwrap().unwrap();
        let outcome = orchestrator.process_claimed(claimed).await.unwrap();

        assert_eq!(outcome, AttemptOutcome::Failed { error: RETRIES_DISABLED.to_string() });
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn exhausted_record_fails_before_calling_adapter() {
        let fixture = fixture("scripted").await;
        let adapter = Arc::new(Scripted::default());
        let orchestrator = orchestrator(&fixture, adapter.clone());

        let now = fixture.clock.now_utc();
        let mut record = DeliveryRecord::new(fixture.trace.id, fixture.destination.id, now);
        record.status = DeliveryStatus::Retrying;
        record.attempts = 5;
        fixture.storage.put_record(record.clone()).await;

        let lease = now + chrono::Duration::seconds(60);
        let claimed = fixture.storage.claim_record(record.id, now, lease).await.unwrap().unwrap();
        let outcome = orchestrator.process_claimed(claimed).await.unwrap();

        assert_eq!(outcome, AttemptOutcome::Failed { error: MAX_RETRIES_EXCEEDED.to_string() });
        let stored = only_record(&fixture.storage).await;
        assert_eq!(stored.last_error.as_deref(), Some("max retries exceeded"));
        assert_eq!(stored.attempts, 5);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_trace_cancels_record() {
        let fixture = fixture("scripted").await;
        let adapter = Arc::new(Scripted::default());
        let orchestrator = orchestrator(&fixture, adapter.clone());

        let now = fixture.clock.now_utc();
        let record = DeliveryRecord::new(fixture.trace.id, fixture.destination.id, now);
        fixture.storage.put_record(record.clone()).await;
        fixture.storage.remove_trace(fixture.trace.id).await;

        let lease = now + chrono::Duration::seconds(60);
        let claimed = fixture.storage.claim_record(record.id, now, lease).await.unwrap().unwrap();
        let outcome = orchestrator.process_claimed(claimed).await.unwrap();

        assert_eq!(outcome, AttemptOutcome::Cancelled { reason: "trace expired".to_string() });
        assert_eq!(only_record(&fixture.storage).await.status, DeliveryStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_delivery_is_terminal_and_idempotent() {
        let fixture = fixture("scripted").await;
        let orchestrator = orchestrator(&fixture, Arc::new(Scripted::default()));

        let now = fixture.clock.now_utc();
        let record = DeliveryRecord::new(fixture.trace.id, fixture.destination.id, now);
        fixture.storage.put_record(record.clone()).await;

        assert!(orchestrator.cancel_delivery(record.id, "operator request").await.unwrap());
        assert!(!orchestrator.cancel_delivery(record.id, "again").await.unwrap());

        let stored = only_record(&fixture.storage).await;
        assert_eq!(stored.status, DeliveryStatus::Cancelled);
        assert_eq!(stored.last_error.as_deref(), Some("operator request"));
    }

    #[tokio::test]
    async fn missing_trace_is_not_found() {
        let fixture = fixture("scripted").await;
        let orchestrator = orchestrator(&fixture, Arc::new(Scripted::default()));

        let err = orchestrator.process_new_trace(TraceId::new()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::NotFound { entity: "trace", .. }));
    }
}
