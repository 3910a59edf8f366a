//! Shared fixtures for delivery integration tests.

#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use serde_json::{json, Value};
use tokio::sync::Notify;
use tracerelay_core::{
    models::{DeliveryRecord, Destination, DestinationId, OrgId, Organization, Trace, TraceId},
    Clock, TestClock,
};
use tracerelay_delivery::{
    storage::memory::MemoryStorage, Adapter, AdapterRegistry, AdapterResult, DeliveryContext,
    Orchestrator,
};

/// One organization with in-memory storage and a controllable clock.
pub struct World {
    pub storage: MemoryStorage,
    pub clock: TestClock,
    pub org: Organization,
}

impl World {
    pub async fn new() -> Self {
        let storage = MemoryStorage::new();
        let clock = TestClock::new();
        let created_at = clock.now_utc();
        let org = Organization { id: OrgId::new(), name: "acme".to_string(), created_at };
        storage.add_organization(&org).await;
        Self { storage, clock, org }
    }

    pub async fn trace(&self, data: Value) -> Trace {
        let now = self.clock.now_utc();
        let trace = Trace {
            id: TraceId::new(),
            org_id: self.org.id,
            external_trace_id: Some("external-1".to_string()),
            span_id: None,
            parent_span_id: None,
            data,
            metadata: json!({"env": "test"}),
            created_at: now,
            expires_at: now + chrono::Duration::days(30),
        };
        self.storage.add_trace(trace.clone()).await;
        trace
    }

    pub async fn destination(
        &self,
        name: &str,
        provider_type: &str,
        customize: impl FnOnce(&mut Destination),
    ) -> Destination {
        let mut destination = Destination {
            id: DestinationId::new(),
            org_id: self.org.id,
            name: name.to_string(),
            provider_type: provider_type.to_string(),
            config: "{}".to_string(),
            is_active: true,
            priority: 0,
            transform_function: None,
            rate_limit: None,
            retry_enabled: true,
            max_retries: 5,
            retry_delay_ms_base: 1000,
            created_at: self.clock.now_utc(),
        };
        customize(&mut destination);
        self.storage.add_destination(destination.clone()).await;
        destination
    }

    pub fn orchestrator(&self, adapters: AdapterRegistry) -> Orchestrator {
        Orchestrator::new(Arc::new(self.storage.clone()), adapters, Arc::new(self.clock.clone()))
    }

    pub async fn record_for(
        &self,
        trace_id: TraceId,
        destination_id: DestinationId,
    ) -> DeliveryRecord {
        self.storage
            .all_records()
            .await
            .into_iter()
            .find(|r| r.trace_id == trace_id && r.destination_id == destination_id)
            .expect("record exists")
    }

    pub fn advance(&self, duration: Duration) {
        self.clock.advance(duration);
    }
}

/// What a [`RecordingAdapter`] does when called.
#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    Succeed,
    Fail,
    Panic,
    Sleep(Duration),
}

/// Adapter that records every payload it receives.
#[derive(Debug)]
pub struct RecordingAdapter {
    behavior: Behavior,
    calls: AtomicUsize,
    payloads: Mutex<Vec<Value>>,
}

impl RecordingAdapter {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self { behavior, calls: AtomicUsize::new(0), payloads: Mutex::new(Vec::new()) })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn payloads(&self) -> Vec<Value> {
        self.payloads.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Adapter for RecordingAdapter {
    async fn deliver(&self, ctx: &DeliveryContext<'_>) -> AdapterResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.payloads.lock().unwrap().push(ctx.payload.clone());

        match self.behavior {
            Behavior::Succeed => AdapterResult::delivered(json!({"status": 200})),
            Behavior::Fail => AdapterResult::failed("server error: HTTP 503"),
            Behavior::Panic => panic!("adapter exploded"),
            Behavior::Sleep(duration) => {
                tokio::time::sleep(duration).await;
                AdapterResult::delivered(json!({"status": 200}))
            },
        }
    }
}

/// Adapter that blocks until released, for in-flight scenarios.
#[derive(Debug, Default)]
pub struct GatedAdapter {
    pub started: Notify,
    pub release: Notify,
}

#[async_trait::async_trait]
impl Adapter for GatedAdapter {
    async fn deliver(&self, _ctx: &DeliveryContext<'_>) -> AdapterResult {
        self.started.notify_one();
        self.release.notified().await;
        AdapterResult::delivered(json!({"status": 200}))
    }
}

pub fn registry(entries: &[(&str, Arc<dyn Adapter>)]) -> AdapterRegistry {
    let mut registry = AdapterRegistry::new();
    for (provider, adapter) in entries {
        registry.register(*provider, adapter.clone());
    }
    registry
}
