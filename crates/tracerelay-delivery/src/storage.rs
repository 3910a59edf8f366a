//! Storage abstraction layer for the delivery engine.
//!
//! The orchestrator and sweepers only talk to `DeliveryStorage`. Production
//! wraps the PostgreSQL repositories from `tracerelay_core::storage`; tests
//! use `memory::MemoryStorage`, which implements the same claim and
//! transition semantics under a single lock.

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use tracerelay_core::{
    error::Result,
    models::{
        Claim, ClaimedRecord, DeliveryId, DeliveryRecord, Destination, DestinationId,
        ExpirySummary, OrgId, Trace, TraceId, Transition,
    },
    storage::Storage,
};

/// Boxed future returned by storage operations.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Storage operations required by the delivery engine.
pub trait DeliveryStorage: Send + Sync + 'static {
    /// Returns true if the organization exists.
    fn organization_exists(&self, org_id: OrgId) -> StorageFuture<'_, bool>;

    /// Loads a trace; `None` once it has expired and been deleted.
    fn find_trace(&self, trace_id: TraceId) -> StorageFuture<'_, Option<Trace>>;

    /// Loads a destination, active or not.
    fn find_destination(
        &self,
        destination_id: DestinationId,
    ) -> StorageFuture<'_, Option<Destination>>;

    /// Marks a trace as fanned out. Returns false if already marked or gone.
    fn mark_trace_fanned_out(
        &self,
        trace_id: TraceId,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, bool>;

    /// Lists up to `batch_size` traces created before `created_before` that
    /// were never marked fanned out, oldest first.
    fn list_pending_fan_out(
        &self,
        created_before: DateTime<Utc>,
        batch_size: usize,
    ) -> StorageFuture<'_, Vec<TraceId>>;

    /// Lists active destinations by priority descending, then creation time
    /// and ID ascending.
    fn list_active_destinations(&self, org_id: OrgId) -> StorageFuture<'_, Vec<Destination>>;

    /// Creates the record for a pair unless it exists. The flag reports
    /// whether this call created it.
    fn upsert_delivery_record(
        &self,
        trace_id: TraceId,
        destination_id: DestinationId,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, (DeliveryRecord, bool)>;

    /// Claims one record if it is non-terminal, due and unclaimed.
    fn claim_record(
        &self,
        id: DeliveryId,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> StorageFuture<'_, Option<ClaimedRecord>>;

    /// Claims up to `batch_size` due records. Concurrent callers receive
    /// disjoint sets.
    fn claim_due_records(
        &self,
        now: DateTime<Utc>,
        batch_size: usize,
        lease_until: DateTime<Utc>,
    ) -> StorageFuture<'_, Vec<ClaimedRecord>>;

    /// Applies a transition if `claim` is still held. Returns false, writing
    /// nothing, otherwise.
    fn apply_transition(
        &self,
        claim: Claim,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, bool>;

    /// Counts the destination's deliveries and reservations since
    /// `window_start` and, under `limit`, reserves a slot on the claimed
    /// record. Count and reservation are atomic.
    fn reserve_rate_slot(
        &self,
        claim: Claim,
        destination_id: DestinationId,
        limit: u32,
        window_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, bool>;

    /// Cancels a non-terminal record and drops any claim on it.
    fn cancel_record(
        &self,
        id: DeliveryId,
        reason: String,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, bool>;

    /// Loads a delivery record.
    fn find_record(&self, id: DeliveryId) -> StorageFuture<'_, Option<DeliveryRecord>>;

    /// Lists the delivery records of a trace.
    fn find_records_for_trace(&self, trace_id: TraceId) -> StorageFuture<'_, Vec<DeliveryRecord>>;

    /// Cancels the non-terminal records of up to `batch_size` expired traces
    /// and deletes those traces.
    fn expire_traces(
        &self,
        now: DateTime<Utc>,
        batch_size: usize,
    ) -> StorageFuture<'_, ExpirySummary>;
}

/// Production storage backed by PostgreSQL.
pub struct PostgresDeliveryStorage {
    storage: Arc<Storage>,
}

impl PostgresDeliveryStorage {
    /// Creates a new PostgreSQL storage adapter.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

fn batch_limit(batch_size: usize) -> i64 {
    i64::try_from(batch_size).unwrap_or(i64::MAX)
}

impl DeliveryStorage for PostgresDeliveryStorage {
    fn organization_exists(&self, org_id: OrgId) -> StorageFuture<'_, bool> {
        Box::pin(async move { self.storage.organizations.exists(org_id).await })
    }

    fn find_trace(&self, trace_id: TraceId) -> StorageFuture<'_, Option<Trace>> {
        Box::pin(async move { self.storage.traces.find_by_id(trace_id).await })
    }

    fn find_destination(
        &self,
        destination_id: DestinationId,
    ) -> StorageFuture<'_, Option<Destination>> {
        Box::pin(async move { self.storage.destinations.find_by_id(destination_id).await })
    }

    fn mark_trace_fanned_out(
        &self,
        trace_id: TraceId,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, bool> {
        Box::pin(async move { self.storage.traces.mark_fanned_out(trace_id, now).await })
    }

    fn list_pending_fan_out(
        &self,
        created_before: DateTime<Utc>,
        batch_size: usize,
    ) -> StorageFuture<'_, Vec<TraceId>> {
        Box::pin(async move {
            self.storage.traces.list_pending_fan_out(created_before, batch_limit(batch_size)).await
        })
    }

    fn list_active_destinations(&self, org_id: OrgId) -> StorageFuture<'_, Vec<Destination>> {
        Box::pin(async move { self.storage.destinations.list_active(org_id).await })
    }

    fn upsert_delivery_record(
        &self,
        trace_id: TraceId,
        destination_id: DestinationId,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, (DeliveryRecord, bool)> {
        Box::pin(async move {
            self.storage.delivery_records.upsert(trace_id, destination_id, now).await
        })
    }

    fn claim_record(
        &self,
        id: DeliveryId,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> StorageFuture<'_, Option<ClaimedRecord>> {
        Box::pin(async move { self.storage.delivery_records.claim(id, now, lease_until).await })
    }

    fn claim_due_records(
        &self,
        now: DateTime<Utc>,
        batch_size: usize,
        lease_until: DateTime<Utc>,
    ) -> StorageFuture<'_, Vec<ClaimedRecord>> {
        Box::pin(async move {
            self.storage
                .delivery_records
                .claim_due(now, batch_limit(batch_size), lease_until)
                .await
        })
    }

    fn apply_transition(
        &self,
        claim: Claim,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, bool> {
        Box::pin(async move {
            self.storage.delivery_records.apply_transition(claim, &transition, now).await
        })
    }

    fn reserve_rate_slot(
        &self,
        claim: Claim,
        destination_id: DestinationId,
        limit: u32,
        window_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, bool> {
        Box::pin(async move {
            self.storage
                .delivery_records
                .reserve_rate_slot(claim, destination_id, i64::from(limit), window_start, now)
                .await
        })
    }

    fn cancel_record(
        &self,
        id: DeliveryId,
        reason: String,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, bool> {
        Box::pin(async move { self.storage.delivery_records.cancel(id, &reason, now).await })
    }

    fn find_record(&self, id: DeliveryId) -> StorageFuture<'_, Option<DeliveryRecord>> {
        Box::pin(async move { self.storage.delivery_records.find_by_id(id).await })
    }

    fn find_records_for_trace(&self, trace_id: TraceId) -> StorageFuture<'_, Vec<DeliveryRecord>> {
        Box::pin(async move { self.storage.delivery_records.find_by_trace(trace_id).await })
    }

    fn expire_traces(
        &self,
        now: DateTime<Utc>,
        batch_size: usize,
    ) -> StorageFuture<'_, ExpirySummary> {
        Box::pin(
            async move { self.storage.traces.expire_batch(now, batch_limit(batch_size)).await },
        )
    }
}

pub mod memory {
    //! In-memory storage for testing delivery logic without a database.
    //!
    //! All state sits behind one mutex, so every operation is atomic in the
    //! same way the PostgreSQL conditional updates are.

    use std::{
        collections::{HashMap, HashSet},
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
    };

    use chrono::{DateTime, Utc};
    use tokio::sync::Mutex;
    use tracerelay_core::{
        error::{CoreError, Result},
        models::{
            Claim, ClaimedRecord, DeliveryId, DeliveryRecord, DeliveryStatus, Destination,
            DestinationId, ExpirySummary, OrgId, Organization, Trace, TraceId, Transition,
        },
        storage::traces::TRACE_EXPIRED,
    };
    use uuid::Uuid;

    use super::{DeliveryStorage, StorageFuture};

    #[derive(Default)]
    struct State {
        organizations: HashSet<OrgId>,
        traces: HashMap<TraceId, Trace>,
        fanned_out: HashSet<TraceId>,
        destinations: HashMap<DestinationId, Destination>,
        records: HashMap<DeliveryId, DeliveryRecord>,
    }

    /// In-memory `DeliveryStorage`.
    ///
    /// Clones share state, so a test can seed and inspect the storage it
    /// handed to the engine.
    #[derive(Clone, Default)]
    pub struct MemoryStorage {
        state: Arc<Mutex<State>>,
        unavailable: Arc<AtomicBool>,
    }

    impl MemoryStorage {
        /// Creates empty storage.
        pub fn new() -> Self {
            Self::default()
        }

        /// Registers an organization.
        pub async fn add_organization(&self, organization: &Organization) {
            self.state.lock().await.organizations.insert(organization.id);
        }

        /// Stores a trace.
        pub async fn add_trace(&self, trace: Trace) {
            self.state.lock().await.traces.insert(trace.id, trace);
        }

        /// Deletes a trace without touching its delivery records.
        pub async fn remove_trace(&self, trace_id: TraceId) {
            self.state.lock().await.traces.remove(&trace_id);
        }

        /// Stores or replaces a destination.
        pub async fn add_destination(&self, destination: Destination) {
            self.state.lock().await.destinations.insert(destination.id, destination);
        }

        /// Stores or replaces a delivery record as-is.
        pub async fn put_record(&self, record: DeliveryRecord) {
            self.state.lock().await.records.insert(record.id, record);
        }

        /// Returns every stored delivery record.
        pub async fn all_records(&self) -> Vec<DeliveryRecord> {
            self.state.lock().await.records.values().cloned().collect()
        }

        /// Makes every subsequent trait operation fail with a database error.
        pub fn set_unavailable(&self, unavailable: bool) {
            self.unavailable.store(unavailable, Ordering::SeqCst);
        }

        /// Runs `op` against the state under the lock.
        fn run<'a, T, F>(&'a self, op: F) -> StorageFuture<'a, T>
        where
            T: Send + 'a,
            F: FnOnce(&mut State) -> Result<T> + Send + 'a,
        {
            Box::pin(async move {
                if self.unavailable.load(Ordering::SeqCst) {
                    return Err(CoreError::Database("storage unavailable".to_string()));
                }
                let mut state = self.state.lock().await;
                op(&mut state)
            })
        }
    }

    fn claim_in_place(
        record: &mut DeliveryRecord,
        token: Uuid,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> ClaimedRecord {
        record.claim_token = Some(token);
        record.claimed_until = Some(lease_until);
        record.updated_at = now;
        ClaimedRecord { record: record.clone(), claim: Claim { record_id: record.id, token } }
    }

    fn counts_against_window(
        record: &DeliveryRecord,
        claim: Claim,
        window_start: DateTime<Utc>,
    ) -> bool {
        match record.status {
            DeliveryStatus::Success => record.delivered_at.is_some_and(|at| at > window_start),
            DeliveryStatus::Pending | DeliveryStatus::Retrying => {
                record.id != claim.record_id
                    && record.rate_slot_at.is_some_and(|at| at > window_start)
            },
            DeliveryStatus::Failed | DeliveryStatus::Cancelled => false,
        }
    }

    impl DeliveryStorage for MemoryStorage {
        fn organization_exists(&self, org_id: OrgId) -> StorageFuture<'_, bool> {
            self.run(move |state| Ok(state.organizations.contains(&org_id)))
        }

        fn find_trace(&self, trace_id: TraceId) -> StorageFuture<'_, Option<Trace>> {
            self.run(move |state| Ok(state.traces.get(&trace_id).cloned()))
        }

        fn find_destination(
            &self,
            destination_id: DestinationId,
        ) -> StorageFuture<'_, Option<Destination>> {
            self.run(move |state| Ok(state.destinations.get(&destination_id).cloned()))
        }

        fn mark_trace_fanned_out(
            &self,
            trace_id: TraceId,
            _now: DateTime<Utc>,
        ) -> StorageFuture<'_, bool> {
            self.run(move |state| {
                Ok(state.traces.contains_key(&trace_id) && state.fanned_out.insert(trace_id))
            })
        }

        fn list_pending_fan_out(
            &self,
            created_before: DateTime<Utc>,
            batch_size: usize,
        ) -> StorageFuture<'_, Vec<TraceId>> {
            self.run(move |state| {
                let mut pending: Vec<&Trace> = state
                    .traces
                    .values()
                    .filter(|t| t.created_at < created_before && !state.fanned_out.contains(&t.id))
                    .collect();
                pending.sort_by_key(|t| (t.created_at, t.id));
                Ok(pending.into_iter().take(batch_size).map(|t| t.id).collect())
            })
        }

        fn list_active_destinations(&self, org_id: OrgId) -> StorageFuture<'_, Vec<Destination>> {
            self.run(move |state| {
                let mut destinations: Vec<_> = state
                    .destinations
                    .values()
                    .filter(|d| d.org_id == org_id && d.is_active)
                    .cloned()
                    .collect();
                destinations.sort_by(|a, b| {
                    b.priority
                        .cmp(&a.priority)
                        .then(a.created_at.cmp(&b.created_at))
                        .then(a.id.cmp(&b.id))
                });
                Ok(destinations)
            })
        }

        fn upsert_delivery_record(
            &self,
            trace_id: TraceId,
            destination_id: DestinationId,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, (DeliveryRecord, bool)> {
            self.run(move |state| {
                if let Some(existing) = state
                    .records
                    .values()
                    .find(|r| r.trace_id == trace_id && r.destination_id == destination_id)
                {
                    return Ok((existing.clone(), false));
                }
                let record = DeliveryRecord::new(trace_id, destination_id, now);
                state.records.insert(record.id, record.clone());
                Ok((record, true))
            })
        }

        fn claim_record(
            &self,
            id: DeliveryId,
            now: DateTime<Utc>,
            lease_until: DateTime<Utc>,
        ) -> StorageFuture<'_, Option<ClaimedRecord>> {
            self.run(move |state| {
                Ok(state
                    .records
                    .get_mut(&id)
                    .filter(|record| record.is_claimable(now))
                    .map(|record| claim_in_place(record, Uuid::new_v4(), now, lease_until)))
            })
        }

        fn claim_due_records(
            &self,
            now: DateTime<Utc>,
            batch_size: usize,
            lease_until: DateTime<Utc>,
        ) -> StorageFuture<'_, Vec<ClaimedRecord>> {
            self.run(move |state| {
                let mut due: Vec<&mut DeliveryRecord> =
                    state.records.values_mut().filter(|r| r.is_claimable(now)).collect();
                due.sort_by_key(|r| (r.next_retry_at, r.created_at));

                let token = Uuid::new_v4();
                Ok(due
                    .into_iter()
                    .take(batch_size)
                    .map(|record| claim_in_place(record, token, now, lease_until))
                    .collect())
            })
        }

        fn apply_transition(
            &self,
            claim: Claim,
            transition: Transition,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, bool> {
            self.run(move |state| match state.records.get_mut(&claim.record_id) {
                Some(record)
                    if record.claim_token == Some(claim.token) && !record.status.is_terminal() =>
                {
                    transition.apply_to(record, now);
                    Ok(true)
                },
                _ => Ok(false),
            })
        }

        fn reserve_rate_slot(
            &self,
            claim: Claim,
            destination_id: DestinationId,
            limit: u32,
            window_start: DateTime<Utc>,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, bool> {
            self.run(move |state| {
                let in_window = state
                    .records
                    .values()
                    .filter(|r| r.destination_id == destination_id)
                    .filter(|r| counts_against_window(r, claim, window_start))
                    .count();

                if in_window >= limit as usize {
                    return Ok(false);
                }

                match state.records.get_mut(&claim.record_id) {
                    Some(record) if record.claim_token == Some(claim.token) => {
                        record.rate_slot_at = Some(now);
                        Ok(true)
                    },
                    _ => Ok(false),
                }
            })
        }

        fn cancel_record(
            &self,
            id: DeliveryId,
            reason: String,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, bool> {
            self.run(move |state| match state.records.get_mut(&id) {
                Some(record) if !record.status.is_terminal() => {
                    Transition::Cancelled { at: now, reason }.apply_to(record, now);
                    Ok(true)
                },
                _ => Ok(false),
            })
        }

        fn find_record(&self, id: DeliveryId) -> StorageFuture<'_, Option<DeliveryRecord>> {
            self.run(move |state| Ok(state.records.get(&id).cloned()))
        }

        fn find_records_for_trace(
            &self,
            trace_id: TraceId,
        ) -> StorageFuture<'_, Vec<DeliveryRecord>> {
            self.run(move |state| {
                let mut records: Vec<_> =
                    state.records.values().filter(|r| r.trace_id == trace_id).cloned().collect();
                records.sort_by_key(|r| (r.created_at, r.id));
                Ok(records)
            })
        }

        fn expire_traces(
            &self,
            now: DateTime<Utc>,
            batch_size: usize,
        ) -> StorageFuture<'_, ExpirySummary> {
            self.run(move |state| {
                let mut expired: Vec<&Trace> =
                    state.traces.values().filter(|t| t.is_expired(now)).collect();
                expired.sort_by_key(|t| t.expires_at);
                let expired: Vec<TraceId> =
                    expired.into_iter().take(batch_size).map(|t| t.id).collect();

                let mut summary = ExpirySummary::default();
                for record in state.records.values_mut() {
                    if expired.contains(&record.trace_id) && !record.status.is_terminal() {
                        Transition::Cancelled { at: now, reason: TRACE_EXPIRED.to_string() }
                            .apply_to(record, now);
                        summary.deliveries_cancelled += 1;
                    }
                }
                for trace_id in &expired {
                    state.fanned_out.remove(trace_id);
                    if state.traces.remove(trace_id).is_some() {
                        summary.traces_deleted += 1;
                    }
                }

                Ok(summary)
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use serde_json::json;
    use tracerelay_core::models::DeliveryStatus;

    use super::{memory::MemoryStorage, *};

    fn trace(org_id: OrgId, expires_at: DateTime<Utc>) -> Trace {
        Trace {
            id: TraceId::new(),
            org_id,
            external_trace_id: None,
            span_id: None,
            parent_span_id: None,
            data: json!({"n": 1}),
            metadata: json!({}),
            created_at: Utc::now(),
            expires_at,
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent_per_pair() {
        let storage = MemoryStorage::new();
        let now = Utc::now();
        let (trace_id, destination_id) = (TraceId::new(), DestinationId::new());

        let (first, created) =
            storage.upsert_delivery_record(trace_id, destination_id, now).await.unwrap();
        let (second, created_again) =
            storage.upsert_delivery_record(trace_id, destination_id, now).await.unwrap();

        assert!(created);
        assert!(!created_again);
        assert_eq!(first.id, second.id);
        assert_eq!(storage.all_records().await.len(), 1);
    }

    #[tokio::test]
    async fn claimed_record_cannot_be_claimed_again_until_lease_expires() {
        let storage = MemoryStorage::new();
        let now = Utc::now();
        let lease = now + Duration::seconds(30);
        let (trace_id, destination_id) = (TraceId::new(), DestinationId::new());
        let (record, _) =
            storage.upsert_delivery_record(trace_id, destination_id, now).await.unwrap();

        assert!(storage.claim_record(record.id, now, lease).await.unwrap().is_some());
        assert!(storage.claim_record(record.id, now, lease).await.unwrap().is_none());
        assert!(storage.claim_due_records(now, 10, lease).await.unwrap().is_empty());

        let later = lease + Duration::seconds(1);
        let renewed = later + Duration::seconds(30);
        assert!(storage.claim_record(record.id, later, renewed).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stale_claim_cannot_apply_transitions() {
        let storage = MemoryStorage::new();
        let now = Utc::now();
        let (trace_id, destination_id) = (TraceId::new(), DestinationId::new());
        let (record, _) =
            storage.upsert_delivery_record(trace_id, destination_id, now).await.unwrap();
        let lease = now + Duration::seconds(30);
        let claimed = storage.claim_record(record.id, now, lease).await.unwrap().unwrap();

        assert!(storage.cancel_record(record.id, "operator".to_string(), now).await.unwrap());

        let applied = storage
            .apply_transition(
                claimed.claim,
                Transition::Delivered {
                    at: now,
                    transformed_payload: json!({}),
                    response_data: None,
                },
                now,
            )
            .await
            .unwrap();
        assert!(!applied);

        let stored = storage.find_record(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Cancelled);
        assert_eq!(stored.last_error.as_deref(), Some("operator"));
    }

    #[tokio::test]
    async fn rate_slot_counts_successes_and_reservations() {
        let storage = MemoryStorage::new();
        let now = Utc::now();
        let destination_id = DestinationId::new();
        let window_start = now - Duration::seconds(60);

        let mut delivered = DeliveryRecord::new(TraceId::new(), destination_id, now);
        delivered.status = DeliveryStatus::Success;
        delivered.delivered_at = Some(now - Duration::seconds(10));
        storage.put_record(delivered).await;

        let mut old = DeliveryRecord::new(TraceId::new(), destination_id, now);
        old.status = DeliveryStatus::Success;
        old.delivered_at = Some(now - Duration::seconds(120));
        storage.put_record(old).await;

        let (first, _) =
            storage.upsert_delivery_record(TraceId::new(), destination_id, now).await.unwrap();
        let (second, _) =
            storage.upsert_delivery_record(TraceId::new(), destination_id, now).await.unwrap();
        let lease = now + Duration::seconds(30);
        let first = storage.claim_record(first.id, now, lease).await.unwrap().unwrap();
        let second = storage.claim_record(second.id, now, lease).await.unwrap().unwrap();

        let reserve = |claim, limit| {
            storage.reserve_rate_slot(claim, destination_id, limit, window_start, now)
        };
        assert!(reserve(first.claim, 2).await.unwrap());
        assert!(!reserve(second.claim, 2).await.unwrap());
        assert!(reserve(second.claim, 3).await.unwrap());
    }

    #[tokio::test]
    async fn expiry_cancels_open_records_and_keeps_them() {
        let storage = MemoryStorage::new();
        let now = Utc::now();
        let org_id = OrgId::new();
        let expired = trace(org_id, now - Duration::seconds(1));
        let alive = trace(org_id, now + Duration::hours(1));
        storage.add_trace(expired.clone()).await;
        storage.add_trace(alive.clone()).await;

        let (open, _) =
            storage.upsert_delivery_record(expired.id, DestinationId::new(), now).await.unwrap();
        let mut done = DeliveryRecord::new(expired.id, DestinationId::new(), now);
        done.status = DeliveryStatus::Success;
        storage.put_record(done.clone()).await;

        let summary = storage.expire_traces(now, 100).await.unwrap();

        assert_eq!(summary, ExpirySummary { traces_deleted: 1, deliveries_cancelled: 1 });
        assert!(storage.find_trace(expired.id).await.unwrap().is_none());
        assert!(storage.find_trace(alive.id).await.unwrap().is_some());
        let open = storage.find_record(open.id).await.unwrap().unwrap();
        assert_eq!(open.status, DeliveryStatus::Cancelled);
        assert_eq!(open.last_error.as_deref(), Some(TRACE_EXPIRED_MSG));
        let done = storage.find_record(done.id).await.unwrap().unwrap();
        assert_eq!(done.status, DeliveryStatus::Success);
    }

    #[tokio::test]
    async fn fan_out_marker_hides_trace_from_pending_list() {
        let storage = MemoryStorage::new();
        let now = Utc::now();
        let mut old = trace(OrgId::new(), now + Duration::days(1));
        old.created_at = now - Duration::minutes(10);
        let mut fresh = trace(OrgId::new(), now + Duration::days(1));
        fresh.created_at = now;
        storage.add_trace(old.clone()).await;
        storage.add_trace(fresh.clone()).await;

        let cutoff = now - Duration::minutes(1);
        assert_eq!(storage.list_pending_fan_out(cutoff, 10).await.unwrap(), vec![old.id]);

        assert!(storage.mark_trace_fanned_out(old.id, now).await.unwrap());
        assert!(!storage.mark_trace_fanned_out(old.id, now).await.unwrap());
        assert!(!storage.mark_trace_fanned_out(TraceId::new(), now).await.unwrap());
        assert!(storage.list_pending_fan_out(cutoff, 10).await.unwrap().is_empty());
    }

    const TRACE_EXPIRED_MSG: &str = tracerelay_core::storage::traces::TRACE_EXPIRED;

    #[tokio::test]
    async fn unavailable_storage_surfaces_database_errors() {
        let storage = MemoryStorage::new();
        storage.set_unavailable(true);
        assert!(storage.find_record(DeliveryId::new()).await.is_err());
    }
}
