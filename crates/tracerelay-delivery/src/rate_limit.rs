//! Per-destination sliding-window rate limiting.
//!
//! A destination with `rate_limit = n` accepts at most `n` successful
//! deliveries in any trailing 60-second window. In-flight attempts hold a
//! reservation so concurrent processors cannot overshoot the limit together.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tracerelay_core::models::{Claim, Destination};

use crate::{error::Result, storage::DeliveryStorage};

/// Length of the sliding window.
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

/// How far a saturated record is pushed back.
pub const DEFERRAL: Duration = Duration::from_secs(60);

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The attempt may proceed.
    Admitted,
    /// The window is full; retry at the given time.
    Deferred {
        /// When the record becomes due again
        until: DateTime<Utc>,
    },
}

/// Sliding-window limiter backed by delivery storage.
pub struct RateLimiter {
    storage: Arc<dyn DeliveryStorage>,
    window: chrono::Duration,
    deferral: chrono::Duration,
}

impl RateLimiter {
    /// Creates a limiter with the standard 60-second window and deferral.
    pub fn new(storage: Arc<dyn DeliveryStorage>) -> Self {
        Self {
            storage,
            window: chrono::Duration::seconds(RATE_WINDOW.as_secs() as i64),
            deferral: chrono::Duration::seconds(DEFERRAL.as_secs() as i64),
        }
    }

    /// Checks the destination's limit and reserves a slot for `claim`.
    ///
    /// Destinations without a limit are always admitted and take no
    /// reservation. A non-positive limit admits nothing.
    ///
    /// # Errors
    ///
    /// Returns a database error if storage fails.
    pub async fn admit(
        &self,
        claim: Claim,
        destination: &Destination,
        now: DateTime<Utc>,
    ) -> Result<Admission> {
        let Some(limit) = destination.rate_limit else {
            return Ok(Admission::Admitted);
        };

        let limit = u32::try_from(limit).unwrap_or(0);
        let reserved = limit > 0
            && self
                .storage
                .reserve_rate_slot(claim, destination.id, limit, now - self.window, now)
                .await?;

        if reserved {
            Ok(Admission::Admitted)
        } else {
            Ok(Admission::Deferred { until: now + self.deferral })
        }
    }
}

#[cfg(test)]
mod tests {
    use tracerelay_core::models::{DeliveryRecord, DeliveryStatus, DestinationId, OrgId, TraceId};

    use super::*;
    use crate::storage::memory::MemoryStorage;

    fn destination(rate_limit: Option<i32>) -> Destination {
        Destination {
            id: DestinationId::new(),
            org_id: OrgId::new(),
            name: "limited".to_string(),
            provider_type: "webhook".to_string(),
            config: "{}".to_string(),
            is_active: true,
            priority: 0,
            transform_function: None,
            rate_limit,
            retry_enabled: true,
            max_retries: 5,
            retry_delay_ms_base: 1000,
            created_at: Utc::now(),
        }
    }

    async fn claimed(
        storage: &MemoryStorage,
        destination: &Destination,
        now: DateTime<Utc>,
    ) -> Claim {
        let (record, _) =
            storage.upsert_delivery_record(TraceId::new(), destination.id, now).await.unwrap();
        storage
            .claim_record(record.id, now, now + chrono::Duration::seconds(30))
            .await
            .unwrap()
            .unwrap()
            .claim
    }

    #[tokio::test]
    async fn unlimited_destination_is_always_admitted() {
        let storage = MemoryStorage::new();
        let limiter = RateLimiter::new(Arc::new(storage.clone()));
        let destination = destination(None);
        let now = Utc::now();

        let claim = claimed(&storage, &destination, now).await;
        assert_eq!(limiter.admit(claim, &destination, now).await.unwrap(), Admission::Admitted);
    }

    #[tokio::test]
    async fn eleventh_delivery_in_window_is_deferred_by_a_minute() {
        let storage = MemoryStorage::new();
        let limiter = RateLimiter::new(Arc::new(storage.clone()));
        let destination = destination(Some(10));
        let now = Utc::now();

        for i in 0..10 {
            let mut record = DeliveryRecord::new(TraceId::new(), destination.id, now);
            record.status = DeliveryStatus::Success;
            record.delivered_at = Some(now - chrono::Duration::seconds(i * 5));
            storage.put_record(record).await;
        }

        let claim = claimed(&storage, &destination, now).await;
        assert_eq!(
            limiter.admit(claim, &destination, now).await.unwrap(),
            Admission::Deferred { until: now + chrono::Duration::seconds(60) }
        );
    }

    #[tokio::test]
    async fn deliveries_outside_window_do_not_count() {
        let storage = MemoryStorage::new();
        let limiter = RateLimiter::new(Arc::new(storage.clone()));
        let destination = destination(Some(1));
        let now = Utc::now();

        let mut old = DeliveryRecord::new(TraceId::new(), destination.id, now);
        old.status = DeliveryStatus::Success;
        old.delivered_at = Some(now - chrono::Duration::seconds(61));
        storage.put_record(old).await;

        let claim = claimed(&storage, &destination, now).await;
        assert_eq!(limiter.admit(claim, &destination, now).await.unwrap(), Admission::Admitted);
    }

    #[tokio::test]
    async fn concurrent_reservations_share_the_limit() {
        let storage = MemoryStorage::new();
        let limiter = RateLimiter::new(Arc::new(storage.clone()));
        let destination = destination(Some(2));
        let now = Utc::now();

        let mut admitted = 0;
        for _ in 0..5 {
            let claim = claimed(&storage, &destination, now).await;
            if limiter.admit(claim, &destination, now).await.unwrap() == Admission::Admitted {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 2);
    }
}
