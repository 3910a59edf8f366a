//! Destination lookup for fan-out.

use std::sync::Arc;

use tracerelay_core::models::{Destination, DestinationId, OrgId};

use crate::{
    error::{DeliveryError, Result},
    storage::DeliveryStorage,
};

/// Read-only view over configured destinations.
pub struct DestinationRegistry {
    storage: Arc<dyn DeliveryStorage>,
}

impl DestinationRegistry {
    /// Creates a registry over the given storage.
    pub fn new(storage: Arc<dyn DeliveryStorage>) -> Self {
        Self { storage }
    }

    /// Lists an organization's active destinations in fan-out order.
    ///
    /// Priority descending, then creation time ascending, then ID.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the organization does not exist, or a database
    /// error if storage fails. An organization without active destinations
    /// yields an empty list.
    pub async fn list_active_destinations(&self, org_id: OrgId) -> Result<Vec<Destination>> {
        if !self.storage.organization_exists(org_id).await? {
            return Err(DeliveryError::not_found("organization", org_id));
        }

        Ok(self.storage.list_active_destinations(org_id).await?)
    }

    /// Finds a destination regardless of whether it is active.
    ///
    /// # Errors
    ///
    /// Returns a database error if storage fails.
    pub async fn find(&self, destination_id: DestinationId) -> Result<Option<Destination>> {
        Ok(self.storage.find_destination(destination_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use tracerelay_core::models::Organization;

    use super::*;
    use crate::storage::memory::MemoryStorage;

    fn destination(org_id: OrgId, name: &str, priority: i32, age_secs: i64) -> Destination {
        Destination {
            id: DestinationId::new(),
            org_id,
            name: name.to_string(),
            provider_type: "webhook".to_string(),
            config: "{}".to_string(),
            is_active: true,
            priority,
            transform_function: None,
            rate_limit: None,
            retry_enabled: true,
            max_retries: 5,
            retry_delay_ms_base: 1000,
            created_at: Utc::now() - Duration::seconds(age_secs),
        }
    }

    #[tokio::test]
    async fn active_destinations_are_ordered_by_priority_then_age() {
        let storage = MemoryStorage::new();
        let org =
            Organization { id: OrgId::new(), name: "acme".to_string(), created_at: Utc::now() };
        storage.add_organization(&org).await;

        storage.add_destination(destination(org.id, "low", 1, 100)).await;
        storage.add_destination(destination(org.id, "high-new", 10, 10)).await;
        storage.add_destination(destination(org.id, "high-old", 10, 50)).await;
        let mut inactive = destination(org.id, "inactive", 99, 5);
        inactive.is_active = false;
        storage.add_destination(inactive).await;
        storage.add_destination(destination(OrgId::new(), "other-org", 50, 5)).await;

        let registry = DestinationRegistry::new(Arc::new(storage));
        let names: Vec<_> = registry
            .list_active_destinations(org.id)
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.name)
            .collect();

        assert_eq!(names, vec!["high-old", "high-new", "low"]);
    }

    #[tokio::test]
    async fn unknown_organization_is_not_found() {
        let registry = DestinationRegistry::new(Arc::new(MemoryStorage::new()));
        let err = registry.list_active_destinations(OrgId::new()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::NotFound { entity: "organization", .. }));
    }

    #[tokio::test]
    async fn organization_without_destinations_yields_empty_list() {
        let storage = MemoryStorage::new();
        let org =
            Organization { id: OrgId::new(), name: "empty".to_string(), created_at: Utc::now() };
        storage.add_organization(&org).await;

        let registry = DestinationRegistry::new(Arc::new(storage));
        assert!(registry.list_active_destinations(org.id).await.unwrap().is_empty());
    }
}
