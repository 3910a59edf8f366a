//! Protocol adapters and the registry that resolves them.
//!
//! An adapter performs one delivery attempt for one provider type. It never
//! returns an error: every outcome, including transport failures and bad
//! configuration, is reported through [`AdapterResult`].

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracerelay_core::models::Trace;

use crate::error::{DeliveryError, Result};

pub mod datadog;
pub mod http;
pub mod langfuse;
pub mod webhook;

pub use datadog::DatadogAdapter;
pub use http::{ClientConfig, HttpClient};
pub use langfuse::LangfuseAdapter;
pub use webhook::WebhookAdapter;

/// Outcome of a single delivery attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterResult {
    /// Whether the destination accepted the payload.
    pub success: bool,
    /// Provider response, persisted on success.
    pub response_data: Option<Value>,
    /// Failure description.
    pub error: Option<String>,
    /// Set when retrying cannot help.
    pub permanent: bool,
}

impl AdapterResult {
    /// Successful delivery with the provider's response.
    pub fn delivered(response_data: Value) -> Self {
        Self { success: true, response_data: Some(response_data), error: None, permanent: false }
    }

    /// Retryable failure.
    pub fn failed(error: impl Into<String>) -> Self {
        Self { success: false, response_data: None, error: Some(error.into()), permanent: false }
    }

    /// Failure that must not be retried.
    pub fn permanent_failure(error: impl Into<String>) -> Self {
        Self { success: false, response_data: None, error: Some(error.into()), permanent: true }
    }

    /// Converts a delivery error into a failed result.
    pub fn from_error(error: &DeliveryError) -> Self {
        if error.is_permanent() {
            Self::permanent_failure(error.to_string())
        } else {
            Self::failed(error.to_string())
        }
    }

    /// Wraps a `Result` from the shared HTTP client.
    pub fn from_http(result: Result<http::HttpResponse>) -> Self {
        match result {
            Ok(response) => {
                let body = serde_json::from_str(&response.body)
                    .unwrap_or_else(|_| Value::String(response.body.clone()));
                Self::delivered(json!({ "status": response.status_code, "body": body }))
            },
            Err(e) => Self::from_error(&e),
        }
    }
}

/// Inputs for one delivery attempt.
#[derive(Debug, Clone, Copy)]
pub struct DeliveryContext<'a> {
    /// Trace being delivered.
    pub trace: &'a Trace,
    /// Decrypted destination configuration.
    pub config: &'a Value,
    /// Payload produced by the transform step.
    pub payload: &'a Value,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Time budget for the attempt.
    pub timeout: Duration,
}

/// Delivery strategy for one provider type.
#[async_trait::async_trait]
pub trait Adapter: Send + Sync + fmt::Debug {
    /// Performs one delivery attempt.
    async fn deliver(&self, ctx: &DeliveryContext<'_>) -> AdapterResult;
}

/// Deserializes an adapter's view of the destination config.
pub(crate) fn parse_config<T: DeserializeOwned>(provider: &str, config: &Value) -> Result<T> {
    serde_json::from_value(config.clone())
        .map_err(|e| DeliveryError::configuration(format!("invalid {provider} config: {e}")))
}

pub(crate) fn encode_body(payload: &Value) -> Result<bytes::Bytes> {
    serde_json::to_vec(payload)
        .map(bytes::Bytes::from)
        .map_err(|e| DeliveryError::internal(format!("unserializable payload: {e}")))
}

/// Maps provider type tags to adapters.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn Adapter>>,
}

impl AdapterRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the built-in `webhook`, `datadog` and
    /// `langfuse` adapters sharing `client`.
    pub fn with_defaults(client: HttpClient) -> Self {
        let mut registry = Self::new();
        registry.register(webhook::PROVIDER, Arc::new(WebhookAdapter::new(client.clone())));
        registry.register(datadog::PROVIDER, Arc::new(DatadogAdapter::new(client.clone())));
        registry.register(langfuse::PROVIDER, Arc::new(LangfuseAdapter::new(client)));
        registry
    }

    /// Registers `adapter` for `provider_type`, replacing any previous one.
    pub fn register(&mut self, provider_type: impl Into<String>, adapter: Arc<dyn Adapter>) {
        self.adapters.insert(provider_type.into(), adapter);
    }

    /// Resolves the adapter for `provider_type`.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::UnsupportedProvider` if nothing is registered.
    pub fn resolve(&self, provider_type: &str) -> Result<Arc<dyn Adapter>> {
        self.adapters
            .get(provider_type)
            .cloned()
            .ok_or_else(|| DeliveryError::unsupported_provider(provider_type))
    }

    /// Registered provider types, sorted.
    pub fn provider_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterRegistry").field("providers", &self.provider_types()).finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::Utc;
    use serde_json::json;
    use tracerelay_core::models::{OrgId, TraceId};

    use super::*;

    pub(crate) fn trace() -> Trace {
        Trace {
            id: TraceId::new(),
            org_id: OrgId::new(),
            external_trace_id: Some("ext-1".to_string()),
            span_id: Some("span-1".to_string()),
            parent_span_id: None,
            data: json!({"input": "hello"}),
            metadata: json!({}),
            created_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::days(30),
        }
    }

    pub(crate) fn client() -> HttpClient {
        HttpClient::with_defaults().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Accepting;

    #[async_trait::async_trait]
    impl Adapter for Accepting {
        async fn deliver(&self, _ctx: &DeliveryContext<'_>) -> AdapterResult {
            AdapterResult::delivered(Value::Null)
        }
    }

    #[test]
    fn unknown_provider_is_unsupported() {
        let registry = AdapterRegistry::new();
        let err = registry.resolve("carrier-pigeon").unwrap_err();
        assert!(matches!(err, DeliveryError::UnsupportedProvider { .. }));
        assert_eq!(err.to_string(), "unsupported provider");
    }

    #[tokio::test]
    async fn registered_adapter_is_resolved() {
        let mut registry = AdapterRegistry::new();
        registry.register("custom", Arc::new(Accepting));

        let trace = test_support::trace();
        let ctx = DeliveryContext {
            trace: &trace,
            config: &Value::Null,
            payload: &trace.data,
            attempt: 1,
            timeout: Duration::from_secs(1),
        };

        let result = registry.resolve("custom").unwrap().deliver(&ctx).await;
        assert!(result.success);
    }

    #[test]
    fn defaults_cover_shipped_providers() {
        let registry = AdapterRegistry::with_defaults(test_support::client());
        assert_eq!(registry.provider_types(), vec!["datadog", "langfuse", "webhook"]);
    }

    #[test]
    fn configuration_errors_are_permanent_results() {
        let result = AdapterResult::from_error(&DeliveryError::configuration("missing url"));
        assert!(!result.success);
        assert!(result.permanent);

        let result = AdapterResult::from_error(&DeliveryError::server_error(503, ""));
        assert!(!result.permanent);
        assert_eq!(result.error.as_deref(), Some("server error: HTTP 503"));
    }
}
