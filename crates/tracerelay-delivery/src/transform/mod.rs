//! Payload transforms run in a sandbox.
//!
//! A destination may carry a transform that reshapes `trace.data` before
//! delivery. Transforms are untrusted: they run behind a [`TransformSandbox`]
//! with no ambient capabilities, under a wall-clock budget. Any failure falls
//! back to the raw trace data and is reported as a warning, never as a
//! delivery failure.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracerelay_core::models::{Destination, Trace};

use crate::error::{DeliveryError, Result};

pub mod process;
pub mod template;

pub use process::{Confinement, ProcessSandbox};
pub use template::TemplateSandbox;

/// Default wall-clock budget for one transform.
pub const DEFAULT_TRANSFORM_TIMEOUT: Duration = Duration::from_secs(1);

/// Trace fields exposed to transforms.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceView {
    /// Trace payload.
    pub data: Value,
    /// Trace metadata.
    pub metadata: Value,
    /// External trace grouping key.
    pub trace_id: Option<String>,
    /// Span identifier.
    pub span_id: Option<String>,
    /// Parent span identifier.
    pub parent_span_id: Option<String>,
    /// Owning organization.
    pub org_id: String,
    /// Capture time.
    pub created_at: DateTime<Utc>,
}

/// Destination fields exposed to transforms.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationView {
    /// Destination ID.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Provider key.
    pub provider_type: String,
}

/// Everything a transform may read.
#[derive(Debug, Clone, Serialize)]
pub struct TransformInput {
    /// Trace being delivered.
    pub trace: TraceView,
    /// Receiving destination.
    pub destination: DestinationView,
}

impl TransformInput {
    /// Builds the transform input for a trace/destination pair.
    pub fn new(trace: &Trace, destination: &Destination) -> Self {
        Self {
            trace: TraceView {
                data: trace.data.clone(),
                metadata: trace.metadata.clone(),
                trace_id: trace.external_trace_id.clone(),
                span_id: trace.span_id.clone(),
                parent_span_id: trace.parent_span_id.clone(),
                org_id: trace.org_id.to_string(),
                created_at: trace.created_at,
            },
            destination: DestinationView {
                id: destination.id.to_string(),
                name: destination.name.clone(),
                provider_type: destination.provider_type.clone(),
            },
        }
    }
}

/// Isolation strategy for untrusted transform code.
#[async_trait::async_trait]
pub trait TransformSandbox: Send + Sync + std::fmt::Debug {
    /// Runs `source` against `input` and returns the payload it produces.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Transform` if the source is invalid, fails at
    /// runtime or exceeds a resource ceiling.
    async fn execute(&self, source: &str, input: &TransformInput) -> Result<Value>;
}

/// Payload chosen for an attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformOutcome {
    /// Payload to hand to the adapter.
    pub payload: Value,
    /// Set when the transform failed and raw data was used instead.
    pub warning: Option<String>,
}

/// Resolves the payload for a delivery attempt.
#[derive(Debug, Clone)]
pub struct TransformExecutor {
    sandbox: Arc<dyn TransformSandbox>,
    timeout: Duration,
}

impl TransformExecutor {
    /// Creates an executor with the given sandbox and time budget.
    pub fn new(sandbox: Arc<dyn TransformSandbox>, timeout: Duration) -> Self {
        Self { sandbox, timeout }
    }

    /// Produces the payload for `trace` as seen by `destination`.
    ///
    /// Without a transform the payload is `trace.data` unchanged. A failing,
    /// slow or oversized transform yields `trace.data` plus a warning.
    pub async fn resolve(&self, trace: &Trace, destination: &Destination) -> TransformOutcome {
        let Some(source) = destination.transform_function.as_deref() else {
            return TransformOutcome { payload: trace.data.clone(), warning: None };
        };

        let input = TransformInput::new(trace, destination);
        let execution = self.sandbox.execute(source, &input);
        let result = match tokio::time::timeout(self.timeout, execution).await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::timeout(self.timeout)),
        };

        match result {
            Ok(payload) => TransformOutcome { payload, warning: None },
            Err(e) => TransformOutcome {
                payload: trace.data.clone(),
                warning: Some(format!("transform failed, delivering raw data: {e}")),
            },
        }
    }
}

impl Default for TransformExecutor {
    fn default() -> Self {
        Self::new(Arc::new(TemplateSandbox::default()), DEFAULT_TRANSFORM_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tracerelay_core::models::{DestinationId, OrgId, TraceId};

    use super::*;

    fn trace() -> Trace {
        Trace {
            id: TraceId::new(),
            org_id: OrgId::new(),
            external_trace_id: Some("abc".to_string()),
            span_id: None,
            parent_span_id: None,
            data: json!({"model": "gpt", "tokens": 42}),
            metadata: json!({"env": "prod"}),
            created_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::days(30),
        }
    }

    fn destination(transform: Option<&str>) -> Destination {
        Destination {
            id: DestinationId::new(),
            org_id: OrgId::new(),
            name: "sink".to_string(),
            provider_type: "webhook".to_string(),
            config: "{}".to_string(),
            is_active: true,
            priority: 0,
            transform_function: transform.map(str::to_string),
            rate_limit: None,
            retry_enabled: true,
            max_retries: 5,
            retry_delay_ms_base: 1000,
            created_at: Utc::now(),
        }
    }

    #[derive(Debug)]
    struct StallingSandbox;

    #[async_trait::async_trait]
    impl TransformSandbox for StallingSandbox {
        async fn execute(&self, _source: &str, _input: &TransformInput) -> Result<Value> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Value::Null)
        }
    }

    #[tokio::test]
    async fn no_transform_passes_data_through() {
        let trace = trace();
        let outcome = TransformExecutor::default().resolve(&trace, &destination(None)).await;
        assert_eq!(outcome, TransformOutcome { payload: trace.data, warning: None });
    }

    #[tokio::test]
    async fn template_transform_reshapes_payload() {
        let trace = trace();
        let template = r#"{"m": "$.data.model", "to": "$.destination.name"}"#;
        let outcome =
            TransformExecutor::default().resolve(&trace, &destination(Some(template))).await;
        assert_eq!(outcome.payload, json!({"m": "gpt", "to": "sink"}));
        assert!(outcome.warning.is_none());
    }

    #[tokio::test]
    async fn broken_transform_falls_back_to_raw_data() {
        let trace = trace();
        let outcome =
            TransformExecutor::default().resolve(&trace, &destination(Some("{not json"))).await;
        assert_eq!(outcome.payload, trace.data);
        assert!(outcome.warning.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_transform_times_out_and_falls_back() {
        let trace = trace();
        let executor = TransformExecutor::new(Arc::new(StallingSandbox), Duration::from_millis(50));
        let outcome = executor.resolve(&trace, &destination(Some("anything"))).await;
        assert_eq!(outcome.payload, trace.data);
        assert!(outcome.warning.unwrap().contains("timeout"));
    }
}
