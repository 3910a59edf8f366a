//! Langfuse ingestion API adapter.
//!
//! Config: `public_key`, `secret_key` and optional `host`
//! (`https://cloud.langfuse.com` by default). The payload becomes the body
//! of a single `trace-create` event in an ingestion batch. The event ID is
//! the trace ID so retried batches are deduplicated by Langfuse.

use serde::Deserialize;
use serde_json::{json, Value};

use super::{
    encode_body,
    http::{HttpClient, HttpRequest},
    parse_config, Adapter, AdapterResult, DeliveryContext,
};
use crate::error::{DeliveryError, Result};

/// Provider tag for this adapter.
pub const PROVIDER: &str = "langfuse";

const DEFAULT_HOST: &str = "https://cloud.langfuse.com";
const INGESTION_PATH: &str = "/api/public/ingestion";

#[derive(Debug, Deserialize)]
struct LangfuseConfig {
    public_key: String,
    secret_key: String,
    host: Option<String>,
}

/// Ships payloads to Langfuse as trace events.
#[derive(Debug, Clone)]
pub struct LangfuseAdapter {
    client: HttpClient,
}

impl LangfuseAdapter {
    /// Creates the adapter on a shared client.
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }

    fn build_request(ctx: &DeliveryContext<'_>) -> Result<HttpRequest> {
        let config: LangfuseConfig = parse_config(PROVIDER, ctx.config)?;
        if config.public_key.is_empty() || config.secret_key.is_empty() {
            return Err(DeliveryError::configuration("langfuse keys must not be empty"));
        }

        let host = config.host.as_deref().unwrap_or(DEFAULT_HOST).trim_end_matches('/');
        let body = encode_body(&ingestion_batch(ctx))?;

        Ok(HttpRequest {
            url: format!("{host}{INGESTION_PATH}"),
            headers: Vec::new(),
            body,
            basic_auth: Some((config.public_key, config.secret_key)),
            timeout: ctx.timeout,
        })
    }
}

fn ingestion_batch(ctx: &DeliveryContext<'_>) -> Value {
    let trace_id = ctx.trace.external_trace_id.clone().unwrap_or_else(|| ctx.trace.id.to_string());

    let body = match ctx.payload {
        Value::Object(fields) => {
            let mut fields = fields.clone();
            fields.entry("id").or_insert_with(|| Value::String(trace_id.clone()));
            Value::Object(fields)
        },
        other => json!({ "id": trace_id, "input": other }),
    };

    json!({
        "batch": [{
            "id": ctx.trace.id.to_string(),
            "timestamp": ctx.trace.created_at.to_rfc3339(),
            "type": "trace-create",
            "body": body,
        }]
    })
}

#[async_trait::async_trait]
impl Adapter for LangfuseAdapter {
    async fn deliver(&self, ctx: &DeliveryContext<'_>) -> AdapterResult {
        match Self::build_request(ctx) {
            Ok(request) => AdapterResult::from_http(self.client.post_json(PROVIDER, request).await),
            Err(e) => AdapterResult::from_error(&e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::adapter::test_support;

    #[tokio::test]
    async fn posts_batch_with_basic_auth() {
        let server = MockServer::start().await;
        let trace = test_support::trace();
        let payload = json!({"name": "chat", "output": "hi"});
        let auth = format!("Basic {}", STANDARD.encode("pk-lf:sk-lf"));

        Mock::given(matchers::method("POST"))
            .and(matchers::path("/api/public/ingestion"))
            .and(matchers::header("authorization", auth.as_str()))
            .respond_with(
                ResponseTemplate::new(207).set_body_json(json!({"successes": [], "errors": []})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let config = json!({"public_key": "pk-lf", "secret_key": "sk-lf", "host": server.uri()});
        let ctx = DeliveryContext {
            trace: &trace,
            config: &config,
            payload: &payload,
            attempt: 1,
            timeout: Duration::from_secs(5),
        };

        let result = LangfuseAdapter::new(test_support::client()).deliver(&ctx).await;
        assert!(result.success, "{result:?}");

        let requests = server.received_requests().await.unwrap();
        let sent: Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(sent["batch"][0]["type"], "trace-create");
        assert_eq!(sent["batch"][0]["id"], trace.id.to_string());
        let body = json!({"id": "ext-1", "name": "chat", "output": "hi"});
        assert_eq!(sent["batch"][0]["body"], body);
    }

    #[test]
    fn non_object_payloads_are_wrapped() {
        let trace = test_support::trace();
        let payload = json!([1, 2]);
        let ctx = DeliveryContext {
            trace: &trace,
            config: &Value::Null,
            payload: &payload,
            attempt: 1,
            timeout: Duration::from_secs(1),
        };

        let batch = ingestion_batch(&ctx);
        assert_eq!(batch["batch"][0]["body"], json!({"id": "ext-1", "input": [1, 2]}));
    }

    #[tokio::test]
    async fn missing_keys_are_permanent() {
        let trace = test_support::trace();
        let config = json!({"public_key": "pk"});
        let ctx = DeliveryContext {
            trace: &trace,
            config: &config,
            payload: &trace.data,
            attempt: 1,
            timeout: Duration::from_secs(5),
        };

        let result = LangfuseAdapter::new(test_support::client()).deliver(&ctx).await;
        assert!(result.permanent);
    }
}
