//! Datadog logs intake adapter.
//!
//! Config: `api_key` (required), `site` (`datadoghq.com` by default, or a
//! full base URL), `service`, `source` and `tags`.

use serde::Deserialize;
use serde_json::{json, Value};

use super::{
    encode_body,
    http::{HttpClient, HttpRequest},
    parse_config, Adapter, AdapterResult, DeliveryContext,
};
use crate::error::{DeliveryError, Result};

/// Provider tag for this adapter.
pub const PROVIDER: &str = "datadog";

const DEFAULT_SITE: &str = "datadoghq.com";
const DEFAULT_SOURCE: &str = "tracerelay";
const LOGS_PATH: &str = "/api/v2/logs";

#[derive(Debug, Deserialize)]
struct DatadogConfig {
    api_key: String,
    site: Option<String>,
    service: Option<String>,
    source: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
}

impl DatadogConfig {
    fn intake_url(&self) -> String {
        let site = self.site.as_deref().unwrap_or(DEFAULT_SITE).trim_end_matches('/');
        if site.starts_with("http://") || site.starts_with("https://") {
            format!("{site}{LOGS_PATH}")
        } else {
            format!("https://http-intake.logs.{site}{LOGS_PATH}")
        }
    }
}

/// Ships payloads as log entries to Datadog.
#[derive(Debug, Clone)]
pub struct DatadogAdapter {
    client: HttpClient,
}

impl DatadogAdapter {
    /// Creates the adapter on a shared client.
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }

    fn build_request(ctx: &DeliveryContext<'_>) -> Result<HttpRequest> {
        let config: DatadogConfig = parse_config(PROVIDER, ctx.config)?;
        if config.api_key.trim().is_empty() {
            return Err(DeliveryError::configuration("datadog api_key is empty"));
        }

        let entry = log_entry(&config, ctx);
        let body = encode_body(&Value::Array(vec![entry]))?;

        Ok(HttpRequest {
            url: config.intake_url(),
            headers: vec![("DD-API-KEY".to_string(), config.api_key)],
            body,
            basic_auth: None,
            timeout: ctx.timeout,
        })
    }
}

fn log_entry(config: &DatadogConfig, ctx: &DeliveryContext<'_>) -> Value {
    let message = match ctx.payload {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };

    let mut entry = json!({
        "ddsource": config.source.as_deref().unwrap_or(DEFAULT_SOURCE),
        "message": message,
        "trace_id": ctx.trace.external_trace_id.clone().unwrap_or_else(|| ctx.trace.id.to_string()),
        "span_id": ctx.trace.span_id,
    });
    if let Some(service) = &config.service {
        entry["service"] = Value::String(service.clone());
    }
    if !config.tags.is_empty() {
        entry["ddtags"] = Value::String(config.tags.join(","));
    }
    entry
}

#[async_trait::async_trait]
impl Adapter for DatadogAdapter {
    async fn deliver(&self, ctx: &DeliveryContext<'_>) -> AdapterResult {
        match Self::build_request(ctx) {
            Ok(request) => AdapterResult::from_http(self.client.post_json(PROVIDER, request).await),
            Err(e) => AdapterResult::from_error(&e),
        }
    }
}
