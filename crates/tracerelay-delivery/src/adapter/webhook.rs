//! Generic JSON webhook adapter.
//!
//! Config:
//!
//! ```json
//! {
//!   "url": "https://example.com/hooks/traces",
//!   "headers": { "x-team": "ml" },
//!   "signing_secret": "s3cret",
//!   "signature_header": "X-Tracerelay-Signature"
//! }
//! ```
//!
//! With a signing secret the body is signed with HMAC-SHA256 and the
//! signature is sent as `sha256=<hex>`.

use std::collections::HashMap;

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use super::{
    encode_body,
    http::{HttpClient, HttpRequest},
    parse_config, Adapter, AdapterResult, DeliveryContext,
};
use crate::error::{DeliveryError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Provider tag for this adapter.
pub const PROVIDER: &str = "webhook";

/// Default header carrying the body signature.
pub const DEFAULT_SIGNATURE_HEADER: &str = "X-Tracerelay-Signature";

#[derive(Debug, Deserialize)]
struct WebhookConfig {
    url: String,
    #[serde(default)]
    headers: HashMap<String, String>,
    signing_secret: Option<String>,
    signature_header: Option<String>,
}

/// POSTs the payload as JSON to a configured URL.
#[derive(Debug, Clone)]
pub struct WebhookAdapter {
    client: HttpClient,
}

impl WebhookAdapter {
    /// Creates the adapter on a shared client.
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }

    fn build_request(ctx: &DeliveryContext<'_>) -> Result<HttpRequest> {
        let config: WebhookConfig = parse_config(PROVIDER, ctx.config)?;
        if !(config.url.starts_with("http://") || config.url.starts_with("https://")) {
            return Err(DeliveryError::configuration("webhook url must be http(s)"));
        }

        let body = encode_body(ctx.payload)?;

        let mut headers: Vec<(String, String)> = config
            .headers
            .into_iter()
            .filter(|(key, _)| !is_managed_header(key))
            .collect();
        headers.push(("X-Tracerelay-Trace-Id".to_string(), ctx.trace.id.to_string()));
        headers.push(("X-Tracerelay-Attempt".to_string(), ctx.attempt.to_string()));

        if let Some(secret) = config.signing_secret {
            let header = config
                .signature_header
                .unwrap_or_else(|| DEFAULT_SIGNATURE_HEADER.to_string());
            headers.push((header, format!("sha256={}", sign(secret.as_bytes(), &body)?)));
        }

        Ok(HttpRequest { url: config.url, headers, body, basic_auth: None, timeout: ctx.timeout })
    }
}

#[async_trait::async_trait]
impl Adapter for WebhookAdapter {
    async fn deliver(&self, ctx: &DeliveryContext<'_>) -> AdapterResult {
        match Self::build_request(ctx) {
            Ok(request) => AdapterResult::from_http(self.client.post_json(PROVIDER, request).await),
            Err(e) => AdapterResult::from_error(&e),
        }
    }
}

/// Computes the hex HMAC-SHA256 of `body` under `secret`.
///
/// # Errors
///
/// Returns `DeliveryError::Configuration` if the key is rejected.
pub fn sign(secret: &[u8], body: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| DeliveryError::configuration(format!("invalid signing secret: {e}")))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Headers that configuration may not override.
fn is_managed_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "content-type"
            | "content-length"
            | "host"
            | "user-agent"
            | "x-tracerelay-trace-id"
            | "x-tracerelay-attempt"
            | "x-tracerelay-signature"
    )
}
