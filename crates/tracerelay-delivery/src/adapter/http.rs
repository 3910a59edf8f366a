//! Shared HTTP client used by the HTTP-based adapters.
//!
//! Handles request construction, response capture and error categorization
//! so adapters only decide URL, headers and body.

use std::{collections::HashMap, time::Duration};

use bytes::Bytes;
use reqwest::header::HeaderMap;
use tracing::{info_span, Instrument};

use crate::error::{DeliveryError, Result};

/// Largest response body kept in `response_data`.
const MAX_RESPONSE_BODY_SIZE: usize = 16 * 1024;

/// Configuration for the adapter HTTP client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Upper bound for any request; per-attempt timeouts are applied on top.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
    /// Maximum number of redirects to follow.
    pub max_redirects: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: concat!("tracerelay/", env!("CARGO_PKG_VERSION")).to_string(),
            max_redirects: 3,
        }
    }
}

/// Outgoing request built by an adapter.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Destination URL.
    pub url: String,
    /// Extra request headers.
    pub headers: Vec<(String, String)>,
    /// Request body.
    pub body: Bytes,
    /// Basic auth credentials, if any.
    pub basic_auth: Option<(String, String)>,
    /// Per-attempt timeout.
    pub timeout: Duration,
}

/// Captured response of a successful (2xx) request.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Response headers.
    pub headers: HashMap<String, String>,
    /// Response body, truncated.
    pub body: String,
    /// Total duration of the request.
    pub duration: Duration,
}

/// Connection-pooled HTTP client for adapters.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    /// Creates a client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the client cannot be built.
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client })
    }

    /// Creates a client with default configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the client cannot be built.
    pub fn with_defaults() -> Result<Self> {
        Self::new(&ClientConfig::default())
    }

    /// POSTs a JSON body and categorizes the outcome.
    ///
    /// # Errors
    ///
    /// - `Timeout` when the per-attempt timeout elapses
    /// - `Network` for connection and transport failures
    /// - `RateLimited` for 429 responses
    /// - `ClientError` for other 4xx responses
    /// - `ServerError` for 5xx and unexpected responses
    pub async fn post_json(&self, provider: &str, request: HttpRequest) -> Result<HttpResponse> {
        let start_time = std::time::Instant::now();
        let span = info_span!("adapter_http", provider, url = %request.url);

        async move {
            let mut http_request = self
                .client
                .post(&request.url)
                .timeout(request.timeout)
                .header("content-type", "application/json")
                .body(request.body);

            for (key, value) in &request.headers {
                http_request = http_request.header(key, value);
            }
            if let Some((user, password)) = &request.basic_auth {
                http_request = http_request.basic_auth(user, Some(password));
            }

            let response = match http_request.send().await {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(
                        duration_ms = start_time.elapsed().as_millis(),
                        error = %e,
                        "request failed"
                    );
                    if e.is_timeout() {
                        return Err(DeliveryError::timeout(request.timeout));
                    }
                    if e.is_connect() {
                        return Err(DeliveryError::network(format!("connection failed: {e}")));
                    }
                    return Err(DeliveryError::network(e.to_string()));
                },
            };

            let status_code = response.status().as_u16();
            let headers = extract_headers(response.headers());
            let body = read_body(response).await;
            let duration = start_time.elapsed();

            tracing::debug!(
                status = status_code,
                duration_ms = duration.as_millis(),
                "received response"
            );

            match status_code {
                200..=299 => Ok(HttpResponse { status_code, headers, body, duration }),
                429 => Err(DeliveryError::rate_limited(
                    extract_retry_after_seconds(&headers).unwrap_or(60),
                )),
                400..=499 => Err(DeliveryError::client_error(status_code, body)),
                _ => Err(DeliveryError::server_error(status_code, body)),
            }
        }
        .instrument(span)
        .await
    }
}

async fn read_body(response: reqwest::Response) -> String {
    match response.bytes().await {
        Ok(bytes) if bytes.len() > MAX_RESPONSE_BODY_SIZE => {
            let truncated = String::from_utf8_lossy(&bytes[..MAX_RESPONSE_BODY_SIZE]);
            format!("{truncated}... (truncated)")
        },
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            tracing::warn!(error = %e, "failed to read response body");
            format!("[failed to read response body: {e}]")
        },
    }
}

fn extract_headers(header_map: &HeaderMap) -> HashMap<String, String> {
    header_map
        .iter()
        .filter_map(|(key, value)| Some((key.to_string(), value.to_str().ok()?.to_string())))
        .collect()
}

/// Extracts a Retry-After delay in seconds.
///
/// Supports both the delta-seconds and HTTP-date forms.
pub fn extract_retry_after_seconds<S: std::hash::BuildHasher>(
    headers: &HashMap<String, String, S>,
) -> Option<u64> {
    let retry_after = headers.get("retry-after")?;

    if let Ok(seconds) = retry_after.trim().parse::<u64>() {
        return Some(seconds);
    }

    let date_time = chrono::DateTime::parse_from_rfc2822(retry_after).ok()?;
    let delta = date_time.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(delta.to_std().map(|d| d.as_secs()).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;

    fn request(url: String) -> HttpRequest {
        HttpRequest {
            url,
            headers: vec![("x-extra".to_string(), "1".to_string())],
            body: Bytes::from_static(br#"{"a":1}"#),
            basic_auth: None,
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn successful_post_captures_response() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::header("x-extra", "1"))
            .and(matchers::header("content-type", "application/json"))
            .respond_with(ResponseTemplate::new(202).set_body_string("accepted"))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpClient::with_defaults().unwrap();
        let response = client.post_json("test", request(server.uri())).await.unwrap();

        assert_eq!(response.status_code, 202);
        assert_eq!(response.body, "accepted");
    }

    #[tokio::test]
    async fn status_codes_are_categorized() {
        let server = MockServer::start().await;
        Mock::given(matchers::path("/500"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(matchers::path("/404"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(matchers::path("/429"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "17"))
            .mount(&server)
            .await;

        let client = HttpClient::with_defaults().unwrap();
        let url = format!("{}/500", server.uri());
        let err = client.post_json("test", request(url)).await.unwrap_err();
        assert!(matches!(err, DeliveryError::ServerError { status_code: 500, .. }));

        let url = format!("{}/404", server.uri());
        let err = client.post_json("test", request(url)).await.unwrap_err();
        assert!(matches!(err, DeliveryError::ClientError { status_code: 404, .. }));

        let url = format!("{}/429", server.uri());
        let err = client.post_json("test", request(url)).await.unwrap_err();
        assert_eq!(err.retry_after_seconds(), Some(17));
    }

    #[tokio::test]
    async fn slow_destination_times_out() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let client = HttpClient::with_defaults().unwrap();
        let mut slow = request(server.uri());
        slow.timeout = Duration::from_millis(100);

        let err = client.post_json("test", slow).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Timeout { .. }));
    }

    #[test]
    fn retry_after_parses_seconds() {
        let mut headers = HashMap::new();
        headers.insert("retry-after".to_string(), "120".to_string());
        assert_eq!(extract_retry_after_seconds(&headers), Some(120));
        assert_eq!(extract_retry_after_seconds(&HashMap::<String, String>::new()), None);
    }
}
