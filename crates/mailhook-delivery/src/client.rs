//! Outbound HTTP transport for notification POSTs.
//!
//! Non-2xx responses come back as a `DeliveryResponse` with
//! `is_success == false`; only transport failures are errors here. The
//! executor decides what a non-2xx status means for the job.

use std::time::{Duration, Instant};

use bytes::Bytes;
use mailhook_core::HeaderSet;
use reqwest::Response;
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};
use uuid::Uuid;

use crate::error::{DeliveryError, Result};

/// Response bodies are only kept for logs and error flags.
const MAX_RESPONSE_BODY_SIZE: usize = 1024;

/// Transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Timeout for a single POST.
    pub timeout: Duration,
    /// Default user agent, also sent explicitly as a base header.
    pub user_agent: String,
    /// Redirects followed before giving up.
    pub max_redirects: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: concat!("mailhook/", env!("CARGO_PKG_VERSION")).to_string(),
            max_redirects: 5,
        }
    }
}

/// HTTP client for posting notifications.
///
/// Cloning is cheap; the underlying connection pool is shared.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    config: ClientConfig,
}

/// One POST to a webhook endpoint.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    /// Identifier of this attempt, for log correlation only.
    pub delivery_id: Uuid,
    /// Destination URL without credentials.
    pub url: String,
    /// Fully layered request headers.
    pub headers: HeaderSet,
    /// Signed JSON body.
    pub body: Bytes,
}

impl DeliveryRequest {
    /// Creates a request with a fresh attempt identifier.
    pub fn new(url: impl Into<String>, headers: HeaderSet, body: impl Into<Bytes>) -> Self {
        Self { delivery_id: Uuid::new_v4(), url: url.into(), headers, body: body.into() }
    }
}

/// What the endpoint answered.
#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Response body, truncated.
    pub body: String,
    /// Time from send to fully read body.
    pub duration: Duration,
    /// Whether the status was 2xx.
    pub is_success: bool,
}

impl DeliveryResponse {
    /// Converts a non-2xx response into the matching error.
    pub fn into_result(self) -> Result<Self> {
        if self.is_success {
            Ok(self)
        } else {
            Err(DeliveryError::from_status(self.status_code, self.body))
        }
    }
}

impl DeliveryClient {
    /// Builds the underlying reqwest client.
    ///
    /// # Errors
    ///
    /// `ConfigurationError` when reqwest rejects the settings.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects as usize))
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    /// Client with [`ClientConfig::default`].
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// Configured user agent.
    pub fn user_agent(&self) -> &str {
        &self.config.user_agent
    }

    /// Posts the request body to the destination.
    ///
    /// # Errors
    ///
    /// - `Timeout` when the configured timeout elapses
    /// - `NetworkError` for connection and other transport failures
    /// - `ConfigurationError` when a header cannot be encoded
    pub async fn deliver(&self, request: DeliveryRequest) -> Result<DeliveryResponse> {
        let started = Instant::now();

        let span = info_span!(
            "webhook_delivery",
            delivery_id = %request.delivery_id,
            url = %request.url,
        );

        async move {
            tracing::debug!("starting webhook delivery");

            let mut http_request = self.client.post(&request.url).body(request.body);

            for (key, value) in request.headers.iter() {
                if is_managed_header(key) {
                    continue;
                }
                let name = reqwest::header::HeaderName::from_bytes(key.as_bytes())
                    .map_err(|e| DeliveryError::configuration(format!("header {key:?}: {e}")))?;
                let value = reqwest::header::HeaderValue::from_str(value)
                    .map_err(|e| DeliveryError::configuration(format!("header {key:?}: {e}")))?;
                http_request = http_request.header(name, value);
            }

            let response = match http_request.send().await {
                Ok(response) => response,
                Err(e) => {
                    let duration = started.elapsed();
                    tracing::warn!(elapsed = ?duration, error = %e, "webhook request failed");

                    if e.is_timeout() {
                        return Err(DeliveryError::timeout(self.config.timeout.as_secs()));
                    }
                    if e.is_connect() {
                        return Err(DeliveryError::network(format!("connection failed: {e}")));
                    }
                    return Err(DeliveryError::network(e.to_string()));
                },
            };

            let duration = started.elapsed();
            let reply = read_response(response, duration).await;

            tracing::debug!(
                status = reply.status_code,
                elapsed = ?duration,
                "endpoint answered"
            );

            Ok(reply)
        }
        .instrument(span)
        .await
    }
}

async fn read_response(response: Response, duration: Duration) -> DeliveryResponse {
    let status = response.status();
    let (status_code, is_success) = (status.as_u16(), status.is_success());

    let body = match response.bytes().await {
        Ok(bytes) if bytes.len() > MAX_RESPONSE_BODY_SIZE => {
            let truncated = String::from_utf8_lossy(&bytes[..MAX_RESPONSE_BODY_SIZE]);
            format!("{truncated}... (truncated)")
        },
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            tracing::warn!(error = %e, "could not read response body");
            String::new()
        },
    };

    DeliveryResponse { status_code, body, duration, is_success }
}

/// Headers the HTTP stack computes itself.
fn is_managed_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "content-length"
            | "host"
            | "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}
