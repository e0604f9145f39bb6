//! HTTP client for webhook delivery.
//!
//! Issues one request per call with a per-request timeout and method, and
//! maps reqwest failures onto transport errors. Non-2xx responses are
//! returned as responses; classifying them is the sender's job.

use std::{collections::HashMap, time::Duration};

use bytes::{Bytes, BytesMut};
use reqwest::{header::HeaderMap, Method, Response};
use serde::{Deserialize, Serialize};
use tally_core::{AttemptId, EventId, HttpMethod};
use tracing::{debug, info_span, warn, Instrument};

use crate::error::{DeliveryError, Result};

/// Fixed `User-Agent` sent with every delivery.
pub const USER_AGENT: &str = "Tally-Webhooks/1.0";

/// Upper bound on response bytes read from a subscriber.
const MAX_RESPONSE_BODY_SIZE: usize = 64 * 1024;

/// Configuration for the webhook delivery client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Time allowed to establish a connection.
    pub connect_timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
    /// Maximum number of redirects to follow. Zero disables redirects.
    pub max_redirects: u32,
    /// Whether to verify TLS certificates.
    pub verify_tls: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            user_agent: USER_AGENT.to_string(),
            max_redirects: 0,
            verify_tls: true,
        }
    }
}

/// HTTP client shared by all delivery workers.
///
/// Wraps a pooled `reqwest::Client`; cloning is cheap.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
}

/// One outbound webhook request.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    /// Attempt being executed.
    pub attempt_id: AttemptId,
    /// Event being delivered.
    pub event_id: EventId,
    /// Attempt number within the lineage.
    pub attempt_number: u32,
    /// Destination URL.
    pub url: String,
    /// HTTP method.
    pub method: HttpMethod,
    /// Request headers.
    pub headers: Vec<(&'static str, String)>,
    /// Request body.
    pub body: Bytes,
    /// Total time allowed for the request.
    pub timeout: Duration,
}

/// Response from a subscriber.
#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Response headers.
    pub headers: HashMap<String, String>,
    /// Response body, capped in size.
    pub body: Bytes,
    /// Total duration of the request.
    pub duration: Duration,
    /// Whether the status was 2xx.
    pub is_success: bool,
}

impl DeliveryClient {
    /// Creates a new delivery client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::InternalError` if the HTTP client cannot be
    /// built with the provided settings.
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let redirect = match config.max_redirects {
            0 => reqwest::redirect::Policy::none(),
            n => reqwest::redirect::Policy::limited(n as usize),
        };

        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(&config.user_agent)
            .redirect(redirect)
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .map_err(|e| DeliveryError::internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client })
    }

    /// Creates a new delivery client with default configuration.
    ///
    /// # Errors
    ///
    /// See [`DeliveryClient::new`].
    pub fn with_defaults() -> Result<Self> {
        Self::new(&ClientConfig::default())
    }

    /// Sends one webhook request.
    ///
    /// # Errors
    ///
    /// - `Timeout` when the request exceeds `request.timeout`
    /// - `NetworkError` for DNS, connect and TLS failures
    ///
    /// Any HTTP status, including 4xx and 5xx, is returned as `Ok`.
    pub async fn deliver(&self, request: DeliveryRequest) -> Result<DeliveryResponse> {
        let start_time = std::time::Instant::now();

        let span = info_span!(
            "webhook_delivery",
            event_id = %request.event_id,
            attempt_id = %request.attempt_id,
            url = %request.url,
            attempt = request.attempt_number
        );

        async move {
            debug!("starting webhook delivery");

            let mut http_request = self
                .client
                .request(to_reqwest_method(request.method), &request.url)
                .timeout(request.timeout)
                .body(request.body);

            for (name, value) in &request.headers {
                http_request = http_request.header(*name, value);
            }

            let response = match http_request.send().await {
                Ok(response) => response,
                Err(e) => {
                    let duration = start_time.elapsed();
                    warn!(duration_ms = duration.as_millis(), error = %e, "request failed");

                    if e.is_timeout() {
                        return Err(DeliveryError::timeout(request.timeout.as_secs()));
                    }
                    if e.is_connect() {
                        return Err(DeliveryError::network(format!("connection failed: {e}")));
                    }
                    return Err(DeliveryError::network(e.to_string()));
                },
            };

            let delivery_response = read_response(response, start_time).await?;

            debug!(
                status_code = delivery_response.status_code,
                duration_ms = delivery_response.duration.as_millis(),
                "received response"
            );

            Ok(delivery_response)
        }
        .instrument(span)
        .await
    }
}

fn to_reqwest_method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Patch => Method::PATCH,
    }
}

async fn read_response(
    mut response: Response,
    start_time: std::time::Instant,
) -> Result<DeliveryResponse> {
    let status_code = response.status().as_u16();
    let is_success = response.status().is_success();
    let headers = extract_headers(response.headers());

    let mut body = BytesMut::new();
    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let remaining = MAX_RESPONSE_BODY_SIZE - body.len();
                body.extend_from_slice(&chunk[..chunk.len().min(remaining)]);
                if body.len() >= MAX_RESPONSE_BODY_SIZE {
                    break;
                }
            },
            Ok(None) => break,
            Err(e) => {
                // Status already arrived; a broken body does not change it
                warn!(error = %e, "failed to read response body");
                break;
            },
        }
    }

    Ok(DeliveryResponse {
        status_code,
        headers,
        body: body.freeze(),
        duration: start_time.elapsed(),
        is_success,
    })
}

/// Extracts headers from reqwest HeaderMap into a standard HashMap.
fn extract_headers(header_map: &HeaderMap) -> HashMap<String, String> {
    let mut headers = HashMap::new();

    for (key, value) in header_map {
        if let Ok(value_str) = value.to_str() {
            headers.insert(key.to_string(), value_str.to_string());
        }
    }

    headers
}
