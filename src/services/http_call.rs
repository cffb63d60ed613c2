//! HTTP Call Primitive
//!
//! Retrying wrapper around reqwest shared by every outbound call in the
//! core. Exponential backoff between 2s and 10s, at most three attempts,
//! retries on transient errors only (timeout, connection reset, 5xx, 408).
//! 429 maps to a dedicated rate-limit error instead of a blind retry.

use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tokio::time::sleep;

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_SECS: u64 = 2;
const BACKOFF_CAP_SECS: u64 = 10;

/// Structured outcome of a failed HTTP call.
#[derive(Debug, thiserror::Error)]
pub enum HttpCallError {
    #[error("request timed out after {0}s")]
    Timeout(u64),

    #[error("connection error: {0}")]
    Connect(String),

    #[error("DNS resolution failed: {0}")]
    Dns(String),

    #[error("rate limited, retry after {retry_after}s")]
    RateLimited { retry_after: u64 },

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid response body: {0}")]
    Decode(String),
}

impl HttpCallError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Connect(_) | Self::Dns(_) => true,
            Self::Status { status, .. } => *status >= 500 || *status == 408,
            _ => false,
        }
    }
}

/// A header name/value pair. Kept as owned strings so adapters can build
/// bearer headers from runtime configuration.
pub type Header = (&'static str, String);

/// Retrying HTTP client shared by all adapters and the LLM transport.
#[derive(Clone)]
pub struct RetryingClient {
    client: Client,
}

impl Default for RetryingClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryingClient {
    pub fn new() -> Self {
        // Per-request timeouts are set on each call; the builder timeout is
        // an upper bound safety net.
        let client = Client::builder()
            .timeout(Duration::from_secs(180))
            .build()
            .expect("Failed to create HTTP client");
        Self { client }
    }

    /// GET a JSON document.
    pub async fn get_json(
        &self,
        url: &str,
        headers: &[Header],
        timeout: Duration,
    ) -> Result<Value, HttpCallError> {
        self.with_retry(|| async {
            let mut req = self.client.get(url).timeout(timeout);
            for (name, value) in headers {
                req = req.header(*name, value);
            }
            let response = req.send().await.map_err(map_reqwest_error)?;
            let response = check_status(response).await?;
            response
                .json::<Value>()
                .await
                .map_err(|e| HttpCallError::Decode(e.to_string()))
        })
        .await
    }

    /// GET a text body (HTML scraping).
    pub async fn get_text(
        &self,
        url: &str,
        headers: &[Header],
        timeout: Duration,
    ) -> Result<String, HttpCallError> {
        self.with_retry(|| async {
            let mut req = self.client.get(url).timeout(timeout);
            for (name, value) in headers {
                req = req.header(*name, value);
            }
            let response = req.send().await.map_err(map_reqwest_error)?;
            let response = check_status(response).await?;
            response
                .text()
                .await
                .map_err(|e| HttpCallError::Decode(e.to_string()))
        })
        .await
    }

    /// POST a JSON body, expect a JSON document back.
    pub async fn post_json(
        &self,
        url: &str,
        headers: &[Header],
        body: &Value,
        timeout: Duration,
    ) -> Result<Value, HttpCallError> {
        self.with_retry(|| async {
            let mut req = self.client.post(url).timeout(timeout).json(body);
            for (name, value) in headers {
                req = req.header(*name, value);
            }
            let response = req.send().await.map_err(map_reqwest_error)?;
            let response = check_status(response).await?;
            response
                .json::<Value>()
                .await
                .map_err(|e| HttpCallError::Decode(e.to_string()))
        })
        .await
    }

    async fn with_retry<F, Fut, T>(&self, call: F) -> Result<T, HttpCallError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, HttpCallError>>,
    {
        let mut last_error = None;

        for attempt in 1..=MAX_ATTEMPTS {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                    let delay = backoff_delay(attempt);
                    tracing::warn!(
                        "HTTP call failed (attempt {}/{}): {} - retrying in {:?}",
                        attempt,
                        MAX_ATTEMPTS,
                        e,
                        delay
                    );
                    last_error = Some(e);
                    sleep(delay).await;
                },
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or(HttpCallError::Connect("retries exhausted".to_string())))
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let secs = BACKOFF_BASE_SECS.saturating_mul(1u64 << (attempt - 1));
    Duration::from_secs(secs.min(BACKOFF_CAP_SECS))
}

fn map_reqwest_error(e: reqwest::Error) -> HttpCallError {
    if e.is_timeout() {
        HttpCallError::Timeout(0)
    } else if e.is_connect() {
        let msg = e.to_string();
        if msg.contains("dns") || msg.contains("resolve") {
            HttpCallError::Dns(msg)
        } else {
            HttpCallError::Connect(msg)
        }
    } else {
        HttpCallError::Connect(e.to_string())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, HttpCallError> {
    let status = response.status();

    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(60);
        return Err(HttpCallError::RateLimited { retry_after });
    }

    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        let body = body.chars().take(500).collect::<String>();
        return Err(HttpCallError::Status { status: status.as_u16(), body });
    }

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_within_bounds() {
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        assert_eq!(backoff_delay(3), Duration::from_secs(8));
        assert_eq!(backoff_delay(4), Duration::from_secs(10));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(HttpCallError::Timeout(10).is_retryable());
        assert!(HttpCallError::Connect("reset".into()).is_retryable());
        assert!(HttpCallError::Status { status: 500, body: String::new() }.is_retryable());
        assert!(HttpCallError::Status { status: 408, body: String::new() }.is_retryable());
        assert!(!HttpCallError::Status { status: 404, body: String::new() }.is_retryable());
        assert!(!HttpCallError::RateLimited { retry_after: 60 }.is_retryable());
        assert!(!HttpCallError::Decode("bad json".into()).is_retryable());
    }
}
