use anyhow::Context;
use reqwest::{Client, Request, Response};
use std::time::Duration;

use crate::error::AuthError;

/// HTTP client for credential endpoints with retry logic
#[derive(Debug, Clone)]
pub struct ServiceHttpClient {
    /// Shared HTTP client with connection pooling
    client: Client,

    /// Maximum number of retries
    max_retries: u32,

    /// Base delay for exponential backoff (milliseconds)
    base_delay_ms: u64,
}

impl ServiceHttpClient {
    /// Create a new HTTP client
    pub fn new(connect_timeout: u64, request_timeout: u64, max_retries: u32) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout))
            .timeout(Duration::from_secs(request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self::with_client(client, max_retries))
    }

    /// Wrap an existing client
    pub fn with_client(client: Client, max_retries: u32) -> Self {
        Self {
            client,
            max_retries,
            base_delay_ms: 1000,
        }
    }

    /// Override the backoff base delay
    pub fn with_base_delay(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }

    /// Execute a request with retry logic.
    /// 429, 5xx and transport errors back off exponentially; other errors fail at once.
    pub async fn request_with_retry(&self, request: Request) -> Result<Response, AuthError> {
        self.request_internal(request, true).await
    }

    /// Execute a request without retries. Fails fast on any error
    pub async fn request_no_retry(&self, request: Request) -> Result<Response, AuthError> {
        self.request_internal(request, false).await
    }

    async fn request_internal(
        &self,
        request: Request,
        enable_retry: bool,
    ) -> Result<Response, AuthError> {
        let max_retries = if enable_retry { self.max_retries } else { 0 };
        let mut attempt = 0;

        let method = request.method().clone();
        let url = request.url().clone();
        tracing::debug!(
            method = %method,
            url = %redact(&url),
            "Sending HTTP request"
        );

        loop {
            let req = request.try_clone().ok_or_else(|| {
                AuthError::System(anyhow::anyhow!("Request body is not cloneable"))
            })?;

            tracing::debug!(
                attempt = attempt + 1,
                max_retries = max_retries,
                "Executing request attempt"
            );

            match self.client.execute(req).await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        tracing::debug!(status = %status, "Request successful");
                        return Ok(response);
                    }

                    if matches!(status.as_u16(), 429 | 500..=599) && attempt < max_retries {
                        let delay = self.calculate_backoff_delay(attempt);
                        tracing::warn!(
                            "Received {}, retrying after {}ms (attempt {}/{})",
                            status,
                            delay,
                            attempt + 1,
                            max_retries
                        );

                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        attempt += 1;
                        continue;
                    }

                    // Non-retryable error or max retries exceeded
                    let error_text = response.text().await.unwrap_or_default();

                    tracing::error!(
                        status = status.as_u16(),
                        url = %redact(&url),
                        response_body = %error_text,
                        attempt = attempt + 1,
                        "HTTP request failed with error response"
                    );
                    return Err(AuthError::Remote {
                        status: status.as_u16(),
                        message: error_text,
                    });
                }

                Err(e) => {
                    let error_kind = if e.is_timeout() {
                        "timeout"
                    } else if e.is_connect() {
                        "connection_failed"
                    } else if e.is_request() {
                        "request_error"
                    } else if e.is_body() {
                        "body_error"
                    } else if e.is_decode() {
                        "decode_error"
                    } else {
                        "unknown"
                    };

                    tracing::warn!(
                        error_kind = error_kind,
                        error = %e,
                        url = %redact(&url),
                        attempt = attempt + 1,
                        "HTTP request error"
                    );

                    if attempt < max_retries {
                        let delay = self.calculate_backoff_delay(attempt);
                        tracing::warn!(
                            "Request failed: {}, retrying after {}ms (attempt {}/{})",
                            e,
                            delay,
                            attempt + 1,
                            max_retries
                        );

                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        attempt += 1;
                        continue;
                    }

                    tracing::error!(
                        error_kind = error_kind,
                        url = %redact(&url),
                        total_attempts = attempt + 1,
                        "HTTP request failed after all retries"
                    );

                    return Err(AuthError::System(anyhow::anyhow!(
                        "HTTP request failed: {} (kind: {})",
                        e,
                        error_kind
                    )));
                }
            }
        }
    }

    /// Calculate exponential backoff delay
    fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        // base_delay * 2^attempt, plus up to 10% jitter
        let delay = self.base_delay_ms * 2_u64.pow(attempt);
        let jitter = (delay as f64 * 0.1 * rand::random::<f64>()) as u64;
        delay + jitter
    }

    /// Get the underlying HTTP client
    pub fn client(&self) -> &Client {
        &self.client
    }
}

/// Strip the query string, which may carry tokens, before logging
fn redact(url: &reqwest::Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.to_string()
}
