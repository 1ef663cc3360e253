//! HTTP client for the backend's progress endpoints
//!
//! Complements the WebSocket stream: connection counts for an upload,
//! server-side publishing of progress events and broadcasts.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::events::ProgressEvent;

/// Response from GET /api/progress/{upload_id}/connections
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub upload_id: String,
    pub active_connections: usize,
    /// "active" or "inactive"
    pub status: String,
}

/// Response from GET /api/progress/connections
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSummary {
    pub total_uploads: usize,
    pub total_connections: usize,
    #[serde(default)]
    pub connections_by_upload: HashMap<String, usize>,
}

/// Acknowledgement returned by the POST endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct Acknowledgement {
    #[serde(default)]
    pub message: String,
}

/// HTTP client for the progress REST API
pub struct ProgressApiClient {
    config: ServerConfig,
    http_client: reqwest::Client,
    base_url: String,
}

impl ProgressApiClient {
    /// Create a new client from configuration
    pub fn new(config: ServerConfig) -> Result<Self> {
        let base_url = config.url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(Error::Config("server.url is required".to_string()));
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            config,
            http_client,
            base_url,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn progress_url(&self, upload_id: &str, suffix: &str) -> String {
        format!(
            "{}/api/progress/{}/{}",
            self.base_url,
            urlencoding::encode(upload_id),
            suffix
        )
    }

    /// Number of progress listeners attached to an upload
    pub async fn connection_info(&self, upload_id: &str) -> Result<ConnectionInfo> {
        let url = self.progress_url(upload_id, "connections");
        self.with_retry("connection_info", || self.get_json(&url))
            .await
    }

    /// Listener counts across all uploads
    pub async fn all_connections(&self) -> Result<ConnectionSummary> {
        let url = format!("{}/api/progress/connections", self.base_url);
        self.with_retry("all_connections", || self.get_json(&url))
            .await
    }

    /// Publish a progress event to every listener of its upload.
    ///
    /// The event must carry `upload_id`; `progress` and `message` default to
    /// 0.0 and the event type when absent, as the backend requires both.
    pub async fn send_progress_update(&self, event: &ProgressEvent) -> Result<Acknowledgement> {
        let upload_id = event
            .upload_id
            .as_deref()
            .ok_or_else(|| Error::Api("progress event is missing upload_id".to_string()))?;

        let mut body = event.clone();
        body.progress.get_or_insert(0.0);
        if body.message.is_none() {
            body.message = Some(body.kind.to_string());
        }

        let url = self.progress_url(upload_id, "send");
        self.with_retry("send_progress_update", || self.post_json(&url, &body))
            .await
    }

    /// Broadcast an arbitrary JSON object to an upload's listeners
    pub async fn broadcast(
        &self,
        upload_id: &str,
        message: &serde_json::Value,
    ) -> Result<Acknowledgement> {
        if !message.is_object() {
            return Err(Error::Api("broadcast payload must be a JSON object".to_string()));
        }
        let url = self.progress_url(upload_id, "broadcast");
        self.with_retry("broadcast", || self.post_json(&url, message))
            .await
    }

    /// Check if the backend is reachable
    pub async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/health", self.base_url);

        match self.http_client.get(&url).send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(_) => Ok(false),
        }
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: &str) -> Result<T> {
        let response = self
            .http_client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Api(format!("HTTP request failed: {}", e)))?;
        Self::parse_response(response).await
    }

    async fn post_json<B: Serialize + ?Sized, T: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<T> {
        let response = self
            .http_client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Api(format!("HTTP request failed: {}", e)))?;
        Self::parse_response(response).await
    }

    async fn parse_response<T: for<'de> Deserialize<'de>>(response: reqwest::Response) -> Result<T> {
        let status = response.status();

        if status.is_success() {
            response
                .json()
                .await
                .map_err(|e| Error::Api(format!("failed to parse response: {}", e)))
        } else {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            Err(Error::Api(format!("API error ({}): {}", status, error_text)))
        }
    }

    /// Run `op`, retrying transient failures with exponential backoff
    async fn with_retry<T, F, Fut>(&self, operation: &str, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut last_error = None;
        let mut delay = Duration::from_millis(500);

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                tracing::debug!(
                    "Retrying {} (attempt {}/{}), waiting {:?}",
                    operation,
                    attempt + 1,
                    self.config.max_retries + 1,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, Duration::from_secs(30));
            }

            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if is_retryable_error(&e) => {
                    tracing::warn!(operation, error = %e, "Transient API error");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Api("max retries exceeded".to_string())))
    }
}

/// Check if an error is retryable (transient)
fn is_retryable_error(error: &Error) -> bool {
    match error {
        Error::Api(msg) => {
            // 5xx responses
            msg.starts_with("API error (5")
                // Network/timeout errors
                || msg.contains("timeout")
                || msg.contains("connection")
                || msg.contains("request failed")
        }
        _ => false,
    }
}
