use std::sync::RwLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::ByteStore;
use crate::config::RequestConfig;
use crate::error::{TransportError, TransportResult};

#[derive(Debug, Serialize, Deserialize)]
struct LocationBody {
    location: Option<String>,
}

/// Client for a remote byte-store backend
pub struct HttpByteStore {
    client: Client,
    base_url: String,
    request_config: RequestConfig,
    known_location: RwLock<Option<String>>,
}

impl HttpByteStore {
    /// Create a new HTTP byte store client
    pub fn new(base_url: &str, request_config: RequestConfig) -> TransportResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(request_config.timeout_ms))
            .build()
            .map_err(TransportError::Http)?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            request_config,
            known_location: RwLock::new(None),
        })
    }

    /// Seed the last known location, used while the backend is unreachable.
    pub fn with_known_location(self, location: Option<String>) -> Self {
        *self.known_location.write().unwrap_or_else(|e| e.into_inner()) = location;
        self
    }

    /// Get the base URL (for testing)
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn remember_location(&self, location: Option<String>) {
        *self.known_location.write().unwrap_or_else(|e| e.into_inner()) = location;
    }

    fn cached_location(&self) -> Option<String> {
        self.known_location
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn map_send_error(&self, e: reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout {
                timeout_ms: self.request_config.timeout_ms,
            }
        } else if e.is_connect() {
            TransportError::Unreachable {
                message: e.to_string(),
            }
        } else {
            TransportError::Http(e)
        }
    }

    async fn check_status(response: reqwest::Response) -> TransportResult<reqwest::Response> {
        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(TransportError::Api {
                status: status.as_u16(),
                message: error_body,
            });
        }
        Ok(response)
    }

    /// Run an operation with exponential backoff between attempts
    async fn with_retries<T, F, Fut>(&self, operation: &str, mut attempt: F) -> TransportResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = TransportResult<T>>,
    {
        let mut last_error = None;
        let mut retries = 0;

        while retries <= self.request_config.max_retries {
            if retries > 0 {
                let delay = Duration::from_millis(
                    self.request_config.retry_delay_ms * (2_u64.pow(retries - 1)),
                );
                warn!(
                    operation = operation,
                    retry = retries,
                    delay_ms = delay.as_millis(),
                    "Retrying byte-store request"
                );
                tokio::time::sleep(delay).await;
            }

            let start = Instant::now();
            match attempt().await {
                Ok(value) => {
                    debug!(
                        operation = operation,
                        latency_ms = start.elapsed().as_millis(),
                        "Byte-store request succeeded"
                    );
                    return Ok(value);
                }
                // Client errors will not change on retry.
                Err(TransportError::Api { status, message }) if (400..500).contains(&status) => {
                    return Err(TransportError::Api { status, message });
                }
                Err(e) => {
                    error!(
                        operation = operation,
                        error = %e,
                        latency_ms = start.elapsed().as_millis(),
                        retry = retries,
                        "Byte-store request failed"
                    );
                    last_error = Some(e);
                    retries += 1;
                }
            }
        }

        Err(last_error.unwrap_or_else(|| TransportError::Unreachable {
            message: "Unknown error".to_string(),
        }))
    }

    async fn read_once(&self) -> TransportResult<Option<Vec<u8>>> {
        let url = format!("{}/store", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let response = Self::check_status(response).await?;
        let bytes = response.bytes().await.map_err(TransportError::Http)?;
        if bytes.is_empty() {
            return Ok(None);
        }
        Ok(Some(bytes.to_vec()))
    }

    async fn write_once(&self, bytes: &[u8]) -> TransportResult<()> {
        let url = format!("{}/store", self.base_url);
        let response = self
            .client
            .put(&url)
            .header("Content-Type", "application/octet-stream")
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        Self::check_status(response).await?;
        Ok(())
    }
}

#[async_trait]
impl ByteStore for HttpByteStore {
    async fn probe(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(error = %e, "Byte-store probe failed");
                false
            }
        }
    }

    async fn read(&self) -> TransportResult<Option<Vec<u8>>> {
        self.with_retries("read", move || self.read_once()).await
    }

    async fn write(&self, bytes: &[u8]) -> TransportResult<()> {
        self.with_retries("write", move || self.write_once(bytes)).await?;
        info!(bytes = bytes.len(), "Store blob written to remote backend");
        Ok(())
    }

    async fn configured_location(&self) -> TransportResult<Option<String>> {
        let url = format!("{}/config/location", self.base_url);
        let response = match self.client.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                let cached = self.cached_location();
                warn!(
                    error = %e,
                    cached = ?cached,
                    "Backend unreachable; using last known location"
                );
                return Ok(cached);
            }
        };

        let response = Self::check_status(response).await?;
        let body: LocationBody = response.json().await.map_err(TransportError::Http)?;
        self.remember_location(body.location.clone());
        Ok(body.location)
    }

    async fn set_configured_location(&self, location: &str) -> TransportResult<()> {
        let url = format!("{}/config/location", self.base_url);
        let response = self
            .client
            .put(&url)
            .json(&LocationBody {
                location: Some(location.to_string()),
            })
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        Self::check_status(response).await?;
        self.remember_location(Some(location.to_string()));
        info!(location = %location, "Configured store location");
        Ok(())
    }

    async fn clear_configured_location(&self) -> TransportResult<()> {
        let url = format!("{}/config/location", self.base_url);
        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        Self::check_status(response).await?;
        self.remember_location(None);
        info!("Cleared configured store location");
        Ok(())
    }
}
