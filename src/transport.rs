//! Byte-range download transport.
//!
//! The downloader only needs ranged GETs; anything that returns the right
//! bytes satisfies [`ShardTransport`]. The default implementation rides on
//! reqwest. Tests substitute in-memory transports.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{EngineError, EngineResult};

/// Byte-range fetch abstraction.
#[async_trait]
pub trait ShardTransport: Send + Sync {
    /// Fetch `length` bytes starting at `offset` from `url`.
    async fn fetch_range(&self, url: &str, offset: u64, length: u64) -> EngineResult<Bytes>;

    /// Fetch a whole resource (used for the manifest, whose length is
    /// not known up front).
    async fn fetch(&self, url: &str) -> EngineResult<Bytes>;
}

/// HTTP transport using ranged GET requests.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ShardTransport for HttpTransport {
    async fn fetch_range(&self, url: &str, offset: u64, length: u64) -> EngineResult<Bytes> {
        let end = offset + length - 1;
        let response = self
            .client
            .get(url)
            .header(reqwest::header::RANGE, format!("bytes={offset}-{end}"))
            .send()
            .await
            .map_err(|e| EngineError::TransportFailure {
                attempts: 1,
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(EngineError::TransportFailure {
                attempts: 1,
                reason: format!("{url}: HTTP {}", response.status()),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| EngineError::TransportFailure {
                attempts: 1,
                reason: e.to_string(),
            })?;

        if body.len() as u64 != length {
            return Err(EngineError::TransportFailure {
                attempts: 1,
                reason: format!(
                    "{url}: expected {length} bytes, server returned {}",
                    body.len()
                ),
            });
        }
        Ok(body)
    }

    async fn fetch(&self, url: &str) -> EngineResult<Bytes> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| EngineError::TransportFailure {
                attempts: 1,
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(EngineError::TransportFailure {
                attempts: 1,
                reason: format!("{url}: HTTP {}", response.status()),
            });
        }

        response
            .bytes()
            .await
            .map_err(|e| EngineError::TransportFailure {
                attempts: 1,
                reason: e.to_string(),
            })
    }
}
