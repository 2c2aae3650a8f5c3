//! Blob storage transports
//!
//! The upload worker only knows the `BlobTransport` trait. Two
//! implementations exist:
//! - `HttpBlobTransport`: PUT per chunk to the storage endpoint, then a
//!   finalize call to the backend
//! - `SimulatedBlobTransport`: offline demo path with a per-chunk delay and a
//!   synthetic blob URL; nothing leaves the process

use crate::api::BackendClient;
use crate::error::{ClientError, ClientResult};
use crate::services::upload_token_client::UploadToken;
use async_trait::async_trait;
use irp_common::api::{decode_data, ApiOutcome};
use rand::Rng;
use reqwest::header::CONTENT_RANGE;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, trace};

const FINALIZE_FALLBACK_MESSAGE: &str = "Failed to complete upload";

/// One chunk of a file transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkUpload {
    /// Zero-based chunk number
    pub index: usize,
    /// Byte offset of the first byte of this chunk
    pub offset: u64,
    pub bytes: Vec<u8>,
    /// Size of the whole file
    pub total: u64,
}

impl ChunkUpload {
    /// `Content-Range` header value for this chunk
    pub fn content_range(&self) -> String {
        if self.bytes.is_empty() {
            return format!("bytes */{}", self.total);
        }
        let end = self.offset + self.bytes.len() as u64 - 1;
        format!("bytes {}-{}/{}", self.offset, end, self.total)
    }
}

/// Storage backend used by the blob upload worker
#[async_trait]
pub trait BlobTransport: Send + Sync {
    /// Store one chunk; chunks arrive in order
    async fn put_chunk(&self, token: &UploadToken, chunk: &ChunkUpload) -> ClientResult<()>;

    /// Location the transferred bytes are stored under
    fn blob_url(&self, token: &UploadToken, file_hash: &str) -> String;

    /// Associate the stored blob with the token; returns the final location
    async fn finalize(
        &self,
        token: &UploadToken,
        blob_url: &str,
        file_hash: &str,
    ) -> ClientResult<String>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CompleteRequest<'a> {
    token: &'a str,
    blob_url: &'a str,
    file_hash: &'a str,
}

/// Chunked upload over HTTP
#[derive(Debug, Clone)]
pub struct HttpBlobTransport {
    backend: BackendClient,
    chunk_endpoint: String,
    complete_endpoint: String,
    storage_base_url: String,
}

impl HttpBlobTransport {
    pub fn new(
        backend: BackendClient,
        chunk_endpoint: impl Into<String>,
        complete_endpoint: impl Into<String>,
        storage_base_url: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            chunk_endpoint: chunk_endpoint.into(),
            complete_endpoint: complete_endpoint.into(),
            storage_base_url: storage_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn chunk_url(&self, token: &UploadToken) -> String {
        match &token.upload_url {
            Some(url) => url.clone(),
            None => format!(
                "{}/{}",
                self.backend.url(&self.chunk_endpoint).trim_end_matches('/'),
                token.secure_path
            ),
        }
    }
}

#[async_trait]
impl BlobTransport for HttpBlobTransport {
    async fn put_chunk(&self, token: &UploadToken, chunk: &ChunkUpload) -> ClientResult<()> {
        let url = self.chunk_url(token);
        trace!(url = %url, chunk = chunk.index, "PUT chunk");

        let response = self
            .backend
            .http()
            .put(&url)
            .bearer_auth(&token.token)
            .header(CONTENT_RANGE, chunk.content_range())
            .body(chunk.bytes.clone())
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let text = response.text().await.unwrap_or_default();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::GONE => {
                Err(ClientError::TokenExpired)
            }
            s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => Err(
                ClientError::Network(format!("HTTP {} storing chunk {}", s.as_u16(), chunk.index)),
            ),
            s => Err(ClientError::ServerRejected(if text.trim().is_empty() {
                format!("HTTP {}", s.as_u16())
            } else {
                text
            })),
        }
    }

    fn blob_url(&self, token: &UploadToken, _file_hash: &str) -> String {
        token
            .upload_url
            .clone()
            .unwrap_or_else(|| format!("{}/{}", self.storage_base_url, token.secure_path))
    }

    async fn finalize(
        &self,
        token: &UploadToken,
        blob_url: &str,
        file_hash: &str,
    ) -> ClientResult<String> {
        let body = CompleteRequest {
            token: &token.token,
            blob_url,
            file_hash,
        };
        let response = self.backend.post_json(&self.complete_endpoint, &body).await?;

        match decode_data::<Option<Value>>(response)? {
            ApiOutcome::Ok(data) => {
                let location = data
                    .as_ref()
                    .and_then(|d| {
                        ["blobUrl", "blob_url", "url"]
                            .iter()
                            .find_map(|k| d.get(*k).and_then(|v| v.as_str()))
                    })
                    .unwrap_or(blob_url)
                    .to_string();
                debug!(location = %location, "Upload finalized");
                Ok(location)
            }
            ApiOutcome::Rejected { message } => {
                let message = message.unwrap_or_else(|| FINALIZE_FALLBACK_MESSAGE.to_string());
                if message.to_lowercase().contains("expired") {
                    Err(ClientError::TokenExpired)
                } else {
                    Err(ClientError::ServerRejected(message))
                }
            }
        }
    }
}

/// Offline transport for demos
///
/// Every chunk takes a random 100–300 ms; finalize returns the synthetic
/// location without contacting any backend.
#[derive(Debug, Clone)]
pub struct SimulatedBlobTransport {
    storage_base_url: String,
    min_delay: Duration,
    max_delay: Duration,
}

impl SimulatedBlobTransport {
    pub fn new(storage_base_url: impl Into<String>) -> Self {
        Self {
            storage_base_url: storage_base_url.into().trim_end_matches('/').to_string(),
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
        }
    }

    /// Override the per-chunk delay range
    pub fn with_delay(mut self, min_delay: Duration, max_delay: Duration) -> Self {
        self.min_delay = min_delay;
        self.max_delay = max_delay.max(min_delay);
        self
    }

    fn chunk_delay(&self) -> Duration {
        if self.max_delay <= self.min_delay {
            return self.min_delay;
        }
        let min = self.min_delay.as_millis() as u64;
        let max = self.max_delay.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

#[async_trait]
impl BlobTransport for SimulatedBlobTransport {
    async fn put_chunk(&self, _token: &UploadToken, chunk: &ChunkUpload) -> ClientResult<()> {
        tokio::time::sleep(self.chunk_delay()).await;
        trace!(chunk = chunk.index, bytes = chunk.bytes.len(), "Simulated chunk stored");
        Ok(())
    }

    fn blob_url(&self, token: &UploadToken, file_hash: &str) -> String {
        let short_hash: String = file_hash.chars().take(12).collect();
        format!(
            "{}/ir-files/{}-{}",
            self.storage_base_url, short_hash, token.secure_path
        )
    }

    async fn finalize(
        &self,
        _token: &UploadToken,
        blob_url: &str,
        _file_hash: &str,
    ) -> ClientResult<String> {
        Ok(blob_url.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_range() {
        let chunk = ChunkUpload {
            index: 1,
            offset: 1024,
            bytes: vec![0; 512],
            total: 1536,
        };
        assert_eq!(chunk.content_range(), "bytes 1024-1535/1536");

        let empty = ChunkUpload {
            index: 0,
            offset: 0,
            bytes: Vec::new(),
            total: 0,
        };
        assert_eq!(empty.content_range(), "bytes */0");
    }

    #[test]
    fn test_simulated_blob_url() {
        let transport = SimulatedBlobTransport::new("https://blob.vercel-storage.com/");
        let token = UploadToken::new("tok", "ir-1-abc-deck.pdf");
        assert_eq!(
            transport.blob_url(&token, "0123456789abcdef"),
            "https://blob.vercel-storage.com/ir-files/0123456789ab-ir-1-abc-deck.pdf"
        );
    }

    #[tokio::test]
    async fn test_simulated_finalize_returns_location() {
        let transport = SimulatedBlobTransport::new("https://blob.example")
            .with_delay(Duration::ZERO, Duration::ZERO);
        let token = UploadToken::new("tok", "deck.pdf");
        let chunk = ChunkUpload {
            index: 0,
            offset: 0,
            bytes: vec![1, 2, 3],
            total: 3,
        };
        transport.put_chunk(&token, &chunk).await.unwrap();
        let location = transport
            .finalize(&token, "https://blob.example/x", "hash")
            .await
            .unwrap();
        assert_eq!(location, "https://blob.example/x");
    }
}
