//! Chunked transfer of one file
//!
//! Chunks are read and sent strictly in order; a `ProgressSample` follows
//! every stored chunk, so `bytes_transferred` never decreases within one
//! transfer. A SHA-256 of the contents is computed while streaming and sent
//! on finalize.
//!
//! Cancellation abandons the in-flight request (the future is dropped, not
//! awaited) and no further samples are emitted.

use crate::error::{ClientError, ClientResult};
use crate::models::{ProgressSample, UploadFile};
use crate::services::blob_transport::{BlobTransport, ChunkUpload};
use crate::services::upload_token_client::UploadToken;
use irp_common::config::UploadSettings;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Receives progress samples for one transfer
pub type ProgressSink<'a> = &'a (dyn Fn(ProgressSample) + Send + Sync);

/// Outcome of a completed chunk transfer, before finalize
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReceipt {
    pub blob_url: String,
    /// Hex-encoded SHA-256 of the file contents
    pub file_hash: String,
    pub bytes_total: u64,
}

/// Uploads files through a `BlobTransport`
#[derive(Clone)]
pub struct BlobUploadWorker {
    transport: Arc<dyn BlobTransport>,
    chunk_size: usize,
    chunk_retry_attempts: u32,
}

impl BlobUploadWorker {
    pub fn new(transport: Arc<dyn BlobTransport>, chunk_size: usize, chunk_retry_attempts: u32) -> Self {
        Self {
            transport,
            chunk_size: chunk_size.max(1),
            chunk_retry_attempts,
        }
    }

    pub fn from_settings(transport: Arc<dyn BlobTransport>, settings: &UploadSettings) -> Self {
        Self::new(
            transport,
            settings.chunk_size_bytes,
            settings.chunk_retry_attempts,
        )
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Transfer and finalize; returns the stored blob location
    pub async fn upload(
        &self,
        task_id: Uuid,
        file: &UploadFile,
        token: &UploadToken,
        on_progress: ProgressSink<'_>,
        cancel: &CancellationToken,
    ) -> ClientResult<String> {
        let receipt = self
            .transfer(task_id, file, token, on_progress, cancel)
            .await?;
        self.finalize(token, &receipt, cancel).await
    }

    /// Send every chunk of `file`, emitting a sample after each one
    ///
    /// An empty file is sent as one empty chunk followed by a single 0/0
    /// sample.
    pub async fn transfer(
        &self,
        task_id: Uuid,
        file: &UploadFile,
        token: &UploadToken,
        on_progress: ProgressSink<'_>,
        cancel: &CancellationToken,
    ) -> ClientResult<TransferReceipt> {
        if cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }

        let mut reader = file.open().await.map_err(|e| {
            ClientError::Validation(vec![format!("Cannot read {}: {}", file.name(), e)])
        })?;

        let declared_total = file.size();
        let mut hasher = Sha256::new();
        let mut offset: u64 = 0;
        let mut index: usize = 0;

        loop {
            let bytes = read_chunk(&mut reader, self.chunk_size).await.map_err(|e| {
                ClientError::Validation(vec![format!("Cannot read {}: {}", file.name(), e)])
            })?;
            if bytes.is_empty() && index > 0 {
                break;
            }

            if token.is_expired() {
                return Err(ClientError::TokenExpired);
            }

            hasher.update(&bytes);
            let len = bytes.len() as u64;
            let total = declared_total.max(offset + len);
            let chunk = ChunkUpload {
                index,
                offset,
                bytes,
                total,
            };

            self.send_chunk(token, &chunk, cancel).await?;
            if cancel.is_cancelled() {
                return Err(ClientError::Cancelled);
            }

            offset += len;
            index += 1;
            on_progress(ProgressSample::new(task_id, offset, total));

            if len == 0 {
                break;
            }
        }

        let file_hash = hex::encode(hasher.finalize());
        let blob_url = self.transport.blob_url(token, &file_hash);
        debug!(
            filename = %file.name(),
            chunks = index,
            bytes = offset,
            "Transfer complete"
        );

        Ok(TransferReceipt {
            blob_url,
            file_hash,
            bytes_total: offset,
        })
    }

    /// Associate the transferred blob with its token
    pub async fn finalize(
        &self,
        token: &UploadToken,
        receipt: &TransferReceipt,
        cancel: &CancellationToken,
    ) -> ClientResult<String> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ClientError::Cancelled),
            result = self.transport.finalize(token, &receipt.blob_url, &receipt.file_hash) => result,
        }
    }

    async fn send_chunk(
        &self,
        token: &UploadToken,
        chunk: &ChunkUpload,
        cancel: &CancellationToken,
    ) -> ClientResult<()> {
        let mut retries = 0;
        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                result = self.transport.put_chunk(token, chunk) => result,
            };

            match result {
                Err(ClientError::Network(message)) if retries < self.chunk_retry_attempts => {
                    retries += 1;
                    warn!(
                        chunk = chunk.index,
                        retry = retries,
                        "Chunk failed, re-sending: {}",
                        message
                    );
                }
                other => return other,
            }
        }
    }
}

/// Read up to `size` bytes, short only at end of input
async fn read_chunk<R>(reader: &mut R, size: usize) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        chunks: Mutex<Vec<ChunkUpload>>,
        fail_first: Mutex<u32>,
    }

    #[async_trait]
    impl BlobTransport for RecordingTransport {
        async fn put_chunk(&self, _token: &UploadToken, chunk: &ChunkUpload) -> ClientResult<()> {
            {
                let mut fail = self.fail_first.lock().unwrap();
                if *fail > 0 {
                    *fail -= 1;
                    return Err(ClientError::Network("reset".into()));
                }
            }
            self.chunks.lock().unwrap().push(chunk.clone());
            Ok(())
        }

        fn blob_url(&self, token: &UploadToken, _file_hash: &str) -> String {
            format!("mem://{}", token.secure_path)
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

    fn collect() -> (Arc<Mutex<Vec<ProgressSample>>>, impl Fn(ProgressSample) + Send + Sync) {
        let samples = Arc::new(Mutex::new(Vec::new()));
        let sink = samples.clone();
        (samples, move |s| sink.lock().unwrap().push(s))
    }

    #[tokio::test]
    async fn test_chunks_and_samples_in_order() {
        let transport = Arc::new(RecordingTransport::default());
        let worker = BlobUploadWorker::new(transport.clone(), 4, 0);
        let file = UploadFile::in_memory("deck.pdf", b"abcdefghij".to_vec());
        let (samples, sink) = collect();

        let location = worker
            .upload(
                Uuid::new_v4(),
                &file,
                &UploadToken::new("t", "deck.pdf"),
                &sink,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(location, "mem://deck.pdf");
        let offsets: Vec<u64> = transport.chunks.lock().unwrap().iter().map(|c| c.offset).collect();
        assert_eq!(offsets, vec![0, 4, 8]);
        let transferred: Vec<u64> = samples.lock().unwrap().iter().map(|s| s.bytes_transferred).collect();
        assert_eq!(transferred, vec![4, 8, 10]);
    }

    #[tokio::test]
    async fn test_empty_file_emits_single_sample() {
        let transport = Arc::new(RecordingTransport::default());
        let worker = BlobUploadWorker::new(transport.clone(), 4, 0);
        let file = UploadFile::in_memory("empty.pdf", Vec::new());
        let (samples, sink) = collect();

        worker
            .transfer(
                Uuid::new_v4(),
                &file,
                &UploadToken::new("t", "empty.pdf"),
                &sink,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let samples = samples.lock().unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].bytes_total, 0);
        assert_eq!(samples[0].percent(), 100.0);
        assert_eq!(transport.chunks.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_hash_is_sha256_of_contents() {
        let worker = BlobUploadWorker::new(Arc::new(RecordingTransport::default()), 3, 0);
        let file = UploadFile::in_memory("a.pdf", b"abc".to_vec());
        let (_samples, sink) = collect();

        let receipt = worker
            .transfer(
                Uuid::new_v4(),
                &file,
                &UploadToken::new("t", "a.pdf"),
                &sink,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(
            receipt.file_hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_network_failure_retried_once_per_chunk() {
        let transport = Arc::new(RecordingTransport::default());
        *transport.fail_first.lock().unwrap() = 1;
        let worker = BlobUploadWorker::new(transport.clone(), 4, 1);
        let file = UploadFile::in_memory("a.pdf", b"abcd".to_vec());
        let (_samples, sink) = collect();

        worker
            .transfer(
                Uuid::new_v4(),
                &file,
                &UploadToken::new("t", "a.pdf"),
                &sink,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(transport.chunks.lock().unwrap().len(), 1);

        *transport.fail_first.lock().unwrap() = 2;
        let err = worker
            .transfer(
                Uuid::new_v4(),
                &file,
                &UploadToken::new("t", "a.pdf"),
                &sink,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Network(_)));
    }

    #[tokio::test]
    async fn test_expired_token_fails_before_sending() {
        let transport = Arc::new(RecordingTransport::default());
        let worker = BlobUploadWorker::new(transport.clone(), 4, 0);
        let file = UploadFile::in_memory("a.pdf", b"abcd".to_vec());
        let token = UploadToken::new("t", "a.pdf")
            .with_expiry(chrono::Utc::now() - chrono::Duration::seconds(5));
        let (samples, sink) = collect();

        let err = worker
            .transfer(Uuid::new_v4(), &file, &token, &sink, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, ClientError::TokenExpired);
        assert!(transport.chunks.lock().unwrap().is_empty());
        assert!(samples.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let worker = BlobUploadWorker::new(Arc::new(RecordingTransport::default()), 4, 0);
        let file = UploadFile::in_memory("a.pdf", b"abcd".to_vec());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (samples, sink) = collect();

        let err = worker
            .upload(Uuid::new_v4(), &file, &UploadToken::new("t", "a.pdf"), &sink, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, ClientError::Cancelled);
        assert!(samples.lock().unwrap().is_empty());
    }
}
