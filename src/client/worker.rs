//! Transfers one file to the server, whole or in chunks.

use crate::client::api::{ApiError, ChunkRequest, FileHostApi};
use bytes::Bytes;
use std::{
    io::{self, SeekFrom},
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};
use thiserror::Error;
use tokio::{
    fs,
    io::{AsyncReadExt, AsyncSeekExt},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

const MIB: u64 = 1024 * 1024;

/// Files larger than this are split into chunks.
pub const SINGLE_REQUEST_LIMIT: u64 = 100 * MIB;
/// Chunk size, kept under the request limit so each part fits one request.
pub const CHUNK_SIZE: u64 = 99 * MIB;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("server did not accept chunk {index}")]
    Rejected { index: u32 },
    #[error("final response is missing the url or public id")]
    IncompleteResponse,
    #[error("checksum mismatch: sent {local}, server stored {remote}")]
    ChecksumMismatch { local: String, remote: String },
    #[error("reading source: {0}")]
    Source(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPolicy {
    pub single_request_limit: u64,
    pub chunk_size: u64,
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self {
            single_request_limit: SINGLE_REQUEST_LIMIT,
            chunk_size: CHUNK_SIZE,
        }
    }
}

/// One planned request: the byte range it carries and its position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    pub index: u32,
    pub total: u32,
    pub offset: u64,
    pub len: u64,
}

impl ChunkSpan {
    pub fn is_last(&self) -> bool {
        self.index + 1 == self.total
    }
}

impl ChunkPolicy {
    /// Split `size` bytes into requests. Always yields at least one span, so
    /// empty files still produce a single request.
    pub fn plan(&self, size: u64) -> Vec<ChunkSpan> {
        let chunk = self.chunk_size.max(1);
        if size <= self.single_request_limit {
            return vec![ChunkSpan {
                index: 0,
                total: 1,
                offset: 0,
                len: size,
            }];
        }

        let total = size.div_ceil(chunk) as u32;
        (0..total)
            .map(|index| {
                let offset = index as u64 * chunk;
                ChunkSpan {
                    index,
                    total,
                    offset,
                    len: chunk.min(size - offset),
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
enum SourceData {
    File(PathBuf),
    Memory(Bytes),
}

/// A file picked for upload.
#[derive(Debug, Clone)]
pub struct UploadSource {
    pub name: String,
    pub size: u64,
    data: SourceData,
}

impl UploadSource {
    pub async fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let meta = fs::metadata(path).await?;
        if !meta.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
        Ok(Self {
            name,
            size: meta.len(),
            data: SourceData::File(path.to_path_buf()),
        })
    }

    pub fn from_bytes(name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        Self {
            name: name.into(),
            size: bytes.len() as u64,
            data: SourceData::Memory(bytes),
        }
    }

    async fn read_span(&self, span: &ChunkSpan) -> io::Result<Bytes> {
        match &self.data {
            SourceData::Memory(bytes) => {
                let start = span.offset as usize;
                let end = start + span.len as usize;
                if end > bytes.len() {
                    return Err(io::ErrorKind::UnexpectedEof.into());
                }
                Ok(bytes.slice(start..end))
            }
            SourceData::File(path) => {
                let mut file = fs::File::open(path).await?;
                file.seek(SeekFrom::Start(span.offset)).await?;
                let mut buf = vec![0u8; span.len as usize];
                file.read_exact(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
        }
    }
}

/// Progress after a request completes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferProgress {
    pub transferred: u64,
    pub total: u64,
    /// Bytes per second since the previous progress report.
    pub speed: f64,
}

impl TransferProgress {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        (self.transferred as f64 / self.total as f64) * 100.0
    }
}

/// Where the server put the uploaded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedObject {
    pub url: String,
    pub public_id: String,
}

pub struct TransferWorker {
    api: Arc<dyn FileHostApi>,
    policy: ChunkPolicy,
}

impl TransferWorker {
    pub fn new(api: Arc<dyn FileHostApi>, policy: ChunkPolicy) -> Self {
        Self { api, policy }
    }

    /// Upload `source` in order, one request at a time.
    ///
    /// Returns `Ok(None)` when `cancel` fires; the in-flight request is
    /// dropped and no further chunks are sent.
    pub async fn transfer<F>(
        &self,
        upload_id: Uuid,
        source: &UploadSource,
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> Result<Option<UploadedObject>, TransferError>
    where
        F: FnMut(TransferProgress) + Send,
    {
        let plan = self.policy.plan(source.size);
        let mut digest = md5::Context::new();
        let mut transferred: u64 = 0;
        let mut boundary = Instant::now();

        if plan.len() > 1 {
            info!(
                "uploading {} in {} chunks ({} bytes)",
                source.name,
                plan.len(),
                source.size
            );
        }

        for span in plan {
            if cancel.is_cancelled() {
                return Ok(None);
            }

            let data = source.read_span(&span).await?;
            digest.consume(&data);
            let request = ChunkRequest {
                upload_id,
                name: source.name.clone(),
                chunk_index: span.index,
                total_chunks: span.total,
                is_complete: span.is_last(),
                data,
            };

            let request_token = cancel.child_token();
            let response = tokio::select! {
                biased;
                _ = request_token.cancelled() => {
                    debug!("upload {} cancelled during chunk {}", upload_id, span.index);
                    return Ok(None);
                }
                res = self.api.upload_chunk(request) => res?,
            };
            if !response.success || response.chunk_index != span.index {
                return Err(TransferError::Rejected { index: span.index });
            }

            transferred += span.len;
            // Intervals tile the transfer, so time between requests counts too.
            let now = Instant::now();
            let elapsed = now.duration_since(boundary).as_secs_f64();
            boundary = now;
            let speed = if elapsed > 0.0 {
                span.len as f64 / elapsed
            } else {
                0.0
            };
            on_progress(TransferProgress {
                transferred,
                total: source.size,
                speed,
            });

            if span.is_last() {
                let (Some(url), Some(public_id)) = (response.url, response.public_id) else {
                    return Err(TransferError::IncompleteResponse);
                };
                if let Some(remote) = response.etag {
                    let local = format!("{:x}", digest.compute());
                    if local != remote {
                        return Err(TransferError::ChecksumMismatch { local, remote });
                    }
                }
                return Ok(Some(UploadedObject { url, public_id }));
            }
        }

        Err(TransferError::IncompleteResponse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::FakeApi;
    use std::time::Duration;

    fn small_policy() -> ChunkPolicy {
        ChunkPolicy {
            single_request_limit: 10,
            chunk_size: 4,
        }
    }

    #[test]
    fn plans_single_request_up_to_limit() {
        let policy = ChunkPolicy::default();
        let plan = policy.plan(10 * 1000 * 1000);
        assert_eq!(plan.len(), 1);
        assert!(plan[0].is_last());

        assert_eq!(policy.plan(SINGLE_REQUEST_LIMIT).len(), 1);
        assert_eq!(policy.plan(0), vec![ChunkSpan { index: 0, total: 1, offset: 0, len: 0 }]);
    }

    #[test]
    fn plans_large_files_in_fixed_chunks() {
        let plan = ChunkPolicy::default().plan(200 * MIB);
        let lens: Vec<u64> = plan.iter().map(|s| s.len).collect();
        assert_eq!(lens, vec![99 * MIB, 99 * MIB, 2 * MIB]);
        assert_eq!(plan[2].offset, 198 * MIB);
        assert!(plan.iter().all(|s| s.total == 3));
        assert!(!plan[1].is_last());
        assert!(plan[2].is_last());
    }

    #[tokio::test]
    async fn sends_chunks_in_order_and_reports_progress() {
        let api = Arc::new(FakeApi::new());
        let worker = TransferWorker::new(api.clone(), small_policy());
        let source = UploadSource::from_bytes("big.bin", b"abcdefghijk".to_vec());
        let id = Uuid::new_v4();

        let mut seen = Vec::new();
        let object = worker
            .transfer(id, &source, &CancellationToken::new(), |p| seen.push(p.transferred))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(object.public_id, "uploads/big.bin");
        assert_eq!(seen, vec![4, 8, 11]);

        let calls = api.chunk_calls();
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|c| c.upload_id == id && c.total_chunks == 3));
        assert_eq!(
            calls.iter().map(|c| c.chunk_index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(
            calls.iter().map(|c| c.is_complete).collect::<Vec<_>>(),
            vec![false, false, true]
        );
        assert_eq!(calls[2].len, 3);
    }

    #[tokio::test]
    async fn speed_spans_the_time_between_reports() {
        let api = Arc::new(FakeApi::new());
        api.set_latency(Duration::from_millis(10));
        let worker = TransferWorker::new(api.clone(), small_policy());
        let source = UploadSource::from_bytes("big.bin", b"abcdefghijk".to_vec());

        let mut reports = Vec::new();
        worker
            .transfer(Uuid::new_v4(), &source, &CancellationToken::new(), |p| {
                reports.push(p);
                std::thread::sleep(Duration::from_millis(30));
            })
            .await
            .unwrap()
            .unwrap();

        let lens = [4.0, 4.0, 3.0];
        assert_eq!(reports.len(), 3);
        for (i, (p, len)) in reports.iter().zip(lens).enumerate() {
            assert!(p.speed > 0.0);
            let seconds = len / p.speed;
            // Later chunks also carry the time the previous report took.
            let floor = if i == 0 { 0.01 } else { 0.04 };
            assert!(seconds >= floor, "chunk {} took {}s", i, seconds);
        }
    }

    #[tokio::test]
    async fn reads_file_sources_by_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        tokio::fs::write(&path, b"0123456789abc").await.unwrap();

        let source = UploadSource::from_path(&path).await.unwrap();
        assert_eq!(source.name, "notes.txt");
        assert_eq!(source.size, 13);

        let api = Arc::new(FakeApi::new());
        let worker = TransferWorker::new(api.clone(), small_policy());
        worker
            .transfer(Uuid::new_v4(), &source, &CancellationToken::new(), |_| {})
            .await
            .unwrap()
            .unwrap();
        assert_eq!(api.received("notes.txt"), b"0123456789abc".to_vec());
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_sending() {
        let api = Arc::new(FakeApi::new());
        let worker = TransferWorker::new(api.clone(), small_policy());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let source = UploadSource::from_bytes("a.txt", b"hello".to_vec());
        let out = worker
            .transfer(Uuid::new_v4(), &source, &cancel, |_| {})
            .await
            .unwrap();
        assert!(out.is_none());
        assert!(api.chunk_calls().is_empty());
    }

    #[tokio::test]
    async fn checksum_mismatch_is_an_error() {
        let api = Arc::new(FakeApi::new());
        api.corrupt_etags();
        let worker = TransferWorker::new(api, small_policy());
        let source = UploadSource::from_bytes("a.txt", b"hello".to_vec());
        let err = worker
            .transfer(Uuid::new_v4(), &source, &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::ChecksumMismatch { .. }));
    }

    #[tokio::test]
    async fn server_rejection_propagates() {
        let api = Arc::new(FakeApi::new());
        api.fail_uploads_of("a.txt");
        let worker = TransferWorker::new(api, small_policy());
        let source = UploadSource::from_bytes("a.txt", b"hello".to_vec());
        let err = worker
            .transfer(Uuid::new_v4(), &source, &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::Api(ApiError::Rejected { status: 500, .. })
        ));
    }
}
