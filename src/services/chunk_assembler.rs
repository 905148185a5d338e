//! Server-side staging for chunked uploads.
//!
//! Each upload id gets a directory beneath `staging_dir` holding one numbered
//! part file per received chunk. Chunks must arrive strictly in order; the
//! final chunk (the only one flagged complete) triggers assembly of the parts
//! into a single file, which the caller then hands to the storage gateway.

use crate::services::storage_gateway::StorageError;
use std::{
    collections::HashMap,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
    sync::Mutex,
    time::Instant,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("missing multipart field `{0}`")]
    MissingField(&'static str),
    #[error("invalid multipart field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("malformed multipart body: {0}")]
    Multipart(String),
    #[error("chunk {index} is out of range for {total} chunk(s)")]
    ChunkOutOfRange { index: u32, total: u32 },
    #[error("completion flag must be set on the final chunk only")]
    CompletionMismatch,
    #[error("upload `{id}` expected chunk {expected}, got {got}")]
    OutOfOrder { id: Uuid, expected: u32, got: u32 },
    #[error("upload `{0}` changed its total chunk count")]
    TotalMismatch(Uuid),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type UploadResult<T> = Result<T, UploadError>;

/// Metadata that accompanies every upload request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkMeta {
    pub upload_id: Uuid,
    pub name: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub is_complete: bool,
}

impl ChunkMeta {
    pub fn validate(&self) -> UploadResult<()> {
        if self.total_chunks == 0 || self.chunk_index >= self.total_chunks {
            return Err(UploadError::ChunkOutOfRange {
                index: self.chunk_index,
                total: self.total_chunks,
            });
        }
        let is_last = self.chunk_index + 1 == self.total_chunks;
        if self.is_complete != is_last {
            return Err(UploadError::CompletionMismatch);
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum ChunkOutcome {
    /// More chunks are expected.
    Partial { received_bytes: u64 },
    /// Every chunk arrived; `path` holds the assembled payload.
    Complete {
        path: PathBuf,
        name: String,
        size_bytes: u64,
    },
}

#[derive(Debug)]
struct Session {
    total_chunks: u32,
    next_index: u32,
    received_bytes: u64,
    last_activity: Instant,
}

#[derive(Clone)]
pub struct ChunkAssembler {
    staging_dir: PathBuf,
    sessions: Arc<Mutex<HashMap<Uuid, Session>>>,
}

impl ChunkAssembler {
    pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Fresh path for a request body that is still being received.
    pub fn incoming_path(&self) -> PathBuf {
        self.staging_dir.join(format!(".incoming-{}", Uuid::new_v4()))
    }

    fn session_dir(&self, upload_id: Uuid) -> PathBuf {
        self.staging_dir.join(upload_id.to_string())
    }

    fn part_path(&self, upload_id: Uuid, index: u32) -> PathBuf {
        self.session_dir(upload_id).join(format!("{:06}.part", index))
    }

    /// Stage one received chunk. `incoming` is consumed in every outcome.
    pub async fn accept(
        &self,
        meta: &ChunkMeta,
        incoming: &Path,
        chunk_bytes: u64,
    ) -> UploadResult<ChunkOutcome> {
        if let Err(err) = meta.validate() {
            let _ = fs::remove_file(incoming).await;
            return Err(err);
        }

        let id = meta.upload_id;
        let mut sessions = self.sessions.lock().await;

        if meta.chunk_index == 0 {
            if sessions.remove(&id).is_some() {
                debug!("upload {} restarted from chunk 0", id);
            }
            remove_dir_if_present(&self.session_dir(id)).await;
            sessions.insert(
                id,
                Session {
                    total_chunks: meta.total_chunks,
                    next_index: 0,
                    received_bytes: 0,
                    last_activity: Instant::now(),
                },
            );
        }

        let failure = match sessions.get(&id) {
            None => Some(UploadError::OutOfOrder {
                id,
                expected: 0,
                got: meta.chunk_index,
            }),
            Some(session) if session.total_chunks != meta.total_chunks => {
                Some(UploadError::TotalMismatch(id))
            }
            Some(session) if session.next_index != meta.chunk_index => {
                Some(UploadError::OutOfOrder {
                    id,
                    expected: session.next_index,
                    got: meta.chunk_index,
                })
            }
            Some(_) => None,
        };
        if let Some(err) = failure {
            warn!("discarding upload {}: {}", id, err);
            sessions.remove(&id);
            let _ = fs::remove_file(incoming).await;
            remove_dir_if_present(&self.session_dir(id)).await;
            return Err(err);
        }

        let part = self.part_path(id, meta.chunk_index);
        let staged = async {
            fs::create_dir_all(self.session_dir(id)).await?;
            fs::rename(incoming, &part).await
        }
        .await;
        if let Err(err) = staged {
            sessions.remove(&id);
            let _ = fs::remove_file(incoming).await;
            remove_dir_if_present(&self.session_dir(id)).await;
            return Err(UploadError::Io(err));
        }

        let received_bytes = match sessions.get_mut(&id) {
            Some(session) => {
                session.next_index += 1;
                session.received_bytes += chunk_bytes;
                session.last_activity = Instant::now();
                session.received_bytes
            }
            None => chunk_bytes,
        };

        if !meta.is_complete {
            debug!(
                "upload {} staged chunk {}/{}",
                id,
                meta.chunk_index + 1,
                meta.total_chunks
            );
            return Ok(ChunkOutcome::Partial { received_bytes });
        }

        sessions.remove(&id);
        drop(sessions);

        let path = match self.assemble(id, meta.total_chunks).await {
            Ok(path) => path,
            Err(err) => {
                remove_dir_if_present(&self.session_dir(id)).await;
                return Err(UploadError::Io(err));
            }
        };
        info!(
            "upload {} assembled from {} chunk(s), {} bytes",
            id, meta.total_chunks, received_bytes
        );
        Ok(ChunkOutcome::Complete {
            path,
            name: meta.name.clone(),
            size_bytes: received_bytes,
        })
    }

    /// Concatenate staged parts in index order. A single part is used as is.
    async fn assemble(&self, upload_id: Uuid, total_chunks: u32) -> io::Result<PathBuf> {
        if total_chunks == 1 {
            return Ok(self.part_path(upload_id, 0));
        }

        let assembled = self.session_dir(upload_id).join("assembled");
        let mut out = File::create(&assembled).await?;
        for index in 0..total_chunks {
            let part_path = self.part_path(upload_id, index);
            let mut part = File::open(&part_path).await?;
            tokio::io::copy(&mut part, &mut out).await?;
            drop(part);
            fs::remove_file(&part_path).await?;
        }
        out.flush().await?;
        out.sync_all().await?;
        Ok(assembled)
    }

    /// Remove whatever is left of a session's staging directory.
    pub async fn finish(&self, upload_id: Uuid) {
        self.sessions.lock().await.remove(&upload_id);
        remove_dir_if_present(&self.session_dir(upload_id)).await;
    }

    /// Drop sessions idle for longer than `ttl`, along with stray staging
    /// entries (from a previous process) older than `ttl`.
    pub async fn sweep_expired(&self, ttl: Duration) -> io::Result<usize> {
        let mut removed = 0;
        let mut sessions = self.sessions.lock().await;

        let expired: Vec<Uuid> = sessions
            .iter()
            .filter(|(_, s)| s.last_activity.elapsed() > ttl)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            sessions.remove(&id);
            remove_dir_if_present(&self.session_dir(id)).await;
            removed += 1;
        }

        let mut entries = match fs::read_dir(&self.staging_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(removed),
            Err(err) => return Err(err),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Ok(id) = Uuid::parse_str(&name) {
                if sessions.contains_key(&id) {
                    continue;
                }
            }
            let meta = entry.metadata().await?;
            let age = meta
                .modified()
                .ok()
                .and_then(|m| SystemTime::now().duration_since(m).ok())
                .unwrap_or_default();
            if age <= ttl {
                continue;
            }
            let result = if meta.is_dir() {
                fs::remove_dir_all(entry.path()).await
            } else {
                fs::remove_file(entry.path()).await
            };
            match result {
                Ok(()) => removed += 1,
                Err(err) => debug!("failed to remove stale {}: {}", name, err),
            }
        }

        Ok(removed)
    }

    #[cfg(test)]
    async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

async fn remove_dir_if_present(path: &Path) {
    if let Err(err) = fs::remove_dir_all(path).await {
        if err.kind() != ErrorKind::NotFound {
            debug!("failed to remove {}: {}", path.display(), err);
        }
    }
}
