//! In-memory [`FileHostApi`] used by the client unit tests.

use crate::{
    client::api::{ApiError, ApiResult, ChunkRequest, FileHostApi},
    models::{
        api::{CreateFileRequest, UploadChunkResponse},
        uploaded_file::{FileState, UploadedFile},
    },
};
use async_trait::async_trait;
use chrono::Utc;
use std::{
    collections::{HashMap, HashSet},
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::sync::Semaphore;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkCall {
    pub upload_id: Uuid,
    pub name: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub is_complete: bool,
    pub len: usize,
}

#[derive(Default)]
pub struct FakeApi {
    calls: Mutex<Vec<ChunkCall>>,
    started: Mutex<Vec<String>>,
    payloads: Mutex<HashMap<Uuid, (String, Vec<u8>)>>,
    files: Mutex<Vec<UploadedFile>>,
    failing_uploads: Mutex<HashSet<String>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    save_gate: Mutex<Option<Arc<Semaphore>>>,
    saves_started: Mutex<Vec<String>>,
    delete_calls: Mutex<Vec<String>>,
    latency: Mutex<Option<Duration>>,
    corrupt_etags: AtomicBool,
    fail_persist: AtomicBool,
    fail_deletes: AtomicBool,
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block every chunk request until [`FakeApi::release`] hands out permits.
    pub fn hold_uploads(&self) {
        *self.gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release(&self, requests: usize) {
        if let Some(gate) = self.gate.lock().unwrap().as_ref() {
            gate.add_permits(requests);
        }
    }

    /// Block every register call until [`FakeApi::release_saves`].
    pub fn hold_saves(&self) {
        *self.save_gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_saves(&self, requests: usize) {
        if let Some(gate) = self.save_gate.lock().unwrap().as_ref() {
            gate.add_permits(requests);
        }
    }

    /// Delay every chunk request by `latency` once it is admitted.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = Some(latency);
    }

    pub fn fail_uploads_of(&self, name: &str) {
        self.failing_uploads.lock().unwrap().insert(name.to_string());
    }

    pub fn clear_failures(&self) {
        self.failing_uploads.lock().unwrap().clear();
    }

    pub fn corrupt_etags(&self) {
        self.corrupt_etags.store(true, Ordering::SeqCst);
    }

    pub fn fail_persist(&self) {
        self.fail_persist.store(true, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self) {
        self.fail_deletes.store(true, Ordering::SeqCst);
    }

    /// Completed chunk requests, in arrival order.
    pub fn chunk_calls(&self) -> Vec<ChunkCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Names of requests that have reached the API, completed or not.
    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    /// Public ids passed to `delete_file`, whether or not they existed.
    pub fn delete_calls(&self) -> Vec<String> {
        self.delete_calls.lock().unwrap().clone()
    }

    pub fn received(&self, name: &str) -> Vec<u8> {
        self.payloads
            .lock()
            .unwrap()
            .values()
            .find(|(n, _)| n == name)
            .map(|(_, data)| data.clone())
            .unwrap_or_default()
    }

    pub fn seed_file(&self, name: &str) -> UploadedFile {
        let file = record(name);
        self.files.lock().unwrap().insert(0, file.clone());
        file
    }

    pub fn files(&self) -> Vec<UploadedFile> {
        self.files.lock().unwrap().clone()
    }

    /// Poll until `n` requests for `name` have started.
    pub async fn wait_started(&self, name: &str, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.started().iter().filter(|s| *s == name).count() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("request never started");
    }

    pub async fn wait_save_started(&self, name: &str) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !self.saves_started.lock().unwrap().iter().any(|s| s == name) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("save never started");
    }

    pub async fn wait_delete_call(&self, public_id: &str) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !self.delete_calls().iter().any(|p| p == public_id) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("delete never called");
    }
}

fn record(name: &str) -> UploadedFile {
    let public_id = format!("uploads/{}", name);
    UploadedFile {
        id: Uuid::new_v4(),
        url: format!("http://fake/media/{}", public_id),
        public_id,
        original_name: name.to_string(),
        content_type: None,
        size_bytes: 0,
        state: FileState::Active,
        created_at: Utc::now(),
    }
}

#[async_trait]
impl FileHostApi for FakeApi {
    async fn upload_chunk(&self, chunk: ChunkRequest) -> ApiResult<UploadChunkResponse> {
        self.started.lock().unwrap().push(chunk.name.clone());

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await.expect("gate closed").forget();
        }
        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if self.failing_uploads.lock().unwrap().contains(&chunk.name) {
            return Err(ApiError::Rejected {
                status: 500,
                message: "disk full".into(),
            });
        }

        self.calls.lock().unwrap().push(ChunkCall {
            upload_id: chunk.upload_id,
            name: chunk.name.clone(),
            chunk_index: chunk.chunk_index,
            total_chunks: chunk.total_chunks,
            is_complete: chunk.is_complete,
            len: chunk.data.len(),
        });

        let assembled = {
            let mut payloads = self.payloads.lock().unwrap();
            let entry = payloads
                .entry(chunk.upload_id)
                .or_insert_with(|| (chunk.name.clone(), Vec::new()));
            entry.1.extend_from_slice(&chunk.data);
            entry.1.clone()
        };

        if !chunk.is_complete {
            return Ok(UploadChunkResponse {
                success: true,
                chunk_index: chunk.chunk_index,
                complete: false,
                url: None,
                public_id: None,
                etag: None,
            });
        }

        let etag = if self.corrupt_etags.load(Ordering::SeqCst) {
            "0".repeat(32)
        } else {
            format!("{:x}", md5::compute(&assembled))
        };
        let public_id = format!("uploads/{}", chunk.name);
        Ok(UploadChunkResponse {
            success: true,
            chunk_index: chunk.chunk_index,
            complete: true,
            url: Some(format!("http://fake/media/{}", public_id)),
            public_id: Some(public_id),
            etag: Some(etag),
        })
    }

    async fn register_file(&self, req: &CreateFileRequest) -> ApiResult<UploadedFile> {
        self.saves_started
            .lock()
            .unwrap()
            .push(req.original_name.clone());
        let gate = self.save_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await.expect("gate closed").forget();
        }
        if self.fail_persist.load(Ordering::SeqCst) {
            return Err(ApiError::Rejected {
                status: 500,
                message: "database is locked".into(),
            });
        }
        let mut file = record(&req.original_name);
        file.url = req.url.clone();
        file.public_id = req.public_id.clone();
        self.files.lock().unwrap().insert(0, file.clone());
        Ok(file)
    }

    async fn list_files(&self) -> ApiResult<Vec<UploadedFile>> {
        Ok(self.files())
    }

    async fn delete_file(&self, public_id: &str) -> ApiResult<()> {
        self.delete_calls.lock().unwrap().push(public_id.to_string());
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(ApiError::Rejected {
                status: 502,
                message: "provider unavailable".into(),
            });
        }
        let mut files = self.files.lock().unwrap();
        let before = files.len();
        files.retain(|f| f.public_id != public_id);
        if files.len() == before {
            return Err(ApiError::Rejected {
                status: 404,
                message: "file not found".into(),
            });
        }
        Ok(())
    }

    async fn download(&self, url: &str, dest: &Path) -> ApiResult<u64> {
        let name = url.rsplit('/').next().unwrap_or_default().to_string();
        let data = self.received(&name);
        tokio::fs::write(dest, &data).await?;
        Ok(data.len() as u64)
    }
}
