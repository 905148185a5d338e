//! HTTP client for the file host API.
//!
//! [`FileHostApi`] is the seam the transfer worker, the upload queue and the
//! gallery depend on; [`HttpClient`] is the `reqwest` implementation.

use crate::models::{
    api::{
        CreateFileRequest, ErrorResponse, FileResponse, ListFilesResponse, MessageResponse,
        UploadChunkResponse, upload_fields,
    },
    uploaded_file::UploadedFile,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::{
    Response, StatusCode,
    multipart::{Form, Part},
};
use serde::de::DeserializeOwned;
use std::{io, path::Path};
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("server rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("unexpected response: {0}")]
    Decode(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::Rejected { status: 404, .. })
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// One upload request: a whole file or one chunk of it.
#[derive(Debug, Clone)]
pub struct ChunkRequest {
    pub upload_id: Uuid,
    pub name: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub is_complete: bool,
    pub data: Bytes,
}

#[async_trait]
pub trait FileHostApi: Send + Sync + 'static {
    async fn upload_chunk(&self, chunk: ChunkRequest) -> ApiResult<UploadChunkResponse>;

    async fn register_file(&self, req: &CreateFileRequest) -> ApiResult<UploadedFile>;

    async fn list_files(&self) -> ApiResult<Vec<UploadedFile>>;

    /// Remove a file from both storage and metadata.
    async fn delete_file(&self, public_id: &str) -> ApiResult<()>;

    /// Stream the payload at `url` into `dest`, returning the byte count.
    async fn download(&self, url: &str, dest: &Path) -> ApiResult<u64>;
}

#[derive(Clone, Debug)]
pub struct HttpClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpClient {
    pub fn new(base_url: impl Into<String>) -> ApiResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("temp-file-host/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_client(http, base_url))
    }

    pub fn with_client(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Decode a success body, or turn the canonical error body into `Rejected`.
async fn decode<T: DeserializeOwned>(response: Response) -> ApiResult<T> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|err| ApiError::Decode(err.to_string()));
    }
    Err(rejection(status, response).await)
}

async fn rejection(status: StatusCode, response: Response) -> ApiError {
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorResponse>(&body)
        .map(|e| e.error)
        .unwrap_or_else(|_| {
            if body.is_empty() {
                status.canonical_reason().unwrap_or("error").to_string()
            } else {
                body
            }
        });
    ApiError::Rejected {
        status: status.as_u16(),
        message,
    }
}

#[async_trait]
impl FileHostApi for HttpClient {
    async fn upload_chunk(&self, chunk: ChunkRequest) -> ApiResult<UploadChunkResponse> {
        let len = chunk.data.len() as u64;
        let part = Part::stream_with_length(chunk.data, len)
            .file_name(chunk.name.clone())
            .mime_str("application/octet-stream")?;
        let form = Form::new()
            .text(upload_fields::ID, chunk.upload_id.to_string())
            .text(upload_fields::NAME, chunk.name)
            .text(upload_fields::CHUNK_INDEX, chunk.chunk_index.to_string())
            .text(upload_fields::TOTAL_CHUNKS, chunk.total_chunks.to_string())
            .text(upload_fields::IS_COMPLETE, chunk.is_complete.to_string())
            .part(upload_fields::FILE, part);

        debug!(
            "uploading chunk {}/{} of {} ({} bytes)",
            chunk.chunk_index + 1,
            chunk.total_chunks,
            chunk.upload_id,
            len
        );
        let response = self
            .http
            .post(self.endpoint("/api/upload"))
            .multipart(form)
            .send()
            .await?;
        decode(response).await
    }

    async fn register_file(&self, req: &CreateFileRequest) -> ApiResult<UploadedFile> {
        let response = self
            .http
            .post(self.endpoint("/api/files"))
            .json(req)
            .send()
            .await?;
        let body: FileResponse = decode(response).await?;
        Ok(body.file)
    }

    async fn list_files(&self) -> ApiResult<Vec<UploadedFile>> {
        let response = self.http.get(self.endpoint("/api/files")).send().await?;
        let body: ListFilesResponse = decode(response).await?;
        Ok(body.files)
    }

    async fn delete_file(&self, public_id: &str) -> ApiResult<()> {
        let response = self
            .http
            .delete(self.endpoint(&format!("/api/files/{}", public_id)))
            .send()
            .await?;
        let body: MessageResponse = decode(response).await?;
        if !body.success {
            return Err(ApiError::Decode(body.message));
        }
        Ok(())
    }

    async fn download(&self, url: &str, dest: &Path) -> ApiResult<u64> {
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(rejection(status, response).await);
        }

        let mut file = fs::File::create(dest).await?;
        let mut written: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            written += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(written)
    }
}
