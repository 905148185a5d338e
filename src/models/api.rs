//! Wire types for the JSON API.
//!
//! Every success body carries `success: true`; failures are rendered by
//! [`crate::errors::AppError`] as `{"success": false, "error", "status"}`.

use crate::models::uploaded_file::UploadedFile;
use serde::{Deserialize, Serialize};

/// Multipart field names accepted by `POST /api/upload`.
pub mod upload_fields {
    pub const ID: &str = "id";
    pub const NAME: &str = "name";
    pub const CHUNK_INDEX: &str = "chunk_index";
    pub const TOTAL_CHUNKS: &str = "total_chunks";
    pub const IS_COMPLETE: &str = "is_complete";
    pub const FILE: &str = "file";
}

/// Response to one upload request (a whole file or one chunk).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct UploadChunkResponse {
    pub success: bool,
    pub chunk_index: u32,
    pub complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_id: Option<String>,
    /// MD5 of the assembled payload, hex encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ListFilesResponse {
    pub success: bool,
    pub files: Vec<UploadedFile>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CreateFileRequest {
    pub url: String,
    pub public_id: String,
    pub original_name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FileResponse {
    pub success: bool,
    pub file: UploadedFile,
}

/// Body for `DELETE /api/files`; exactly one of the fields should be set.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct DeleteRecordRequest {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub public_id: Option<String>,
}

/// Body for `POST /api/delete` (storage-only removal).
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DeleteObjectRequest {
    pub public_id: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MessageResponse {
    pub success: bool,
    pub message: String,
}

impl MessageResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }
}

/// Error body as rendered by the server.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ErrorResponse {
    #[serde(default)]
    pub success: bool,
    pub error: String,
    pub status: u16,
}
