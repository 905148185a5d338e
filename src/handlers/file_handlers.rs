//! HTTP handlers for file records and provider objects.
//!
//! - `GET    /api/files`               list records, newest first
//! - `POST   /api/files`               register an uploaded object
//! - `DELETE /api/files`               metadata-only removal by url or public id
//! - `DELETE /api/files/{*public_id}`  two-phase delete from storage and metadata
//! - `POST   /api/delete`              storage-only removal

use crate::{
    errors::AppError,
    models::api::{
        CreateFileRequest, DeleteObjectRequest, DeleteRecordRequest, FileResponse,
        ListFilesResponse, MessageResponse,
    },
    server::AppState,
    services::metadata_store::RecordKey,
};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};

/// `GET /api/files`
pub async fn list_files(
    State(state): State<AppState>,
) -> Result<Json<ListFilesResponse>, AppError> {
    let files = state.files.list().await?;
    Ok(Json(ListFilesResponse {
        success: true,
        files,
    }))
}

/// `POST /api/files`
pub async fn create_file(
    State(state): State<AppState>,
    Json(req): Json<CreateFileRequest>,
) -> Result<(StatusCode, Json<FileResponse>), AppError> {
    let file = state.files.register(req).await?;
    Ok((
        StatusCode::CREATED,
        Json(FileResponse {
            success: true,
            file,
        }),
    ))
}

/// `DELETE /api/files` with `{url}` or `{public_id}`.
pub async fn delete_record(
    State(state): State<AppState>,
    Json(req): Json<DeleteRecordRequest>,
) -> Result<Json<MessageResponse>, AppError> {
    let key = match (req.url.as_deref(), req.public_id.as_deref()) {
        (Some(url), None) => RecordKey::Url(url),
        (None, Some(public_id)) => RecordKey::PublicId(public_id),
        _ => {
            return Err(AppError::bad_request(
                "exactly one of `url` or `public_id` is required",
            ));
        }
    };
    state.files.delete_record(key).await?;
    Ok(Json(MessageResponse::ok("record deleted")))
}

/// `DELETE /api/files/{*public_id}`
pub async fn delete_file(
    State(state): State<AppState>,
    Path(public_id): Path<String>,
) -> Result<Json<MessageResponse>, AppError> {
    state.files.delete_file(&public_id).await?;
    Ok(Json(MessageResponse::ok("file deleted")))
}

/// `POST /api/delete` with `{public_id}`.
pub async fn delete_object(
    State(state): State<AppState>,
    Json(req): Json<DeleteObjectRequest>,
) -> Result<Json<MessageResponse>, AppError> {
    if req.public_id.trim().is_empty() {
        return Err(AppError::bad_request("public_id is required"));
    }
    state.files.delete_object(&req.public_id).await?;
    Ok(Json(MessageResponse::ok("object deleted")))
}
