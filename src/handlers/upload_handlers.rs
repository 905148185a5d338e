//! `POST /api/upload`: receives a whole file or one chunk of a larger one.
//!
//! The file part is streamed straight to a staging file so chunk bodies are
//! never buffered in memory.

use crate::{
    errors::AppError,
    models::api::{UploadChunkResponse, upload_fields},
    server::AppState,
    services::chunk_assembler::{ChunkMeta, ChunkOutcome, UploadError, UploadResult},
};
use axum::{
    Json,
    extract::{Multipart, State},
};
use std::path::Path;
use tokio::{fs, io::AsyncWriteExt};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Default)]
struct UploadForm {
    id: Option<String>,
    name: Option<String>,
    chunk_index: Option<String>,
    total_chunks: Option<String>,
    is_complete: Option<String>,
    file_bytes: Option<u64>,
}

impl UploadForm {
    fn into_meta(self) -> UploadResult<(ChunkMeta, u64)> {
        let id = self.id.ok_or(UploadError::MissingField(upload_fields::ID))?;
        let upload_id = Uuid::parse_str(id.trim()).map_err(|err| UploadError::InvalidField {
            field: upload_fields::ID,
            reason: err.to_string(),
        })?;
        let name = self
            .name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .ok_or(UploadError::MissingField(upload_fields::NAME))?;
        let chunk_index = parse_u32(self.chunk_index, upload_fields::CHUNK_INDEX)?;
        let total_chunks = parse_u32(self.total_chunks, upload_fields::TOTAL_CHUNKS)?;
        let is_complete = parse_flag(self.is_complete, upload_fields::IS_COMPLETE)?;
        let file_bytes = self
            .file_bytes
            .ok_or(UploadError::MissingField(upload_fields::FILE))?;

        Ok((
            ChunkMeta {
                upload_id,
                name,
                chunk_index,
                total_chunks,
                is_complete,
            },
            file_bytes,
        ))
    }
}

fn parse_u32(value: Option<String>, field: &'static str) -> UploadResult<u32> {
    let value = value.ok_or(UploadError::MissingField(field))?;
    value
        .trim()
        .parse::<u32>()
        .map_err(|err| UploadError::InvalidField {
            field,
            reason: err.to_string(),
        })
}

fn parse_flag(value: Option<String>, field: &'static str) -> UploadResult<bool> {
    match value.as_deref().map(str::trim) {
        Some("true") | Some("1") => Ok(true),
        Some("false") | Some("0") => Ok(false),
        Some(other) => Err(UploadError::InvalidField {
            field,
            reason: format!("expected true or false, got `{}`", other),
        }),
        None => Err(UploadError::MissingField(field)),
    }
}

fn multipart_error(err: axum::extract::multipart::MultipartError) -> UploadError {
    UploadError::Multipart(err.body_text())
}

/// Read every multipart field, streaming the file part into `incoming`.
async fn read_form(multipart: &mut Multipart, incoming: &Path) -> UploadResult<UploadForm> {
    let mut form = UploadForm::default();
    while let Some(mut field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            upload_fields::FILE => {
                let mut file = fs::File::create(incoming).await?;
                let mut written: u64 = 0;
                while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
                    written += chunk.len() as u64;
                    file.write_all(&chunk).await?;
                }
                file.flush().await?;
                file.sync_all().await?;
                form.file_bytes = Some(written);
            }
            upload_fields::ID => form.id = Some(field.text().await.map_err(multipart_error)?),
            upload_fields::NAME => form.name = Some(field.text().await.map_err(multipart_error)?),
            upload_fields::CHUNK_INDEX => {
                form.chunk_index = Some(field.text().await.map_err(multipart_error)?)
            }
            upload_fields::TOTAL_CHUNKS => {
                form.total_chunks = Some(field.text().await.map_err(multipart_error)?)
            }
            upload_fields::IS_COMPLETE => {
                form.is_complete = Some(field.text().await.map_err(multipart_error)?)
            }
            _ => {}
        }
    }
    Ok(form)
}

/// `POST /api/upload`
pub async fn upload_chunk(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadChunkResponse>, AppError> {
    fs::create_dir_all(state.uploads.staging_dir())
        .await
        .map_err(|err| AppError::internal(err.to_string()))?;

    let incoming = state.uploads.incoming_path();
    let parsed = match read_form(&mut multipart, &incoming).await {
        Ok(form) => form.into_meta(),
        Err(err) => Err(err),
    };
    let (meta, chunk_bytes) = match parsed {
        Ok(parsed) => parsed,
        Err(err) => {
            let _ = fs::remove_file(&incoming).await;
            return Err(err.into());
        }
    };

    let outcome = state.uploads.accept(&meta, &incoming, chunk_bytes).await?;
    let (path, name) = match outcome {
        ChunkOutcome::Partial { .. } => {
            return Ok(Json(UploadChunkResponse {
                success: true,
                chunk_index: meta.chunk_index,
                complete: false,
                url: None,
                public_id: None,
                etag: None,
            }));
        }
        ChunkOutcome::Complete { path, name, .. } => (path, name),
    };

    let stored = state.files.gateway.put_file(&path, &name).await;
    state.uploads.finish(meta.upload_id).await;
    let object = stored?;

    info!(
        "upload {} stored as {} ({} bytes)",
        meta.upload_id, object.public_id, object.size_bytes
    );
    Ok(Json(UploadChunkResponse {
        success: true,
        chunk_index: meta.chunk_index,
        complete: true,
        url: Some(state.files.url_for(&object.public_id)),
        public_id: Some(object.public_id),
        etag: object.etag,
    }))
}
