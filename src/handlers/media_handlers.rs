//! Serves stored payloads at their public URLs.

use crate::{
    errors::AppError, models::file_kind::content_type_for,
    models::stored_object::StoredObject, server::AppState,
};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use tokio_util::io::ReaderStream;

/// `GET /media/{*public_id}` as a streaming response.
pub async fn get_media(
    State(state): State<AppState>,
    Path(public_id): Path<String>,
) -> Result<Response, AppError> {
    let (object, file) = state.files.gateway.open(&public_id).await?;
    let body = Body::from_stream(ReaderStream::new(file));

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    set_object_headers(response.headers_mut(), &object);
    Ok(response)
}

/// `HEAD /media/{*public_id}`: same headers as GET but no body.
pub async fn head_media(
    State(state): State<AppState>,
    Path(public_id): Path<String>,
) -> Result<Response, AppError> {
    let object = state.files.gateway.stat(&public_id).await?;
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    set_object_headers(response.headers_mut(), &object);
    Ok(response)
}

fn set_object_headers(headers: &mut HeaderMap, object: &StoredObject) {
    let content_type = content_type_for(&object.public_id)
        .unwrap_or_else(|| "application/octet-stream".into());
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );

    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from(object.size_bytes.max(0) as u64),
    );

    if let Some(etag) = object.etag.as_ref() {
        if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", etag)) {
            headers.insert(header::ETAG, value);
        }
    }

    if let Ok(value) = HeaderValue::from_str(
        &object
            .modified
            .format("%a, %d %b %Y %H:%M:%S GMT")
            .to_string(),
    ) {
        headers.insert(header::LAST_MODIFIED, value);
    }
}
