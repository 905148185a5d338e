//! Defines routes for the file host API.
//!
//! ## Structure
//! - **Upload**
//!   - `POST   /api/upload`: whole file or one chunk (multipart)
//!
//! - **Records**
//!   - `GET    /api/files`: list records, newest first
//!   - `POST   /api/files`: register an uploaded object
//!   - `DELETE /api/files`: remove a record by url or public id
//!   - `DELETE /api/files/{*public_id}`: two-phase delete (storage + record)
//!
//! - **Storage**
//!   - `POST   /api/delete`: remove an object from storage only
//!   - `GET    /media/{*public_id}`: download an object
//!   - `HEAD   /media/{*public_id}`: retrieve headers only
//!
//! The wildcard `*public_id` allows folder-prefixed ids like `uploads/ab12.png`.

use crate::{
    handlers::{
        file_handlers::{create_file, delete_file, delete_object, delete_record, list_files},
        health_handlers::{healthz, readyz},
        media_handlers::{get_media, head_media},
        upload_handlers::upload_chunk,
    },
    server::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
};

/// Build and return the router for every API route.
///
/// Upload bodies may be as large as `max_request_bytes`; every other route
/// keeps axum's default limit.
pub fn routes(max_request_bytes: usize) -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route(
            "/api/upload",
            post(upload_chunk).layer(DefaultBodyLimit::max(max_request_bytes)),
        )
        .route(
            "/api/files",
            get(list_files).post(create_file).delete(delete_record),
        )
        .route("/api/files/{*public_id}", delete(delete_file))
        .route("/api/delete", post(delete_object))
        .route("/media/{*public_id}", get(get_media).head(head_media))
}
