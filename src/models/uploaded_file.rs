//! Represents a file that has been uploaded and registered in the metadata store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Lifecycle state of a metadata record.
///
/// Records move from `Active` to `PendingDelete` during the first phase of a
/// delete and are removed once the storage provider confirms the object is gone.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum FileState {
    Active,
    PendingDelete,
}

/// A persisted upload record.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct UploadedFile {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Public URL the object is served from.
    pub url: String,

    /// Provider identifier, stored exactly as returned by the storage gateway.
    pub public_id: String,

    /// Name of the file as the user picked it.
    pub original_name: String,

    /// Content type (MIME type), when one could be inferred.
    pub content_type: Option<String>,

    /// Size in bytes.
    pub size_bytes: i64,

    pub state: FileState,

    /// When the record was created.
    pub created_at: DateTime<Utc>,
}
