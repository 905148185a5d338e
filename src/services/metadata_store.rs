//! Metadata store: one SQLite row per uploaded object.

use crate::models::uploaded_file::{FileState, UploadedFile};
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("file `{0}` not found")]
    NotFound(String),
    #[error("file `{0}` is already registered")]
    Duplicate(String),
    #[error("invalid record: {0}")]
    Invalid(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type MetadataResult<T> = Result<T, MetadataError>;

/// Fields supplied when registering a new record.
#[derive(Debug, Clone)]
pub struct NewFileRecord {
    pub url: String,
    pub public_id: String,
    pub original_name: String,
    pub content_type: Option<String>,
    pub size_bytes: i64,
}

/// Lookup key for record removal.
#[derive(Debug, Clone, Copy)]
pub enum RecordKey<'a> {
    Url(&'a str),
    PublicId(&'a str),
}

impl RecordKey<'_> {
    fn column(&self) -> &'static str {
        match self {
            RecordKey::Url(_) => "url",
            RecordKey::PublicId(_) => "public_id",
        }
    }

    fn value(&self) -> &str {
        match self {
            RecordKey::Url(v) | RecordKey::PublicId(v) => v,
        }
    }
}

const SELECT_COLUMNS: &str =
    "id, url, public_id, original_name, content_type, size_bytes, state, created_at";

#[derive(Clone)]
pub struct MetadataStore {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
}

impl MetadataStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Insert a new active record.
    pub async fn insert(&self, record: NewFileRecord) -> MetadataResult<UploadedFile> {
        if record.url.trim().is_empty() {
            return Err(MetadataError::Invalid("url is required".into()));
        }
        if record.public_id.trim().is_empty() {
            return Err(MetadataError::Invalid("public_id is required".into()));
        }

        let sql = format!(
            "INSERT INTO files ({SELECT_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             RETURNING {SELECT_COLUMNS}"
        );
        sqlx::query_as::<_, UploadedFile>(&sql)
            .bind(Uuid::new_v4())
            .bind(&record.url)
            .bind(&record.public_id)
            .bind(&record.original_name)
            .bind(&record.content_type)
            .bind(record.size_bytes)
            .bind(FileState::Active)
            .bind(Utc::now())
            .fetch_one(&*self.db)
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    MetadataError::Duplicate(record.public_id.clone())
                } else {
                    MetadataError::Sqlx(err)
                }
            })
    }

    /// All records, newest first. Pending deletes are included so clients can
    /// keep showing an entry whose removal has not been confirmed yet.
    pub async fn list(&self) -> MetadataResult<Vec<UploadedFile>> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM files ORDER BY rowid DESC");
        Ok(sqlx::query_as::<_, UploadedFile>(&sql)
            .fetch_all(&*self.db)
            .await?)
    }

    pub async fn list_in_state(&self, state: FileState) -> MetadataResult<Vec<UploadedFile>> {
        let sql =
            format!("SELECT {SELECT_COLUMNS} FROM files WHERE state = ? ORDER BY rowid ASC");
        Ok(sqlx::query_as::<_, UploadedFile>(&sql)
            .bind(state)
            .fetch_all(&*self.db)
            .await?)
    }

    /// Set the state of the record with `public_id`.
    pub async fn set_state(&self, public_id: &str, state: FileState) -> MetadataResult<()> {
        let result = sqlx::query("UPDATE files SET state = ? WHERE public_id = ?")
            .bind(state)
            .bind(public_id)
            .execute(&*self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(MetadataError::NotFound(public_id.to_string()));
        }
        Ok(())
    }

    /// Remove a record by URL or public id.
    pub async fn delete(&self, key: RecordKey<'_>) -> MetadataResult<()> {
        let sql = format!("DELETE FROM files WHERE {} = ?", key.column());
        let result = sqlx::query(&sql)
            .bind(key.value())
            .execute(&*self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(MetadataError::NotFound(key.value().to_string()));
        }
        Ok(())
    }

    /// Whether any record references `public_id`, whatever its state.
    pub async fn contains_public_id(&self, public_id: &str) -> MetadataResult<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files WHERE public_id = ?")
            .bind(public_id)
            .fetch_one(&*self.db)
            .await?;
        Ok(count > 0)
    }

    pub async fn ping(&self) -> MetadataResult<()> {
        let v: i64 = sqlx::query_scalar("SELECT 1").fetch_one(&*self.db).await?;
        if v != 1 {
            return Err(MetadataError::Invalid(format!("unexpected result: {}", v)));
        }
        Ok(())
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}
