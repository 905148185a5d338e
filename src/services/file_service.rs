//! FileService ties the storage gateway and the metadata store together.
//!
//! Deletion runs as a two-phase protocol so a crash or provider failure never
//! leaves a record pointing at nothing without a trace:
//!
//! 1. mark the record `pending_delete`
//! 2. delete the object from the provider (already gone counts as success)
//! 3. confirm by removing the record
//!
//! [`FileService::reconcile`] finishes interrupted deletes and removes
//! provider objects that never got a metadata record.

use crate::models::{
    api::CreateFileRequest,
    file_kind::content_type_for,
    uploaded_file::{FileState, UploadedFile},
};
use crate::services::{
    metadata_store::{MetadataError, MetadataStore, NewFileRecord, RecordKey},
    storage_gateway::{StorageError, StorageGateway},
};
use chrono::{Duration as ChronoDuration, Utc};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum FileError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error("url `{url}` does not belong to object `{public_id}`")]
    UrlMismatch { url: String, public_id: String },
}

pub type FileResult<T> = Result<T, FileError>;

/// Counts produced by one reconciliation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub pending_deletes_finished: usize,
    pub pending_deletes_failed: usize,
    pub orphans_removed: usize,
}

#[derive(Clone)]
pub struct FileService {
    pub gateway: Arc<dyn StorageGateway>,
    pub metadata: MetadataStore,
    public_url: String,
}

impl FileService {
    pub fn new(
        gateway: Arc<dyn StorageGateway>,
        metadata: MetadataStore,
        public_url: impl Into<String>,
    ) -> Self {
        Self {
            gateway,
            metadata,
            public_url: public_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Public URL an object is served from.
    pub fn url_for(&self, public_id: &str) -> String {
        format!("{}/media/{}", self.public_url, public_id)
    }

    /// Register a stored object in the metadata store. Size and content type
    /// come from the provider, never from the caller.
    pub async fn register(&self, req: CreateFileRequest) -> FileResult<UploadedFile> {
        if req.url != self.url_for(&req.public_id) {
            return Err(FileError::UrlMismatch {
                url: req.url,
                public_id: req.public_id,
            });
        }
        let object = self.gateway.stat(&req.public_id).await?;
        let name = if req.original_name.trim().is_empty() {
            req.public_id.rsplit('/').next().unwrap_or(&req.public_id).to_string()
        } else {
            req.original_name
        };
        let content_type = content_type_for(&name).or_else(|| content_type_for(&req.public_id));

        let file = self
            .metadata
            .insert(NewFileRecord {
                url: req.url,
                public_id: object.public_id,
                original_name: name,
                content_type,
                size_bytes: object.size_bytes,
            })
            .await?;
        info!("registered {} ({} bytes)", file.public_id, file.size_bytes);
        Ok(file)
    }

    pub async fn list(&self) -> FileResult<Vec<UploadedFile>> {
        Ok(self.metadata.list().await?)
    }

    /// Metadata-only removal.
    pub async fn delete_record(&self, key: RecordKey<'_>) -> FileResult<()> {
        self.metadata.delete(key).await?;
        debug!("removed record {:?}", key);
        Ok(())
    }

    /// Storage-only removal.
    pub async fn delete_object(&self, public_id: &str) -> FileResult<()> {
        self.gateway.delete(public_id).await?;
        debug!("removed object {}", public_id);
        Ok(())
    }

    /// Full two-phase delete of a registered file.
    pub async fn delete_file(&self, public_id: &str) -> FileResult<()> {
        // Phase 1: mark. Fails with NotFound when no record exists.
        self.metadata
            .set_state(public_id, FileState::PendingDelete)
            .await?;

        // Phase 2: provider delete.
        match self.gateway.delete(public_id).await {
            Ok(()) => {}
            Err(StorageError::ObjectNotFound(_)) => {
                debug!("object {} already absent from storage", public_id);
            }
            Err(err) => {
                warn!(
                    "storage delete of {} failed, left pending for reconciliation: {}",
                    public_id, err
                );
                return Err(err.into());
            }
        }

        // Phase 3: confirm.
        self.metadata.delete(RecordKey::PublicId(public_id)).await?;
        info!("deleted {}", public_id);
        Ok(())
    }

    /// One reconciliation pass.
    ///
    /// Finishes every `pending_delete` record and removes provider objects
    /// with no record that are older than `orphan_grace`.
    pub async fn reconcile(&self, orphan_grace: Duration) -> FileResult<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for file in self.metadata.list_in_state(FileState::PendingDelete).await? {
            let gone = match self.gateway.delete(&file.public_id).await {
                Ok(()) | Err(StorageError::ObjectNotFound(_)) => true,
                Err(err) => {
                    warn!("retrying delete of {} failed: {}", file.public_id, err);
                    false
                }
            };
            if !gone {
                report.pending_deletes_failed += 1;
                continue;
            }
            match self.metadata.delete(RecordKey::PublicId(&file.public_id)).await {
                Ok(()) | Err(MetadataError::NotFound(_)) => report.pending_deletes_finished += 1,
                Err(err) => return Err(err.into()),
            }
        }

        let grace = ChronoDuration::from_std(orphan_grace).unwrap_or(ChronoDuration::MAX);
        let cutoff = Utc::now().checked_sub_signed(grace);
        for object in self.gateway.list().await? {
            let old_enough = cutoff.is_none_or(|cutoff| object.modified <= cutoff);
            if !old_enough || self.metadata.contains_public_id(&object.public_id).await? {
                continue;
            }
            match self.gateway.delete(&object.public_id).await {
                Ok(()) | Err(StorageError::ObjectNotFound(_)) => {
                    info!("removed orphaned object {}", object.public_id);
                    report.orphans_removed += 1;
                }
                Err(err) => warn!("failed to remove orphan {}: {}", object.public_id, err),
            }
        }

        Ok(report)
    }
}
