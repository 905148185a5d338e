//! Client-side view of uploaded files.

use crate::{
    client::api::{ApiError, ApiResult, FileHostApi},
    models::{
        file_kind::{FileCategory, format_size},
        uploaded_file::{FileState, UploadedFile},
    },
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::info;

/// How many items the preview strip shows.
pub const PREVIEW_LIMIT: usize = 9;

#[derive(Debug, Clone, PartialEq)]
pub struct GalleryItem {
    pub file: UploadedFile,
    pub category: FileCategory,
}

impl GalleryItem {
    pub fn new(file: UploadedFile) -> Self {
        let category = FileCategory::from_url(&file.url);
        Self { file, category }
    }

    pub fn name(&self) -> &str {
        &self.file.original_name
    }

    pub fn display_size(&self) -> String {
        format_size(self.file.size_bytes.max(0) as u64)
    }

    /// A delete started but did not finish; the record is still listed.
    pub fn is_pending_delete(&self) -> bool {
        self.file.state == FileState::PendingDelete
    }
}

pub struct Gallery {
    api: Arc<dyn FileHostApi>,
    items: Vec<GalleryItem>,
}

impl Gallery {
    pub fn new(api: Arc<dyn FileHostApi>) -> Self {
        Self {
            api,
            items: Vec::new(),
        }
    }

    /// Reload from the server. On error the previous items are kept.
    pub async fn refresh(&mut self) -> ApiResult<&[GalleryItem]> {
        let files = self.api.list_files().await?;
        self.items = files.into_iter().map(GalleryItem::new).collect();
        Ok(self.items.as_slice())
    }

    pub fn items(&self) -> &[GalleryItem] {
        &self.items
    }

    pub fn preview(&self) -> &[GalleryItem] {
        &self.items[..self.items.len().min(PREVIEW_LIMIT)]
    }

    pub fn find(&self, public_id: &str) -> Option<&GalleryItem> {
        self.items.iter().find(|i| i.file.public_id == public_id)
    }

    /// Show a freshly persisted upload without waiting for a refresh.
    pub fn insert(&mut self, file: UploadedFile) {
        self.items.retain(|i| i.file.public_id != file.public_id);
        self.items.insert(0, GalleryItem::new(file));
    }

    /// Delete from storage and metadata. The item is only dropped from the
    /// view once the server confirms.
    pub async fn delete(&mut self, public_id: &str) -> ApiResult<()> {
        self.api.delete_file(public_id).await?;
        self.items.retain(|i| i.file.public_id != public_id);
        info!("deleted {}", public_id);
        Ok(())
    }

    /// Save an item locally. `dest` defaults to its original name in the
    /// current directory.
    pub async fn download(&self, public_id: &str, dest: Option<&Path>) -> ApiResult<(PathBuf, u64)> {
        let item = self.find(public_id).ok_or_else(|| ApiError::Rejected {
            status: 404,
            message: format!("{} is not in the gallery", public_id),
        })?;
        let dest = dest
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(local_name(item.name())));
        let written = self.api.download(&item.file.url, &dest).await?;
        Ok((dest, written))
    }
}

/// Strip directory components a remote name might carry.
fn local_name(name: &str) -> &str {
    name.rsplit(['/', '\\'])
        .find(|part| !part.is_empty() && *part != "..")
        .unwrap_or("download")
}
