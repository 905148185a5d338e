//! src/services/storage_gateway.rs
//!
//! Storage gateway: the media provider that holds uploaded payloads.
//!
//! The server only talks to the provider through [`StorageGateway`]. The
//! bundled provider, [`LocalDiskGateway`], keeps payloads on local disk
//! sharded beneath `base_path/{shard}/{shard}/{public_id}`.

use crate::models::{file_kind::extension_of, stored_object::StoredObject};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use md5::Context;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncWriteExt},
};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object `{0}` not found")]
    ObjectNotFound(String),
    #[error("invalid public id `{0}`")]
    InvalidPublicId(String),
    #[error("storage provider error: {0}")]
    Provider(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Contract with the media provider.
///
/// Identifiers handed out by `put_file` are canonical: callers store them
/// verbatim and pass them back unchanged to `stat`, `open` and `delete`.
#[async_trait]
pub trait StorageGateway: Send + Sync {
    /// Move the file at `source` into the provider under a fresh identifier.
    /// The source file is consumed.
    async fn put_file(&self, source: &Path, original_name: &str) -> StorageResult<StoredObject>;

    async fn stat(&self, public_id: &str) -> StorageResult<StoredObject>;

    /// Metadata plus an open handle ready for streaming out.
    async fn open(&self, public_id: &str) -> StorageResult<(StoredObject, File)>;

    /// Remove an object. Returns `ObjectNotFound` when it is already gone.
    async fn delete(&self, public_id: &str) -> StorageResult<()>;

    /// Every object the provider currently holds.
    async fn list(&self) -> StorageResult<Vec<StoredObject>>;

    /// Cheap write/read/delete round trip used by readiness checks.
    async fn probe(&self) -> StorageResult<()>;
}

const MAX_PUBLIC_ID_LEN: usize = 1024;
const MAX_EXTENSION_LEN: usize = 16;
const TMP_PREFIX: &str = ".tmp-";
const HASH_BUF_SIZE: usize = 64 * 1024;

#[derive(Clone, Debug)]
pub struct LocalDiskGateway {
    /// Base directory on disk where object payloads are stored.
    base_path: PathBuf,

    /// Folder prefix for every identifier this gateway hands out.
    folder: String,
}

impl LocalDiskGateway {
    pub fn new(base_path: impl Into<PathBuf>, folder: impl Into<String>) -> Self {
        Self {
            base_path: base_path.into(),
            folder: folder.into().trim_matches('/').to_string(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Basic identifier validation to avoid trivial path traversal vectors.
    ///
    /// Rejects identifiers that begin with `/` or contain `..`.
    fn ensure_public_id_safe(&self, public_id: &str) -> StorageResult<()> {
        let invalid = || StorageError::InvalidPublicId(public_id.to_string());
        if public_id.is_empty() || public_id.len() > MAX_PUBLIC_ID_LEN {
            return Err(invalid());
        }
        if public_id.starts_with('/') || public_id.ends_with('/') || public_id.contains("..") {
            return Err(invalid());
        }
        if public_id.split('/').any(|s| s.is_empty() || s.starts_with(TMP_PREFIX)) {
            return Err(invalid());
        }
        if public_id
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(invalid());
        }
        Ok(())
    }

    /// Fresh identifier of the form `{folder}/{uuid}{.ext}`. The extension is
    /// kept so the public URL still tells clients what kind of file it is.
    fn new_public_id(&self, original_name: &str) -> String {
        let id = Uuid::new_v4().simple().to_string();
        let ext = extension_of(original_name)
            .filter(|e| e.len() <= MAX_EXTENSION_LEN && e.chars().all(|c| c.is_ascii_alphanumeric()))
            .map(|e| format!(".{}", e))
            .unwrap_or_default();
        if self.folder.is_empty() {
            format!("{}{}", id, ext)
        } else {
            format!("{}/{}{}", self.folder, id, ext)
        }
    }

    /// Generate two-level shard identifiers for a public id.
    ///
    /// Uses MD5(public_id) and returns the first two bytes as lowercase
    /// hexadecimal strings (00–ff). Reduces file count per directory.
    fn object_shards(public_id: &str) -> (String, String) {
        let digest = md5::compute(public_id);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// Construct a fully-qualified object payload path.
    fn object_path(&self, public_id: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(public_id);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        for segment in public_id.split('/') {
            path.push(segment);
        }
        path
    }

    async fn stat_path(&self, public_id: &str, path: &Path) -> StorageResult<StoredObject> {
        let meta = fs::metadata(path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StorageError::ObjectNotFound(public_id.to_string())
            } else {
                StorageError::Io(err)
            }
        })?;
        if !meta.is_file() {
            return Err(StorageError::ObjectNotFound(public_id.to_string()));
        }
        let modified = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Ok(StoredObject {
            public_id: public_id.to_string(),
            size_bytes: meta.len() as i64,
            etag: None,
            modified,
        })
    }

    /// Move `source` to `dest`, falling back to copy + rename when the two
    /// live on different filesystems.
    async fn move_into_place(&self, source: &Path, dest: &Path) -> StorageResult<()> {
        match fs::rename(source, dest).await {
            Ok(()) => return Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => return Err(StorageError::Io(err)),
            Err(err) => debug!(
                "rename {} -> {} failed ({}), copying instead",
                source.display(),
                dest.display(),
                err
            ),
        }

        let parent = dest.parent().ok_or_else(|| {
            StorageError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        let tmp_path = parent.join(format!("{}{}", TMP_PREFIX, Uuid::new_v4()));
        if let Err(err) = copy_synced(source, &tmp_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }
        if let Err(err) = fs::rename(&tmp_path, dest).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }
        let _ = fs::remove_file(source).await;
        Ok(())
    }

    /// Recursively remove empty directories up to the base path.
    ///
    /// Stops when:
    /// - directory not empty
    /// - directory not found
    /// - reached root
    /// - encountered unexpected I/O errors
    async fn prune_empty_dirs(&self, start: &Path) {
        let stop = self.base_path.as_path();
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }

    /// Map an on-disk payload path back to its public id by stripping the
    /// two shard directories.
    fn public_id_from_path(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.base_path).ok()?;
        let segments: Vec<&str> = relative
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<Vec<_>>>()?;
        if segments.len() < 3 {
            return None;
        }
        let public_id = segments[2..].join("/");
        let (shard_a, shard_b) = Self::object_shards(&public_id);
        if segments[0] != shard_a || segments[1] != shard_b {
            return None;
        }
        Some(public_id)
    }
}

#[async_trait]
impl StorageGateway for LocalDiskGateway {
    async fn put_file(&self, source: &Path, original_name: &str) -> StorageResult<StoredObject> {
        let public_id = self.new_public_id(original_name);
        let file_path = self.object_path(&public_id);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;

        self.move_into_place(source, &file_path).await?;

        let etag = match md5_file(&file_path).await {
            Ok(etag) => etag,
            Err(err) => {
                let _ = fs::remove_file(&file_path).await;
                return Err(StorageError::Io(err));
            }
        };

        let mut object = self.stat_path(&public_id, &file_path).await?;
        object.etag = Some(etag);
        debug!(
            "stored {} as {} ({} bytes)",
            original_name, object.public_id, object.size_bytes
        );
        Ok(object)
    }

    async fn stat(&self, public_id: &str) -> StorageResult<StoredObject> {
        self.ensure_public_id_safe(public_id)?;
        let path = self.object_path(public_id);
        self.stat_path(public_id, &path).await
    }

    async fn open(&self, public_id: &str) -> StorageResult<(StoredObject, File)> {
        self.ensure_public_id_safe(public_id)?;
        let path = self.object_path(public_id);
        let object = self.stat_path(public_id, &path).await?;
        let file = File::open(&path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StorageError::ObjectNotFound(public_id.to_string())
            } else {
                StorageError::Io(err)
            }
        })?;
        Ok((object, file))
    }

    async fn delete(&self, public_id: &str) -> StorageResult<()> {
        self.ensure_public_id_safe(public_id)?;
        let file_path = self.object_path(public_id);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StorageError::ObjectNotFound(public_id.to_string()));
            }
            Err(err) => return Err(StorageError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }

    async fn list(&self) -> StorageResult<Vec<StoredObject>> {
        let mut objects = Vec::new();
        let mut pending = vec![self.base_path.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(StorageError::Io(err)),
            };
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                let path = entry.path();
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                let hidden = entry.file_name().to_string_lossy().starts_with('.');
                if !file_type.is_file() || hidden {
                    continue;
                }
                if let Some(public_id) = self.public_id_from_path(&path) {
                    objects.push(self.stat_path(&public_id, &path).await?);
                }
            }
        }
        objects.sort_by(|a, b| a.public_id.cmp(&b.public_id));
        Ok(objects)
    }

    async fn probe(&self) -> StorageResult<()> {
        fs::create_dir_all(&self.base_path).await?;
        let tmp_path = self
            .base_path
            .join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&tmp_path, b"readyz").await?;
        let bytes = fs::read(&tmp_path).await;
        let _ = fs::remove_file(&tmp_path).await;
        if bytes? != b"readyz" {
            return Err(StorageError::Provider("file content mismatch".into()));
        }
        Ok(())
    }
}

async fn copy_synced(source: &Path, dest: &Path) -> io::Result<()> {
    fs::copy(source, dest).await?;
    let file = fs::OpenOptions::new().write(true).open(dest).await?;
    file.sync_all().await
}

/// Hex MD5 of a file's contents, streamed in fixed-size reads.
pub async fn md5_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path).await?;
    let mut digest = Context::new();
    let mut buf = vec![0u8; HASH_BUF_SIZE];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        digest.consume(&buf[..read]);
    }
    Ok(format!("{:x}", digest.compute()))
}

/// Write `bytes` to a fresh file, flushing and syncing before returning.
pub async fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await
}
