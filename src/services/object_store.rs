//! src/services/object_store.rs
//!
//! Cold storage for archived dumps. `LocalObjectStore` keeps payloads on disk
//! sharded beneath `base_path/{container}/{shard}/{shard}/{key}`; uploads are
//! streamed through a temp file, fsynced and renamed into place, so an object
//! is either fully present or absent. Re-uploading a key overwrites it.

use crate::{errors::ArchiveError, models::locator::Locator};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, pin_mut};
use md5::Context;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("container `{name}` invalid: {reason}")]
    InvalidContainerName { name: String, reason: String },
    #[error("object `{key}` not found in container `{container}`")]
    ObjectNotFound { container: String, key: String },
    #[error("invalid object key `{0}`")]
    InvalidObjectKey(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

impl From<StorageError> for ArchiveError {
    fn from(err: StorageError) -> Self {
        ArchiveError::transfer(err.to_string())
    }
}

/// Object store consumed by the orchestrators.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store the file at `artifact` under `container/key`, returning its locator.
    async fn upload(
        &self,
        artifact: &Path,
        container: &str,
        key: &str,
    ) -> Result<Locator, ArchiveError>;

    /// Fetch the object at `locator` into the file at `artifact`.
    async fn download(&self, locator: &Locator, artifact: &Path) -> Result<(), ArchiveError>;
}

/// Outcome of streaming a payload to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub size_bytes: u64,
    pub etag: String,
}

const MAX_OBJECT_KEY_LEN: usize = 1024;
const CONTAINER_NAME_MIN_LEN: usize = 3;
const CONTAINER_NAME_MAX_LEN: usize = 63;

/// Filesystem-backed object store.
#[derive(Clone, Debug)]
pub struct LocalObjectStore {
    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,
}

impl LocalObjectStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Basic key validation to avoid trivial path traversal vectors.
    fn ensure_key_safe(&self, key: &str) -> StorageResult<()> {
        let invalid = || StorageError::InvalidObjectKey(key.to_string());
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(invalid());
        }
        if key.starts_with('/') || key.ends_with('/') || key.contains("..") {
            return Err(invalid());
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(invalid());
        }
        Ok(())
    }

    /// Validate container name format.
    ///
    /// Enforces S3-like bucket naming rules:
    /// - 3–63 characters
    /// - lowercase letters, digits, dots, hyphens only
    /// - cannot start/end with dot or hyphen
    /// - cannot contain consecutive dots or dot-hyphen patterns
    /// - cannot look like an IPv4 address
    fn ensure_container_name_safe(&self, name: &str) -> StorageResult<()> {
        let invalid = |reason: &str| StorageError::InvalidContainerName {
            name: name.to_string(),
            reason: reason.into(),
        };

        let len = name.len();
        if !(CONTAINER_NAME_MIN_LEN..=CONTAINER_NAME_MAX_LEN).contains(&len) {
            return Err(invalid("must be between 3 and 63 characters"));
        }

        if !name
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
        {
            return Err(invalid(
                "allowed characters are lowercase letters, digits, dots, and hyphens",
            ));
        }

        if name.starts_with('.')
            || name.ends_with('.')
            || name.starts_with('-')
            || name.ends_with('-')
        {
            return Err(invalid("must start and end with a lowercase letter or digit"));
        }

        if name.contains("..") || name.contains("-.") || name.contains(".-") {
            return Err(invalid(
                "cannot contain consecutive dots or dot-hyphen combinations",
            ));
        }

        if is_ipv4_like(name) {
            return Err(invalid("must not be formatted like an IP address"));
        }

        Ok(())
    }

    /// Generate two-level shard identifiers for an object key.
    ///
    /// Uses MD5(container/key) and returns the first two bytes as lowercase
    /// hexadecimal strings (00–ff).
    fn object_shards(container: &str, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", container, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// Construct a fully-qualified object payload path.
    fn object_path(&self, container: &str, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(container, key);
        let mut path = self.base_path.clone();
        path.push(container);
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    /// Stream `artifact` into the store under `container/key`.
    ///
    /// Writes to a sibling temp file first and renames into place once the
    /// payload is flushed and synced; the temp file is removed on any error.
    pub async fn put_file(
        &self,
        artifact: &Path,
        container: &str,
        key: &str,
    ) -> StorageResult<StoredObject> {
        self.ensure_container_name_safe(container)?;
        self.ensure_key_safe(key)?;

        let file_path = self.object_path(container, key);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::other("object path missing parent directory"))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        let source = File::open(artifact).await?;
        let stored = match write_stream(&tmp_path, ReaderStream::new(source)).await {
            Ok(stored) => stored,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Io(err));
            }
        };

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(&file_path).await?;
                fs::rename(&tmp_path, &file_path).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Io(err));
            }
        }

        debug!(
            "stored {}/{} ({} bytes, etag {})",
            container, key, stored.size_bytes, stored.etag
        );
        Ok(stored)
    }

    /// Copy the object at `container/key` out to `dest`.
    pub async fn get_file(
        &self,
        container: &str,
        key: &str,
        dest: &Path,
    ) -> StorageResult<StoredObject> {
        self.ensure_container_name_safe(container)?;
        self.ensure_key_safe(key)?;

        let file_path = self.object_path(container, key);
        let source = File::open(&file_path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StorageError::ObjectNotFound {
                    container: container.to_string(),
                    key: key.to_string(),
                }
            } else {
                StorageError::Io(err)
            }
        })?;

        let stored = write_stream(dest, ReaderStream::new(source)).await?;
        debug!(
            "fetched {}/{} into {} ({} bytes)",
            container,
            key,
            dest.display(),
            stored.size_bytes
        );
        Ok(stored)
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn upload(
        &self,
        artifact: &Path,
        container: &str,
        key: &str,
    ) -> Result<Locator, ArchiveError> {
        self.put_file(artifact, container, key).await?;
        Ok(Locator::new(container, key))
    }

    async fn download(&self, locator: &Locator, artifact: &Path) -> Result<(), ArchiveError> {
        self.get_file(&locator.container, &locator.key, artifact)
            .await?;
        Ok(())
    }
}

/// Write a byte stream to `path`, computing size and MD5 etag as it goes.
async fn write_stream<S>(path: &Path, stream: S) -> io::Result<StoredObject>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    let mut file = File::create(path).await?;
    let mut size_bytes: u64 = 0;
    let mut digest = Context::new();
    pin_mut!(stream);
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        size_bytes += chunk.len() as u64;
        digest.consume(&chunk);
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    file.sync_all().await?;

    Ok(StoredObject {
        size_bytes,
        etag: format!("{:x}", digest.compute()),
    })
}

/// Check if a string matches IPv4-like dotted decimal form.
fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() != 4 {
        return false;
    }
    parts.iter().all(|segment| {
        !segment.is_empty()
            && segment.len() <= 3
            && segment.chars().all(|c| c.is_ascii_digit())
            && segment.parse::<u8>().is_ok()
    })
}
