//! Object storage abstraction using trait-based design.
//!
//! This module provides the storage interface shared by the sort driver and
//! its workers. It abstracts over the underlying implementation using the
//! object_store crate, and adds a segmented write protocol that lets
//! independent workers contribute ordered parts of one logical object.
//!
//! Keys are `/`-separated paths. Listing and prefix deletion operate on
//! whole path segments: the prefix `jobs/a` matches `jobs/a/x` but not
//! `jobs/ab`.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use object_store::{
    MultipartId, ObjectStore, PutPayload, WriteMultipart,
    local::LocalFileSystem,
    memory::InMemory,
    multipart::{MultipartStore, PartId},
    path::Path as ObjectPath,
};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use crate::error::{CommonError, Result};

/// Number of in-flight multipart chunks while assembling a segmented object.
const SEGMENT_UPLOAD_CONCURRENCY: usize = 4;

/// Handle of an open segmented write.
///
/// The handle is plain data so it can be shipped inside task descriptors to
/// workers that run in other processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadId {
    /// Final key of the assembled object.
    pub key: String,
    /// Unique id of this write attempt.
    pub upload_id: String,
    /// Store-side multipart upload, when segments are uploaded as parts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multipart_id: Option<MultipartId>,
}

impl UploadId {
    fn segment_dir(&self) -> String {
        format!("{}.segments/{}", self.key, self.upload_id)
    }

    fn segment_key(&self, index: u32) -> String {
        format!("{}/{:06}", self.segment_dir(), index)
    }
}

/// Receipt for one uploaded segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentToken {
    pub index: u32,
    pub size: u64,
    /// Store receipt of the uploaded part.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part: Option<String>,
}

/// Generic storage trait for object-store operations.
#[async_trait]
pub trait Storage: Send + Sync + Debug {
    /// Get an object, `None` if it does not exist.
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Get a byte range of an existing object.
    async fn get_range(&self, key: &str, range: Range<u64>) -> Result<Bytes>;

    /// Size of an object, `None` if it does not exist.
    async fn head(&self, key: &str) -> Result<Option<u64>>;

    /// Create or overwrite an object.
    async fn put(&self, key: &str, value: Bytes) -> Result<()>;

    /// Remove an object. Removing a missing object is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// All keys below a prefix.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Remove every object below a prefix, returning how many were removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize>;

    /// Open a segmented write for `key`.
    async fn begin_segmented_write(&self, key: &str) -> Result<UploadId>;

    /// Upload segment `index`. Re-uploading the same index overwrites it.
    /// Stores that enforce a minimum part size apply it to every segment but
    /// the last.
    async fn put_segment(&self, upload: &UploadId, index: u32, data: Bytes)
    -> Result<SegmentToken>;

    /// Assemble the final object from `tokens`, which must be exactly the
    /// segments `0..tokens.len()` in index order. Returns the object size.
    async fn complete_segmented_write(
        &self,
        upload: &UploadId,
        tokens: &[SegmentToken],
    ) -> Result<u64>;

    /// Discard every uploaded segment of an open write.
    async fn abort_segmented_write(&self, upload: &UploadId) -> Result<()>;

    /// Request counters accumulated by this instance.
    fn stats(&self) -> StorageStats;
}

/// Storage statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageStats {
    pub read_count: u64,
    pub write_count: u64,
    pub list_count: u64,
    pub delete_count: u64,
    pub error_count: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// Storage backend configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageBackend {
    /// In-memory storage for testing and development.
    #[default]
    Memory,
    /// Local filesystem storage.
    LocalFileSystem { root_path: String },
    /// AWS S3 storage. Credentials are read from the environment.
    #[cfg(feature = "aws")]
    S3 {
        bucket: String,
        region: Option<String>,
        endpoint: Option<String>,
    },
}

/// Configuration for storage creation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Storage backend to use.
    pub backend: StorageBackend,
    /// Optional prefix for all keys.
    pub key_prefix: Option<String>,
}

/// Builder for creating storage instances.
pub struct StorageBuilder {
    config: StorageConfig,
}

impl StorageBuilder {
    /// Create a new storage builder with default configuration.
    pub fn new() -> Self {
        Self {
            config: StorageConfig::default(),
        }
    }

    /// Start from an existing configuration.
    pub fn from_config(config: StorageConfig) -> Self {
        Self { config }
    }

    /// Set the storage backend.
    pub fn backend(mut self, backend: StorageBackend) -> Self {
        self.config.backend = backend;
        self
    }

    /// Set a key prefix for all operations.
    pub fn key_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.config.key_prefix = Some(prefix.into());
        self
    }

    /// Build a storage instance with the specified configuration.
    pub async fn build(self) -> Result<Arc<dyn Storage>> {
        let storage = ObjectStoreStorage::new(self.config)?;
        Ok(Arc::new(storage))
    }
}

impl Default for StorageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Internal statistics tracker for storage operations.
#[derive(Debug, Default)]
struct InternalStorageStats {
    reads: AtomicU64,
    writes: AtomicU64,
    lists: AtomicU64,
    deletes: AtomicU64,
    errors: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

impl InternalStorageStats {
    fn record_read(&self, bytes: usize) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_write(&self, bytes: usize) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_list(&self) {
        self.lists.fetch_add(1, Ordering::Relaxed);
    }

    fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    fn get_stats(&self) -> StorageStats {
        StorageStats {
            read_count: self.reads.load(Ordering::Acquire),
            write_count: self.writes.load(Ordering::Acquire),
            list_count: self.lists.load(Ordering::Acquire),
            delete_count: self.deletes.load(Ordering::Acquire),
            error_count: self.errors.load(Ordering::Acquire),
            bytes_read: self.bytes_read.load(Ordering::Acquire),
            bytes_written: self.bytes_written.load(Ordering::Acquire),
        }
    }
}

/// Object store-based storage implementation.
///
/// Segmented writes are assembled by the store itself when a
/// [`MultipartStore`] is attached. Otherwise segments are staged as objects
/// and copied into the final object on completion.
pub struct ObjectStoreStorage {
    store: Arc<dyn ObjectStore>,
    multipart: Option<Arc<dyn MultipartStore>>,
    key_prefix: Option<String>,
    stats: Arc<InternalStorageStats>,
}

impl std::fmt::Debug for ObjectStoreStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStoreStorage")
            .field("store", &self.store.to_string())
            .field("key_prefix", &self.key_prefix)
            .field("multipart", &self.multipart.is_some())
            .field("stats", &self.stats)
            .finish()
    }
}

impl ObjectStoreStorage {
    fn new(config: StorageConfig) -> Result<Self> {
        let key_prefix = config.key_prefix;
        let storage = match &config.backend {
            StorageBackend::Memory => Self::from_store(Arc::new(InMemory::new()), key_prefix),
            StorageBackend::LocalFileSystem { root_path } => {
                std::fs::create_dir_all(root_path).map_err(|e| {
                    CommonError::configuration_error_with_source(
                        format!("Failed to create storage root {}", root_path),
                        e,
                    )
                })?;
                let fs = LocalFileSystem::new_with_prefix(root_path).map_err(|e| {
                    CommonError::configuration_error_with_source(
                        "Failed to create local filesystem storage",
                        e,
                    )
                })?;
                Self::from_store(Arc::new(fs), key_prefix)
            }
            #[cfg(feature = "aws")]
            StorageBackend::S3 {
                bucket,
                region,
                endpoint,
            } => {
                let mut builder =
                    object_store::aws::AmazonS3Builder::from_env().with_bucket_name(bucket);
                if let Some(region) = region {
                    builder = builder.with_region(region);
                }
                if let Some(endpoint) = endpoint {
                    builder = builder.with_endpoint(endpoint);
                }
                let s3 = Arc::new(builder.build().map_err(|e| {
                    CommonError::configuration_error_with_source("Failed to create S3 storage", e)
                })?);
                Self::from_store(s3.clone(), key_prefix).with_multipart(s3)
            }
        };

        Ok(storage)
    }

    /// Wrap an already constructed object store.
    pub fn from_store(store: Arc<dyn ObjectStore>, key_prefix: Option<String>) -> Self {
        Self {
            store,
            multipart: None,
            key_prefix: key_prefix.map(|p| p.trim_matches('/').to_string()),
            stats: Arc::new(InternalStorageStats::default()),
        }
    }

    /// Upload segments as parts of a store-side multipart upload.
    ///
    /// `multipart` must address the same objects as the wrapped store and
    /// accept parts in any order. [`InMemory`] only accepts part indices in
    /// increasing order.
    pub fn with_multipart(mut self, multipart: Arc<dyn MultipartStore>) -> Self {
        self.multipart = Some(multipart);
        self
    }

    /// The multipart upload behind `upload`, `None` for staged segments.
    fn multipart_for<'a>(
        &'a self,
        upload: &'a UploadId,
    ) -> Result<Option<(&'a Arc<dyn MultipartStore>, &'a MultipartId)>> {
        match (&self.multipart, &upload.multipart_id) {
            (Some(multipart), Some(id)) => Ok(Some((multipart, id))),
            (None, Some(id)) => Err(CommonError::segment_error(format!(
                "{}: multipart upload {} needs a store that uploads parts",
                upload.key, id
            ))),
            (_, None) => Ok(None),
        }
    }

    /// Ask the store to join the uploaded parts. No segment bytes pass
    /// through this process.
    async fn complete_parts(
        &self,
        multipart: &Arc<dyn MultipartStore>,
        id: &MultipartId,
        upload: &UploadId,
        tokens: &[SegmentToken],
    ) -> Result<u64> {
        let parts = tokens
            .iter()
            .map(|token| match &token.part {
                Some(content_id) => Ok(PartId {
                    content_id: content_id.clone(),
                }),
                None => Err(CommonError::segment_error(format!(
                    "{}: segment {} has no part receipt",
                    upload.key, token.index
                ))),
            })
            .collect::<Result<Vec<_>>>()?;

        let path = self.key_to_path(&upload.key);
        multipart
            .complete_multipart(&path, id, parts)
            .await
            .map_err(|e| self.convert_error("complete_multipart", &upload.key, e))?;
        self.stats.record_write(0);

        let total: u64 = tokens.iter().map(|t| t.size).sum();
        match self.head(&upload.key).await? {
            Some(size) if size == total => Ok(total),
            Some(size) => Err(CommonError::segment_error(format!(
                "{}: assembled object has {} bytes, segments record {}",
                upload.key, size, total
            ))),
            None => Err(CommonError::segment_error(format!(
                "{}: assembled object is missing",
                upload.key
            ))),
        }
    }

    /// Copy staged segment objects into the final object.
    async fn copy_segments(&self, upload: &UploadId, tokens: &[SegmentToken]) -> Result<u64> {
        let path = self.key_to_path(&upload.key);
        let multipart = self
            .store
            .put_multipart(&path)
            .await
            .map_err(|e| self.convert_error("put_multipart", &upload.key, e))?;
        let mut writer = WriteMultipart::new(multipart);

        let mut total = 0u64;
        for token in tokens {
            let data = match self.get(&upload.segment_key(token.index)).await {
                Ok(Some(data)) if data.len() as u64 == token.size => data,
                Ok(Some(data)) => {
                    abort_writer(writer, &upload.key).await;
                    return Err(CommonError::segment_error(format!(
                        "{}: segment {} has {} bytes, token records {}",
                        upload.key,
                        token.index,
                        data.len(),
                        token.size
                    )));
                }
                Ok(None) => {
                    abort_writer(writer, &upload.key).await;
                    return Err(CommonError::segment_error(format!(
                        "{}: segment {} was never uploaded",
                        upload.key, token.index
                    )));
                }
                Err(e) => {
                    abort_writer(writer, &upload.key).await;
                    return Err(e);
                }
            };
            total += data.len() as u64;
            if let Err(e) = writer.wait_for_capacity(SEGMENT_UPLOAD_CONCURRENCY).await {
                abort_writer(writer, &upload.key).await;
                return Err(self.convert_error("put_part", &upload.key, e));
            }
            writer.put(data);
        }

        // `finish` aborts on its own only when the final commit fails.
        if let Err(e) = writer.wait_for_capacity(0).await {
            abort_writer(writer, &upload.key).await;
            return Err(self.convert_error("put_part", &upload.key, e));
        }
        writer
            .finish()
            .await
            .map_err(|e| self.convert_error("complete_multipart", &upload.key, e))?;
        self.stats.record_write(total as usize);
        Ok(total)
    }

    /// Convert a key to an object store path.
    fn key_to_path(&self, key: &str) -> ObjectPath {
        let key = key.trim_matches('/');
        match &self.key_prefix {
            Some(prefix) if !prefix.is_empty() && !key.is_empty() => {
                ObjectPath::from(format!("{}/{}", prefix, key))
            }
            Some(prefix) if !prefix.is_empty() => ObjectPath::from(prefix.as_str()),
            _ => ObjectPath::from(key),
        }
    }

    /// Convert an object store path back to a key.
    fn path_to_key(&self, path: &ObjectPath) -> Result<String> {
        let path_str = path.as_ref();

        match &self.key_prefix {
            Some(prefix) if !prefix.is_empty() => {
                let prefix_with_slash = format!("{}/", prefix);
                path_str
                    .strip_prefix(&prefix_with_slash)
                    .map(str::to_string)
                    .ok_or_else(|| {
                        CommonError::storage_error(format!(
                            "Path does not start with expected prefix: {}",
                            path_str
                        ))
                    })
            }
            _ => Ok(path_str.to_string()),
        }
    }

    /// Convert object store error to CommonError.
    fn convert_error(&self, operation: &str, key: &str, error: object_store::Error) -> CommonError {
        self.stats.record_error();
        match error {
            object_store::Error::NotFound { .. } => {
                CommonError::not_found_error_with_source(format!("{} {}", operation, key), error)
            }
            other => CommonError::storage_error_with_source(
                format!("Object store {} failed for {}", operation, key),
                other,
            ),
        }
    }
}

#[async_trait]
impl Storage for ObjectStoreStorage {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let path = self.key_to_path(key);

        match self.store.get(&path).await {
            Ok(get_result) => {
                let bytes = get_result
                    .bytes()
                    .await
                    .map_err(|e| self.convert_error("get", key, e))?;
                self.stats.record_read(bytes.len());
                Ok(Some(bytes))
            }
            Err(object_store::Error::NotFound { .. }) => {
                self.stats.record_read(0);
                Ok(None)
            }
            Err(e) => Err(self.convert_error("get", key, e)),
        }
    }

    async fn get_range(&self, key: &str, range: Range<u64>) -> Result<Bytes> {
        let path = self.key_to_path(key);

        let bytes = self
            .store
            .get_range(&path, range)
            .await
            .map_err(|e| self.convert_error("get_range", key, e))?;
        self.stats.record_read(bytes.len());
        Ok(bytes)
    }

    async fn head(&self, key: &str) -> Result<Option<u64>> {
        let path = self.key_to_path(key);

        match self.store.head(&path).await {
            Ok(meta) => {
                self.stats.record_read(0);
                Ok(Some(meta.size))
            }
            Err(object_store::Error::NotFound { .. }) => {
                self.stats.record_read(0);
                Ok(None)
            }
            Err(e) => Err(self.convert_error("head", key, e)),
        }
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<()> {
        let path = self.key_to_path(key);
        let size = value.len();

        self.store
            .put(&path, PutPayload::from(value))
            .await
            .map_err(|e| self.convert_error("put", key, e))?;
        self.stats.record_write(size);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.key_to_path(key);

        match self.store.delete(&path).await {
            Ok(_) | Err(object_store::Error::NotFound { .. }) => {
                self.stats.record_delete();
                Ok(())
            }
            Err(e) => Err(self.convert_error("delete", key, e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix_path = self.key_to_path(prefix);
        let mut keys = Vec::new();

        let mut stream = self.store.list(Some(&prefix_path));
        while let Some(result) = stream.next().await {
            let object_meta = result.map_err(|e| self.convert_error("list", prefix, e))?;
            keys.push(self.path_to_key(&object_meta.location)?);
        }

        self.stats.record_list();
        keys.sort();
        Ok(keys)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let prefix_path = self.key_to_path(prefix);

        let locations = self
            .store
            .list(Some(&prefix_path))
            .map_ok(|meta| meta.location)
            .boxed();
        let deleted: Vec<ObjectPath> = self
            .store
            .delete_stream(locations)
            .try_collect()
            .await
            .map_err(|e| self.convert_error("delete_prefix", prefix, e))?;

        self.stats.record_list();
        for _ in &deleted {
            self.stats.record_delete();
        }
        debug!(prefix, count = deleted.len(), "Deleted objects under prefix");
        Ok(deleted.len())
    }

    async fn begin_segmented_write(&self, key: &str) -> Result<UploadId> {
        let key = key.trim_matches('/').to_string();
        let multipart_id = match &self.multipart {
            Some(multipart) => Some(
                multipart
                    .create_multipart(&self.key_to_path(&key))
                    .await
                    .map_err(|e| self.convert_error("create_multipart", &key, e))?,
            ),
            None => None,
        };
        let upload = UploadId {
            key,
            upload_id: uuid::Uuid::new_v4().simple().to_string(),
            multipart_id,
        };
        debug!(key = %upload.key, upload_id = %upload.upload_id, "Opened segmented write");
        Ok(upload)
    }

    async fn put_segment(
        &self,
        upload: &UploadId,
        index: u32,
        data: Bytes,
    ) -> Result<SegmentToken> {
        let size = data.len() as u64;
        let part = match self.multipart_for(upload)? {
            Some((multipart, id)) => {
                let path = self.key_to_path(&upload.key);
                let part = multipart
                    .put_part(&path, id, index as usize, PutPayload::from(data))
                    .await
                    .map_err(|e| self.convert_error("put_part", &upload.key, e))?;
                self.stats.record_write(size as usize);
                Some(part.content_id)
            }
            None => {
                self.put(&upload.segment_key(index), data).await?;
                None
            }
        };
        Ok(SegmentToken { index, size, part })
    }

    async fn complete_segmented_write(
        &self,
        upload: &UploadId,
        tokens: &[SegmentToken],
    ) -> Result<u64> {
        for (position, token) in tokens.iter().enumerate() {
            if token.index as usize != position {
                return Err(CommonError::segment_error(format!(
                    "{}: expected segment {} at position {}, got {}",
                    upload.key, position, position, token.index
                )));
            }
        }

        let total = match self.multipart_for(upload)? {
            Some((multipart, id)) => self.complete_parts(multipart, id, upload, tokens).await?,
            None => self.copy_segments(upload, tokens).await?,
        };

        if let Err(e) = self.delete_prefix(&upload.segment_dir()).await {
            warn!(key = %upload.key, error = %e, "Failed to remove uploaded segments");
        }
        debug!(key = %upload.key, segments = tokens.len(), bytes = total, "Completed segmented write");
        Ok(total)
    }

    async fn abort_segmented_write(&self, upload: &UploadId) -> Result<()> {
        if let Some((multipart, id)) = self.multipart_for(upload)? {
            let path = self.key_to_path(&upload.key);
            multipart
                .abort_multipart(&path, id)
                .await
                .map_err(|e| self.convert_error("abort_multipart", &upload.key, e))?;
        }
        let removed = self.delete_prefix(&upload.segment_dir()).await?;
        debug!(key = %upload.key, removed, "Aborted segmented write");
        Ok(())
    }

    fn stats(&self) -> StorageStats {
        self.stats.get_stats()
    }
}

/// Abandon a partially written object, logging when the store refuses.
async fn abort_writer(writer: WriteMultipart, key: &str) {
    if let Err(e) = writer.abort().await {
        warn!(key, error = %e, "Failed to abort multipart upload");
    }
}
