//! Shared helpers for the integration tests

#![allow(dead_code)] // each test binary uses a different subset

use async_trait::async_trait;
use bytes::Bytes;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use terasort_common::{
    CommonError, Result as StoreResult, SegmentToken, Storage, StorageBuilder, StorageStats,
    UploadId,
};
use terasort_core::{
    Driver, ExecutorConfig, LocalExecutor, OutputMode, PartitionScheme, RecordFormat, SortConfig,
};

/// One-byte keys, one-byte values.
pub fn tiny_format() -> RecordFormat {
    RecordFormat {
        key_len: 1,
        record_len: 2,
    }
}

pub async fn memory_storage() -> Arc<dyn Storage> {
    StorageBuilder::new().build().await.unwrap()
}

/// Store `(key, value)` rows as one fixed-width object.
pub async fn put_rows(storage: &dyn Storage, key: &str, rows: &[(&str, &str)]) {
    let mut data = Vec::new();
    for (k, v) in rows {
        data.extend_from_slice(k.as_bytes());
        data.extend_from_slice(v.as_bytes());
    }
    storage.put(key, Bytes::from(data)).await.unwrap();
}

/// Read an object back as `(key, value)` string pairs.
pub async fn read_rows(
    storage: &dyn Storage,
    key: &str,
    format: RecordFormat,
) -> Vec<(String, String)> {
    let data = storage.get(key).await.unwrap().unwrap();
    data.chunks_exact(format.record_len)
        .map(|record| {
            let (k, v) = record.split_at(format.key_len);
            (
                String::from_utf8_lossy(k).into_owned(),
                String::from_utf8_lossy(v).into_owned(),
            )
        })
        .collect()
}

pub fn test_executor_config() -> ExecutorConfig {
    ExecutorConfig {
        max_concurrency: 8,
        max_retries: 2,
        retry_backoff_ms: 5,
        runtime_memory_mb: 256,
    }
}

/// Fast-polling configuration for a small job.
pub fn test_config(input: &str, maps: u32, reduces: u32) -> SortConfig {
    let mut config = SortConfig::new(input)
        .with_tasks(maps, reduces)
        .with_output(OutputMode::Whole, "out")
        .with_map_wait_timeout_ms(5_000)
        .with_executor(test_executor_config());
    config.intermediate_prefix = "tmp".to_string();
    config.log_prefix = "logs".to_string();
    config.manifest_poll_interval_ms = 5;
    config.io_concurrency = 4;
    config
}

pub fn tiny_config(input: &str, maps: u32, reduces: u32, bounds: &[&str]) -> SortConfig {
    test_config(input, maps, reduces)
        .with_record_format(tiny_format())
        .with_partitioning(PartitionScheme::ExplicitRange {
            bounds: bounds.iter().map(|b| b.as_bytes().to_vec()).collect(),
        })
}

pub fn driver(storage: Arc<dyn Storage>, config: SortConfig) -> Driver<LocalExecutor> {
    let executor = LocalExecutor::new(storage.clone(), config.executor.clone());
    Driver::new(executor, storage, config)
}

/// How a [`FaultyStorage`] misbehaves.
#[derive(Debug, Clone)]
pub enum Fault {
    /// Ranged reads starting at `offset` are delayed, then fail
    /// permanently if `fail` is set.
    ReadAt {
        offset: u64,
        delay: Duration,
        fail: bool,
    },
    /// The first `times` writes below this key prefix fail with a
    /// transient error.
    TransientPut { prefix: String, times: u32 },
    /// Uploading segment `index` fails, and so does aborting the write.
    BrokenSegment { index: u32 },
}

/// Storage wrapper injecting failures into an in-memory store.
#[derive(Debug)]
pub struct FaultyStorage {
    inner: Arc<dyn Storage>,
    fault: Fault,
    injected: AtomicU32,
}

impl FaultyStorage {
    pub fn new(inner: Arc<dyn Storage>, fault: Fault) -> Self {
        Self {
            inner,
            fault,
            injected: AtomicU32::new(0),
        }
    }

    pub fn injected(&self) -> u32 {
        self.injected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Storage for FaultyStorage {
    async fn get(&self, key: &str) -> StoreResult<Option<Bytes>> {
        self.inner.get(key).await
    }

    async fn get_range(&self, key: &str, range: Range<u64>) -> StoreResult<Bytes> {
        if let Fault::ReadAt {
            offset,
            delay,
            fail,
        } = &self.fault
        {
            if range.start == *offset {
                tokio::time::sleep(*delay).await;
                self.injected.fetch_add(1, Ordering::SeqCst);
                if *fail {
                    return Err(CommonError::not_found_error(format!("{} lost", key)));
                }
            }
        }
        self.inner.get_range(key, range).await
    }

    async fn head(&self, key: &str) -> StoreResult<Option<u64>> {
        self.inner.head(key).await
    }

    async fn put(&self, key: &str, value: Bytes) -> StoreResult<()> {
        if let Fault::TransientPut { prefix, times } = &self.fault {
            if key.starts_with(prefix.as_str()) {
                let injected = self.injected.fetch_add(1, Ordering::SeqCst);
                if injected < *times {
                    return Err(CommonError::storage_error("503 Slow Down"));
                }
            }
        }
        self.inner.put(key, value).await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.inner.list(prefix).await
    }

    async fn delete_prefix(&self, prefix: &str) -> StoreResult<usize> {
        self.inner.delete_prefix(prefix).await
    }

    async fn begin_segmented_write(&self, key: &str) -> StoreResult<UploadId> {
        self.inner.begin_segmented_write(key).await
    }

    async fn put_segment(
        &self,
        upload: &UploadId,
        index: u32,
        data: Bytes,
    ) -> StoreResult<SegmentToken> {
        if let Fault::BrokenSegment { index: broken } = &self.fault {
            if index == *broken {
                self.injected.fetch_add(1, Ordering::SeqCst);
                return Err(CommonError::storage_error("segment upload reset"));
            }
        }
        self.inner.put_segment(upload, index, data).await
    }

    async fn complete_segmented_write(
        &self,
        upload: &UploadId,
        tokens: &[SegmentToken],
    ) -> StoreResult<u64> {
        self.inner.complete_segmented_write(upload, tokens).await
    }

    async fn abort_segmented_write(&self, upload: &UploadId) -> StoreResult<()> {
        if let Fault::BrokenSegment { .. } = &self.fault {
            self.injected.fetch_add(1, Ordering::SeqCst);
            return Err(CommonError::storage_error("abort refused"));
        }
        self.inner.abort_segmented_write(upload).await
    }

    fn stats(&self) -> StorageStats {
        self.inner.stats()
    }
}
