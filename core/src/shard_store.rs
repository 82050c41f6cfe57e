//! Object naming and typed access to everything a sort job stores.
//!
//! Every key a job touches is derived from its [`JobLayout`]:
//!
//! ```text
//! <intermediate>/<job>/shards/r<reduce:06>/m<map:06>   intermediate shard
//! <intermediate>/<job>/manifests/m<map:06>.json        map completion manifest
//! <output>/part-<reduce:05>                            whole-object output
//! <output>/<output_name>                               segmented output
//! <logs>/<job>.json                                    job summary
//! ```
//!
//! Map and reduce ids are zero-padded so lexicographic listing order equals
//! numeric order.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

use terasort_common::{SegmentToken, Storage, UploadId};

use crate::codec::ShardCodec;
use crate::error::{SortError, SortResult};
use crate::types::{Batch, JobId};

fn join(prefix: &str, rest: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        rest.to_string()
    } else {
        format!("{}/{}", prefix, rest)
    }
}

/// Prefixes and names of one job's objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLayout {
    pub job_id: JobId,
    pub intermediate_prefix: String,
    pub output_prefix: String,
    pub output_name: String,
    pub log_prefix: String,
}

impl JobLayout {
    /// Root of every intermediate object of this job.
    pub fn job_prefix(&self) -> String {
        join(&self.intermediate_prefix, self.job_id.as_str())
    }

    pub fn shard_key(&self, map_id: u32, reduce_id: u32) -> String {
        format!(
            "{}/shards/r{:06}/m{:06}",
            self.job_prefix(),
            reduce_id,
            map_id
        )
    }

    pub fn manifests_prefix(&self) -> String {
        format!("{}/manifests", self.job_prefix())
    }

    pub fn manifest_key(&self, map_id: u32) -> String {
        format!("{}/m{:06}.json", self.manifests_prefix(), map_id)
    }

    /// Map id encoded in a manifest key, if it is one.
    pub fn parse_manifest_key(&self, key: &str) -> Option<u32> {
        key.strip_prefix(&self.manifests_prefix())?
            .strip_prefix("/m")?
            .strip_suffix(".json")?
            .parse()
            .ok()
    }

    pub fn output_part_key(&self, reduce_id: u32) -> String {
        join(&self.output_prefix, &format!("part-{:05}", reduce_id))
    }

    /// Whether `key` names a whole-output part under the output prefix.
    pub fn is_output_part(&self, key: &str) -> bool {
        let prefix = join(&self.output_prefix, "part-");
        key.strip_prefix(&prefix)
            .is_some_and(|id| !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()))
    }

    pub fn segmented_output_key(&self) -> String {
        join(&self.output_prefix, &self.output_name)
    }

    pub fn summary_key(&self) -> String {
        join(&self.log_prefix, &format!("{}.json", self.job_id))
    }
}

/// Completion record a map task writes after all of its shards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapManifest {
    pub map_id: u32,
    /// Rows written for each reduce id.
    pub shard_rows: Vec<u64>,
    /// Encoded bytes written for each reduce id.
    pub shard_bytes: Vec<u64>,
}

/// Object store requests issued through one [`ShardStore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCounts {
    pub reads: u64,
    pub writes: u64,
    pub lists: u64,
    pub deletes: u64,
}

impl RequestCounts {
    pub fn total(&self) -> u64 {
        self.reads + self.writes + self.lists + self.deletes
    }
}

impl std::ops::Add for RequestCounts {
    type Output = RequestCounts;

    fn add(self, other: RequestCounts) -> RequestCounts {
        RequestCounts {
            reads: self.reads + other.reads,
            writes: self.writes + other.writes,
            lists: self.lists + other.lists,
            deletes: self.deletes + other.deletes,
        }
    }
}

#[derive(Debug, Default)]
struct RequestCounter {
    reads: AtomicU64,
    writes: AtomicU64,
    lists: AtomicU64,
    deletes: AtomicU64,
}

impl RequestCounter {
    fn snapshot(&self) -> RequestCounts {
        RequestCounts {
            reads: self.reads.load(Ordering::Acquire),
            writes: self.writes.load(Ordering::Acquire),
            lists: self.lists.load(Ordering::Acquire),
            deletes: self.deletes.load(Ordering::Acquire),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Typed access to a job's objects.
///
/// Each task builds its own `ShardStore`, so [`ShardStore::requests`]
/// reports the requests of that task alone.
#[derive(Debug, Clone)]
pub struct ShardStore {
    storage: Arc<dyn Storage>,
    layout: JobLayout,
    codec: ShardCodec,
    counter: Arc<RequestCounter>,
}

impl ShardStore {
    pub fn new(storage: Arc<dyn Storage>, layout: JobLayout, codec: ShardCodec) -> Self {
        Self {
            storage,
            layout,
            codec,
            counter: Arc::new(RequestCounter::default()),
        }
    }

    pub fn layout(&self) -> &JobLayout {
        &self.layout
    }

    pub fn codec(&self) -> &ShardCodec {
        &self.codec
    }

    pub fn requests(&self) -> RequestCounts {
        self.counter.snapshot()
    }

    /// Size of an input object, `None` if it does not exist.
    pub async fn input_size(&self, key: &str) -> SortResult<Option<u64>> {
        bump(&self.counter.reads);
        self.storage
            .head(key)
            .await
            .map_err(|e| SortError::store(format!("head {}", key), e))
    }

    /// Read `range` of an input object.
    pub async fn read_input(&self, key: &str, range: Range<u64>) -> SortResult<Bytes> {
        if range.is_empty() {
            return Ok(Bytes::new());
        }
        bump(&self.counter.reads);
        self.storage
            .get_range(key, range.clone())
            .await
            .map_err(|e| SortError::store(format!("read {} {:?}", key, range), e))
    }

    /// Write one encoded shard. Rewriting a shard replaces it.
    pub async fn write_shard(&self, map_id: u32, reduce_id: u32, data: Bytes) -> SortResult<()> {
        let key = self.layout.shard_key(map_id, reduce_id);
        bump(&self.counter.writes);
        self.storage
            .put(&key, data)
            .await
            .map_err(|e| SortError::store(format!("write shard {}", key), e))
    }

    /// Read and decode one shard. A shard that was never written is empty.
    pub async fn read_shard(&self, map_id: u32, reduce_id: u32) -> SortResult<Batch> {
        let key = self.layout.shard_key(map_id, reduce_id);
        bump(&self.counter.reads);
        let data = self
            .storage
            .get(&key)
            .await
            .map_err(|e| SortError::store(format!("read shard {}", key), e))?;
        match data {
            Some(data) => self.codec.decode(&data).map_err(|e| match e {
                SortError::CorruptShard { reason, .. } => SortError::CorruptShard {
                    location: key.clone(),
                    reason,
                },
                other => other,
            }),
            None => Ok(Batch::empty()),
        }
    }

    pub async fn write_manifest(&self, manifest: &MapManifest) -> SortResult<()> {
        let key = self.layout.manifest_key(manifest.map_id);
        let body = serde_json::to_vec(manifest)?;
        bump(&self.counter.writes);
        self.storage
            .put(&key, Bytes::from(body))
            .await
            .map_err(|e| SortError::store(format!("write manifest {}", key), e))
    }

    /// Ids of the map tasks whose manifest exists, ascending.
    pub async fn list_completed_maps(&self) -> SortResult<Vec<u32>> {
        let prefix = self.layout.manifests_prefix();
        bump(&self.counter.lists);
        let keys = self
            .storage
            .list(&prefix)
            .await
            .map_err(|e| SortError::store(format!("list {}", prefix), e))?;
        let mut ids: Vec<u32> = keys
            .iter()
            .filter_map(|key| self.layout.parse_manifest_key(key))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    pub async fn read_manifest(&self, map_id: u32) -> SortResult<Option<MapManifest>> {
        let key = self.layout.manifest_key(map_id);
        bump(&self.counter.reads);
        let data = self
            .storage
            .get(&key)
            .await
            .map_err(|e| SortError::store(format!("read manifest {}", key), e))?;
        data.map(|body| serde_json::from_slice(&body).map_err(SortError::from))
            .transpose()
    }

    /// Write the whole output object of one reduce task, returning its key.
    pub async fn write_output(&self, reduce_id: u32, data: Bytes) -> SortResult<String> {
        let key = self.layout.output_part_key(reduce_id);
        bump(&self.counter.writes);
        self.storage
            .put(&key, data)
            .await
            .map_err(|e| SortError::store(format!("write output {}", key), e))?;
        Ok(key)
    }

    /// Whole-output parts already under the output prefix, from any job.
    pub async fn existing_output_parts(&self) -> SortResult<Vec<String>> {
        let prefix = self.layout.output_prefix.trim_matches('/').to_string();
        bump(&self.counter.lists);
        let keys = self
            .storage
            .list(&prefix)
            .await
            .map_err(|e| SortError::store(format!("list {}", prefix), e))?;
        Ok(keys
            .into_iter()
            .filter(|key| self.layout.is_output_part(key))
            .collect())
    }

    pub async fn begin_segmented_output(&self) -> SortResult<UploadId> {
        let key = self.layout.segmented_output_key();
        let upload = self
            .storage
            .begin_segmented_write(&key)
            .await
            .map_err(|e| SortError::store(format!("begin segmented write {}", key), e))?;
        info!(key = %upload.key, upload_id = %upload.upload_id, "Opened segmented output");
        Ok(upload)
    }

    /// Upload the output of reduce task `reduce_id` as segment `reduce_id`.
    pub async fn put_output_segment(
        &self,
        upload: &UploadId,
        reduce_id: u32,
        data: Bytes,
    ) -> SortResult<SegmentToken> {
        bump(&self.counter.writes);
        self.storage
            .put_segment(upload, reduce_id, data)
            .await
            .map_err(|e| SortError::store(format!("put segment {} of {}", reduce_id, upload.key), e))
    }

    /// Assemble the segmented output. `tokens` must be in reduce-id order.
    pub async fn complete_segmented_output(
        &self,
        upload: &UploadId,
        tokens: &[SegmentToken],
    ) -> SortResult<u64> {
        bump(&self.counter.writes);
        let size = self
            .storage
            .complete_segmented_write(upload, tokens)
            .await
            .map_err(|e| SortError::store(format!("complete segmented write {}", upload.key), e))?;
        info!(key = %upload.key, segments = tokens.len(), bytes = size, "Completed segmented output");
        Ok(size)
    }

    pub async fn abort_segmented_output(&self, upload: &UploadId) -> SortResult<()> {
        bump(&self.counter.deletes);
        self.storage
            .abort_segmented_write(upload)
            .await
            .map_err(|e| SortError::store(format!("abort segmented write {}", upload.key), e))
    }

    /// Delete every intermediate object of the job.
    pub async fn cleanup_job(&self) -> SortResult<usize> {
        let prefix = self.layout.job_prefix();
        bump(&self.counter.lists);
        let removed = self
            .storage
            .delete_prefix(&prefix)
            .await
            .map_err(|e| SortError::store(format!("delete {}", prefix), e))?;
        self.counter
            .deletes
            .fetch_add(removed as u64, Ordering::Relaxed);
        debug!(prefix = %prefix, removed, "Removed intermediates");
        Ok(removed)
    }

    /// Persist `summary` as pretty JSON under the job's summary key.
    pub async fn persist_summary<T: Serialize>(&self, summary: &T) -> SortResult<String> {
        let key = self.layout.summary_key();
        let body = serde_json::to_vec_pretty(summary)?;
        bump(&self.counter.writes);
        self.storage
            .put(&key, Bytes::from(body))
            .await
            .map_err(|e| SortError::store(format!("write summary {}", key), e))?;
        Ok(key)
    }
}
