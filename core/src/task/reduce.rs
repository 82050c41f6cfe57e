//! Reduce task: gather one partition from every mapper, sort it, write it.

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt, stream};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use terasort_common::{CompressionAlgorithm, SegmentToken, Storage, UploadId};

use crate::codec::ShardCodec;
use crate::error::{SortError, SortResult};
use crate::executor::{Task, WorkerContext};
use crate::shard_store::{JobLayout, MapManifest, RequestCounts, ShardStore};
use crate::task::{PhaseTiming, PhaseTracker};
use crate::types::{RecordFormat, Row, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceState {
    Pending,
    FetchingShards,
    Merging,
    Sorting,
    WritingOutput,
    Done,
    Failed,
}

impl fmt::Display for ReduceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReduceState::Pending => "pending",
            ReduceState::FetchingShards => "fetching_shards",
            ReduceState::Merging => "merging",
            ReduceState::Sorting => "sorting",
            ReduceState::WritingOutput => "writing_output",
            ReduceState::Done => "done",
            ReduceState::Failed => "failed",
        })
    }
}

/// Where a reduce task puts its sorted run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum OutputTarget {
    /// One object per reduce task.
    Whole,
    /// Segment `reduce_id` of a single output object.
    Segment { upload: UploadId },
}

/// Descriptor of one reduce task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReduceTask {
    pub reduce_id: u32,
    pub num_mappers: u32,
    pub format: RecordFormat,
    pub compression: CompressionAlgorithm,
    pub layout: JobLayout,
    pub output: OutputTarget,
    /// Shard fetches kept in flight at once.
    pub io_concurrency: usize,
    pub manifest_poll_interval_ms: u64,
    /// How long to wait for every map manifest before giving up.
    pub map_wait_timeout_ms: u64,
}

/// What a reduce task reports back to the driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReduceResult {
    pub reduce_id: u32,
    pub rows_out: u64,
    pub bytes_out: u64,
    pub shards_read: u32,
    /// Key written in whole-object mode.
    pub output_key: Option<String>,
    /// Receipt of the uploaded segment in segmented mode.
    pub segment: Option<SegmentToken>,
    /// Polls of the manifest listing before every map had finished.
    pub manifest_polls: u32,
    pub requests: RequestCounts,
    pub phases: Vec<PhaseTiming>,
}

impl ReduceTask {
    pub async fn execute(&self, storage: Arc<dyn Storage>) -> SortResult<ReduceResult> {
        let codec = ShardCodec::new(self.compression)?;
        let store = ShardStore::new(storage, self.layout.clone(), codec);
        let mut tracker = PhaseTracker::new(TaskId::reduce(self.reduce_id), ReduceState::Pending);

        match self.run_phases(&store, &mut tracker).await {
            Ok(mut result) => {
                tracker.advance(ReduceState::Done);
                result.requests = store.requests();
                result.phases = tracker.into_timings();
                info!(
                    reduce_id = self.reduce_id,
                    rows_out = result.rows_out,
                    shards_read = result.shards_read,
                    "Reduce task done"
                );
                Ok(result)
            }
            Err(error) => {
                tracker.fail(ReduceState::Failed, &error);
                Err(error)
            }
        }
    }

    /// Poll the manifest listing until every map task has completed.
    async fn await_manifests(&self, store: &ShardStore) -> SortResult<u32> {
        let deadline = Instant::now() + Duration::from_millis(self.map_wait_timeout_ms);
        let mut polls = 0u32;
        loop {
            let done = store.list_completed_maps().await?;
            let complete = done.iter().filter(|&&id| id < self.num_mappers).count();
            if complete == self.num_mappers as usize {
                return Ok(polls);
            }
            if Instant::now() >= deadline {
                let missing = (0..self.num_mappers)
                    .find(|id| done.binary_search(id).is_err())
                    .unwrap_or(0);
                return Err(SortError::MissingMapResult {
                    map_id: missing,
                    reason: format!(
                        "no completion manifest after {} ms ({} of {} maps done)",
                        self.map_wait_timeout_ms, complete, self.num_mappers
                    ),
                });
            }
            polls += 1;
            debug!(
                reduce_id = self.reduce_id,
                complete,
                total = self.num_mappers,
                "Waiting for map manifests"
            );
            tokio::time::sleep(Duration::from_millis(self.manifest_poll_interval_ms)).await;
        }
    }

    async fn load_manifests(&self, store: &ShardStore) -> SortResult<Vec<MapManifest>> {
        stream::iter(0..self.num_mappers)
            .map(|map_id| async move {
                let manifest = store.read_manifest(map_id).await?.ok_or_else(|| {
                    SortError::MissingMapResult {
                        map_id,
                        reason: "manifest disappeared after listing".to_string(),
                    }
                })?;
                if manifest.map_id != map_id || manifest.shard_rows.len() <= self.reduce_id as usize
                {
                    return Err(SortError::CorruptShard {
                        location: store.layout().manifest_key(map_id),
                        reason: format!(
                            "manifest of map {} covers {} reducers",
                            manifest.map_id,
                            manifest.shard_rows.len()
                        ),
                    });
                }
                Ok(manifest)
            })
            .buffered(self.io_concurrency.max(1))
            .try_collect()
            .await
    }

    async fn run_phases(
        &self,
        store: &ShardStore,
        tracker: &mut PhaseTracker<ReduceState>,
    ) -> SortResult<ReduceResult> {
        let reduce_id = self.reduce_id;

        tracker.advance(ReduceState::FetchingShards);
        let manifest_polls = self.await_manifests(store).await?;
        let manifests = self.load_manifests(store).await?;
        let wanted: Vec<(u32, u64)> = manifests
            .iter()
            .map(|m| (m.map_id, m.shard_rows[reduce_id as usize]))
            .filter(|&(_, rows)| rows > 0)
            .collect();
        let shards_read = wanted.len() as u32;

        // Each shard's raw bytes are dropped as soon as it is decoded; only
        // rows are kept, one slot per mapper.
        let mut slots: Vec<Vec<Row>> = vec![Vec::new(); self.num_mappers as usize];
        let mut fetches = stream::iter(wanted)
            .map(|(map_id, expected)| async move {
                let batch = store.read_shard(map_id, reduce_id).await?;
                if batch.len() as u64 != expected {
                    return Err(SortError::CorruptShard {
                        location: store.layout().shard_key(map_id, reduce_id),
                        reason: format!(
                            "manifest records {} rows, shard holds {}",
                            expected,
                            batch.len()
                        ),
                    });
                }
                Ok((map_id, batch))
            })
            .buffer_unordered(self.io_concurrency.max(1));
        while let Some(fetched) = fetches.next().await {
            let (map_id, batch) = fetched?;
            slots[map_id as usize] = batch.into_rows();
        }
        drop(fetches);

        tracker.advance(ReduceState::Merging);
        let total: usize = slots.iter().map(Vec::len).sum();
        let mut rows = Vec::with_capacity(total);
        for slot in slots {
            rows.extend(slot);
        }

        tracker.advance(ReduceState::Sorting);
        // Stable: equal keys keep (map id, position in shard) order.
        let rows = tokio::task::spawn_blocking(move || {
            let mut rows = rows;
            rows.par_sort_by(|a, b| a.key.cmp(&b.key));
            rows
        })
        .await
        .map_err(|e| SortError::TaskPanicked {
            task_id: TaskId::reduce(reduce_id),
            message: e.to_string(),
        })?;

        tracker.advance(ReduceState::WritingOutput);
        let rows_out = rows.len() as u64;
        let data = self.format.serialize(&rows)?;
        drop(rows);
        let bytes_out = data.len() as u64;

        let (output_key, segment) = match &self.output {
            OutputTarget::Whole => {
                let key = store.write_output(reduce_id, data.into()).await?;
                (Some(key), None)
            }
            OutputTarget::Segment { upload } => {
                let token = store
                    .put_output_segment(upload, reduce_id, data.into())
                    .await?;
                (None, Some(token))
            }
        };

        Ok(ReduceResult {
            reduce_id,
            rows_out,
            bytes_out,
            shards_read,
            output_key,
            segment,
            manifest_polls,
            requests: RequestCounts::default(),
            phases: Vec::new(),
        })
    }
}

#[async_trait]
impl Task for ReduceTask {
    type Output = ReduceResult;

    fn task_id(&self) -> TaskId {
        TaskId::reduce(self.reduce_id)
    }

    async fn run(&self, ctx: &WorkerContext) -> SortResult<ReduceResult> {
        self.execute(ctx.storage.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use terasort_common::StorageBuilder;

    use crate::types::{Batch, JobId};

    fn layout() -> JobLayout {
        JobLayout {
            job_id: JobId::from("job"),
            intermediate_prefix: "tmp".to_string(),
            output_prefix: "out".to_string(),
            output_name: "sorted".to_string(),
            log_prefix: "logs".to_string(),
        }
    }

    fn task(reduce_id: u32, num_mappers: u32) -> ReduceTask {
        ReduceTask {
            reduce_id,
            num_mappers,
            format: RecordFormat {
                key_len: 1,
                record_len: 2,
            },
            compression: CompressionAlgorithm::Lz4,
            layout: layout(),
            output: OutputTarget::Whole,
            io_concurrency: 2,
            manifest_poll_interval_ms: 5,
            map_wait_timeout_ms: 200,
        }
    }

    async fn setup() -> (Arc<dyn Storage>, ShardStore) {
        let storage = StorageBuilder::new().build().await.unwrap();
        let store = ShardStore::new(
            storage.clone(),
            layout(),
            ShardCodec::new(CompressionAlgorithm::Lz4).unwrap(),
        );
        (storage, store)
    }

    /// Write `rows` as map `map_id`'s shard for reducer 0 of 1.
    async fn write_map_output(store: &ShardStore, map_id: u32, rows: &[(&str, &str)]) {
        let batch: Batch = rows
            .iter()
            .map(|(k, v)| Row::new(k.as_bytes(), v.as_bytes()))
            .collect();
        if !batch.is_empty() {
            let data = store.codec().encode(&batch).unwrap();
            store.write_shard(map_id, 0, data).await.unwrap();
        }
        store
            .write_manifest(&MapManifest {
                map_id,
                shard_rows: vec![batch.len() as u64],
                shard_bytes: vec![0],
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_merges_sorts_and_writes_whole_output() {
        let (storage, store) = setup().await;
        write_map_output(&store, 0, &[("3", "c"), ("1", "a")]).await;
        write_map_output(&store, 1, &[("2", "b"), ("0", "z")]).await;

        let result = task(0, 2).execute(storage.clone()).await.unwrap();
        assert_eq!(result.rows_out, 4);
        assert_eq!(result.shards_read, 2);
        assert_eq!(result.output_key.as_deref(), Some("out/part-00000"));
        assert_eq!(
            storage.get("out/part-00000").await.unwrap(),
            Some(Bytes::from_static(b"0z1a2b3c"))
        );
    }

    #[tokio::test]
    async fn test_empty_contribution_from_one_mapper() {
        let (storage, store) = setup().await;
        write_map_output(&store, 0, &[("5", "e"), ("4", "d")]).await;
        write_map_output(&store, 1, &[]).await;

        let result = task(0, 2).execute(storage.clone()).await.unwrap();
        assert_eq!(result.rows_out, 2);
        assert_eq!(result.shards_read, 1);
        assert_eq!(result.requests.reads, 3);
        assert_eq!(
            storage.get("out/part-00000").await.unwrap(),
            Some(Bytes::from_static(b"4d5e"))
        );
    }

    #[tokio::test]
    async fn test_equal_keys_keep_map_then_shard_order() {
        let (storage, store) = setup().await;
        write_map_output(&store, 1, &[("k", "3"), ("a", "0"), ("k", "4")]).await;
        write_map_output(&store, 0, &[("k", "1"), ("k", "2")]).await;

        task(0, 2).execute(storage.clone()).await.unwrap();
        assert_eq!(
            storage.get("out/part-00000").await.unwrap(),
            Some(Bytes::from_static(b"a0k1k2k3k4"))
        );
    }

    #[tokio::test]
    async fn test_waits_for_late_manifests() {
        let (storage, store) = setup().await;
        write_map_output(&store, 0, &[("2", "b")]).await;

        let late = store.clone();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            write_map_output(&late, 1, &[("1", "a")]).await;
        });

        let result = task(0, 2).execute(storage.clone()).await.unwrap();
        writer.await.unwrap();
        assert_eq!(result.rows_out, 2);
        assert!(result.manifest_polls >= 1);
        assert_eq!(
            storage.get("out/part-00000").await.unwrap(),
            Some(Bytes::from_static(b"1a2b"))
        );
    }

    #[tokio::test]
    async fn test_missing_map_times_out() {
        let (storage, store) = setup().await;
        write_map_output(&store, 0, &[("1", "a")]).await;

        let err = task(0, 2).execute(storage.clone()).await.unwrap_err();
        match err {
            SortError::MissingMapResult { map_id, .. } => assert_eq!(map_id, 1),
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(storage.get("out/part-00000").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_lost_shard_is_corrupt() {
        let (storage, store) = setup().await;
        write_map_output(&store, 0, &[("1", "a")]).await;
        storage.delete(&layout().shard_key(0, 0)).await.unwrap();

        let err = task(0, 1).execute(storage).await.unwrap_err();
        assert_eq!(err.kind(), "CorruptShard");
    }

    #[tokio::test]
    async fn test_segment_output() {
        let (storage, store) = setup().await;
        write_map_output(&store, 0, &[("9", "x"), ("8", "y")]).await;
        let upload = store.begin_segmented_output().await.unwrap();

        let descriptor = ReduceTask {
            output: OutputTarget::Segment {
                upload: upload.clone(),
            },
            ..task(0, 1)
        };
        let result = descriptor.execute(storage.clone()).await.unwrap();
        let token = result.segment.clone().unwrap();
        assert_eq!(token.index, 0);
        assert_eq!(token.size, 4);
        assert!(result.output_key.is_none());

        store
            .complete_segmented_output(&upload, &[token])
            .await
            .unwrap();
        assert_eq!(
            storage.get("out/sorted").await.unwrap(),
            Some(Bytes::from_static(b"8y9x"))
        );
    }
}
