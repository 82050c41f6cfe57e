//! Map task: read a split, route its rows, write one shard per reducer.

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt, stream};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use terasort_common::{CompressionAlgorithm, Storage};

use crate::codec::ShardCodec;
use crate::error::{SortError, SortResult};
use crate::executor::{Task, WorkerContext};
use crate::shard_store::{JobLayout, MapManifest, RequestCounts, ShardStore};
use crate::shuffle::{PartitionPlan, partition_batch};
use crate::task::{PhaseTiming, PhaseTracker};
use crate::types::{InputSplit, RecordFormat, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapState {
    Pending,
    ReadingInput,
    Partitioning,
    WritingShards,
    Done,
    Failed,
}

impl fmt::Display for MapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MapState::Pending => "pending",
            MapState::ReadingInput => "reading_input",
            MapState::Partitioning => "partitioning",
            MapState::WritingShards => "writing_shards",
            MapState::Done => "done",
            MapState::Failed => "failed",
        })
    }
}

/// Descriptor of one map task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapTask {
    pub split: InputSplit,
    pub input_key: String,
    pub num_reducers: u32,
    pub format: RecordFormat,
    pub partitioning: PartitionPlan,
    pub compression: CompressionAlgorithm,
    pub layout: JobLayout,
    /// Shard uploads kept in flight at once.
    pub io_concurrency: usize,
}

/// What a map task reports back to the driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapResult {
    pub map_id: u32,
    pub rows_in: u64,
    pub bytes_in: u64,
    pub shards_written: u32,
    pub shard_rows: Vec<u64>,
    pub shard_bytes: Vec<u64>,
    pub requests: RequestCounts,
    pub phases: Vec<PhaseTiming>,
}

impl MapTask {
    pub fn map_id(&self) -> u32 {
        self.split.map_id
    }

    /// Run the task against `storage`.
    ///
    /// Re-running with the same descriptor rewrites byte-identical shards
    /// and an identical manifest.
    pub async fn execute(&self, storage: Arc<dyn Storage>) -> SortResult<MapResult> {
        let codec = ShardCodec::new(self.compression)?;
        let store = ShardStore::new(storage, self.layout.clone(), codec);
        let mut tracker = PhaseTracker::new(TaskId::map(self.map_id()), MapState::Pending);

        match self.run_phases(&store, &mut tracker).await {
            Ok(mut result) => {
                tracker.advance(MapState::Done);
                result.requests = store.requests();
                result.phases = tracker.into_timings();
                info!(
                    map_id = result.map_id,
                    rows_in = result.rows_in,
                    shards_written = result.shards_written,
                    "Map task done"
                );
                Ok(result)
            }
            Err(error) => {
                tracker.fail(MapState::Failed, &error);
                Err(error)
            }
        }
    }

    async fn run_phases(
        &self,
        store: &ShardStore,
        tracker: &mut PhaseTracker<MapState>,
    ) -> SortResult<MapResult> {
        let map_id = self.map_id();

        tracker.advance(MapState::ReadingInput);
        let data = store
            .read_input(&self.input_key, self.split.start..self.split.end)
            .await?;
        let bytes_in = data.len() as u64;
        let batch = self.format.parse(&data)?;
        drop(data);
        let rows_in = batch.len() as u64;
        debug!(map_id, rows_in, bytes_in, "Read input split");

        tracker.advance(MapState::Partitioning);
        let partitioner = self.partitioning.build()?;
        if partitioner.num_partitions() != self.num_reducers {
            return Err(SortError::PartitionConfigError(format!(
                "partitioner has {} partitions for {} reduce tasks",
                partitioner.num_partitions(),
                self.num_reducers
            )));
        }
        let codec = store.codec().clone();
        let blobs = tokio::task::spawn_blocking(move || {
            partition_batch(&batch, partitioner.as_ref(), &codec)
        })
        .await
        .map_err(|e| SortError::TaskPanicked {
            task_id: TaskId::map(map_id),
            message: e.to_string(),
        })??;

        let shard_rows: Vec<u64> = blobs.iter().map(|b| b.rows).collect();
        let shard_bytes: Vec<u64> = blobs.iter().map(|b| b.data.len() as u64).collect();
        let routed: u64 = shard_rows.iter().sum();
        if routed != rows_in {
            return Err(SortError::RowCountMismatch {
                expected: rows_in,
                actual: routed,
            });
        }

        tracker.advance(MapState::WritingShards);
        let non_empty: Vec<_> = blobs
            .into_iter()
            .enumerate()
            .filter(|(_, blob)| blob.rows > 0)
            .collect();
        let shards_written = non_empty.len() as u32;
        stream::iter(non_empty)
            .map(|(reduce_id, blob)| store.write_shard(map_id, reduce_id as u32, blob.data))
            .buffer_unordered(self.io_concurrency.max(1))
            .try_collect::<Vec<()>>()
            .await?;

        // The manifest goes last: its presence means every shard is in place.
        store
            .write_manifest(&MapManifest {
                map_id,
                shard_rows: shard_rows.clone(),
                shard_bytes: shard_bytes.clone(),
            })
            .await?;

        Ok(MapResult {
            map_id,
            rows_in,
            bytes_in,
            shards_written,
            shard_rows,
            shard_bytes,
            requests: RequestCounts::default(),
            phases: Vec::new(),
        })
    }
}

#[async_trait]
impl Task for MapTask {
    type Output = MapResult;

    fn task_id(&self) -> TaskId {
        TaskId::map(self.map_id())
    }

    async fn run(&self, ctx: &WorkerContext) -> SortResult<MapResult> {
        self.execute(ctx.storage.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use terasort_common::StorageBuilder;

    use crate::types::{Batch, JobId, Row};

    fn format() -> RecordFormat {
        RecordFormat {
            key_len: 1,
            record_len: 2,
        }
    }

    fn layout() -> JobLayout {
        JobLayout {
            job_id: JobId::from("job"),
            intermediate_prefix: "tmp".to_string(),
            output_prefix: "out".to_string(),
            output_name: "sorted".to_string(),
            log_prefix: "logs".to_string(),
        }
    }

    fn task(split: InputSplit) -> MapTask {
        MapTask {
            split,
            input_key: "input".to_string(),
            num_reducers: 2,
            format: format(),
            partitioning: PartitionPlan::Range {
                bounds: vec![b"2".to_vec()],
            },
            compression: CompressionAlgorithm::Zstd,
            layout: layout(),
            io_concurrency: 4,
        }
    }

    async fn storage_with_input(input: &'static [u8]) -> Arc<dyn Storage> {
        let storage = StorageBuilder::new().build().await.unwrap();
        storage.put("input", Bytes::from_static(input)).await.unwrap();
        storage
    }

    #[tokio::test]
    async fn test_map_routes_rows_and_writes_manifest() {
        let storage = storage_with_input(b"3c1a2b4d").await;
        let result = task(InputSplit {
            map_id: 0,
            start: 0,
            end: 8,
        })
        .execute(storage.clone())
        .await
        .unwrap();

        assert_eq!(result.rows_in, 4);
        assert_eq!(result.bytes_in, 8);
        assert_eq!(result.shard_rows, vec![2, 2]);
        assert_eq!(result.shards_written, 2);
        assert_eq!(result.requests.writes, 3);
        let phases: Vec<&str> = result.phases.iter().map(|p| p.phase.as_str()).collect();
        assert_eq!(
            phases,
            vec!["pending", "reading_input", "partitioning", "writing_shards"]
        );

        let codec = ShardCodec::new(CompressionAlgorithm::Zstd).unwrap();
        let store = ShardStore::new(storage, layout(), codec);
        assert_eq!(
            store.read_shard(0, 0).await.unwrap(),
            Batch::new(vec![Row::new(*b"1", *b"a"), Row::new(*b"2", *b"b")])
        );
        assert_eq!(
            store.read_shard(0, 1).await.unwrap(),
            Batch::new(vec![Row::new(*b"3", *b"c"), Row::new(*b"4", *b"d")])
        );
        assert_eq!(store.list_completed_maps().await.unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn test_empty_shards_are_not_written() {
        let storage = storage_with_input(b"1a2b9z9y").await;
        let result = task(InputSplit {
            map_id: 1,
            start: 0,
            end: 4,
        })
        .execute(storage.clone())
        .await
        .unwrap();

        assert_eq!(result.shard_rows, vec![2, 0]);
        assert_eq!(result.shards_written, 1);
        assert_eq!(result.shard_bytes[1], 0);
        assert_eq!(storage.head(&layout().shard_key(1, 1)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_rerun_writes_identical_shards() {
        let storage = storage_with_input(b"3c1a2b4d5e0f").await;
        let descriptor = task(InputSplit {
            map_id: 0,
            start: 0,
            end: 12,
        });

        descriptor.execute(storage.clone()).await.unwrap();
        let mut first: Vec<Option<Bytes>> = Vec::new();
        for reduce_id in 0..2 {
            first.push(storage.get(&layout().shard_key(0, reduce_id)).await.unwrap());
        }
        let manifest = storage.get(&layout().manifest_key(0)).await.unwrap();

        descriptor.execute(storage.clone()).await.unwrap();
        for (reduce_id, before) in first.into_iter().enumerate() {
            let after = storage
                .get(&layout().shard_key(0, reduce_id as u32))
                .await
                .unwrap();
            assert_eq!(before, after);
            assert!(after.is_some());
        }
        assert_eq!(
            storage.get(&layout().manifest_key(0)).await.unwrap(),
            manifest
        );
    }

    #[tokio::test]
    async fn test_empty_split_still_reports_completion() {
        let storage = storage_with_input(b"1a").await;
        let result = task(InputSplit {
            map_id: 3,
            start: 2,
            end: 2,
        })
        .execute(storage.clone())
        .await
        .unwrap();
        assert_eq!(result.rows_in, 0);
        assert_eq!(result.shards_written, 0);
        assert_eq!(result.requests.reads, 0);
        assert!(storage.head(&layout().manifest_key(3)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_missing_input_fails_the_task() {
        let storage = StorageBuilder::new().build().await.unwrap();
        let err = task(InputSplit {
            map_id: 0,
            start: 0,
            end: 2,
        })
        .execute(storage)
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "StoreUnavailable");
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_descriptor_serializes() {
        let descriptor = task(InputSplit {
            map_id: 2,
            start: 4,
            end: 8,
        });
        let json = serde_json::to_string(&descriptor).unwrap();
        let back: MapTask = serde_json::from_str(&json).unwrap();
        assert_eq!(back, descriptor);
        assert_eq!(back.task_id(), TaskId::map(2));
    }
}
