//! Job driver.
//!
//! The driver owns no data: it plans the job, dispatches map and reduce
//! tasks through a [`TaskExecutor`], and finalizes what the tasks left in
//! the store. Two synchronization points order the job:
//!
//! 1. enough map tasks have finished to start dispatching reduce tasks;
//! 2. every map task has finished, which gates finalizing any output.
//!
//! A map failure observed at either point fails the job with
//! [`SortError::MissingMapResult`] and cancels whatever is still pending.

use futures::{StreamExt, TryStreamExt, stream};
use std::sync::Arc;
use tracing::{debug, info, warn};

use terasort_common::{Storage, UploadId};

use crate::codec::ShardCodec;
use crate::config::{OutputMode, SortConfig};
use crate::cost::{CostModel, JobCost, ShuffleEstimate};
use crate::error::{SortError, SortResult};
use crate::executor::{InvocationStats, Task, TaskExecutor};
use crate::report::{
    ExecutionInfo, ExecutionResults, JobEvent, JobReporter, JobSummary, MapRecord, ReduceRecord,
    SortTimes, TracingReporter,
};
use crate::shard_store::{RequestCounts, ShardStore};
use crate::shuffle::{PartitionPlan, PartitionScheme};
use crate::task::{MapResult, MapTask, OutputTarget, ReduceResult, ReduceTask};
use crate::types::{InputSplit, JobId, unix_seconds};

/// Outputs of both phases, each in submission order.
pub struct PhaseResults<M, R> {
    pub maps: Vec<(M, InvocationStats)>,
    pub reduces: Vec<(R, InvocationStats)>,
}

fn missing_map(error: SortError) -> SortError {
    match error.task_id() {
        Some(task_id) => SortError::MissingMapResult {
            map_id: task_id.index,
            reason: error.chain(),
        },
        None => error,
    }
}

/// Run `maps`, then `reduces`, through the two job barriers.
///
/// Reduce tasks are submitted once `dispatch_threshold` map tasks have
/// succeeded. Results are only returned after every map task has succeeded
/// and then every reduce task has.
pub async fn execute_phases<E, M, R>(
    executor: &E,
    maps: Vec<M>,
    reduces: Vec<R>,
    dispatch_threshold: usize,
    reporter: &dyn JobReporter,
) -> SortResult<PhaseResults<M::Output, R::Output>>
where
    E: TaskExecutor + ?Sized,
    M: Task,
    R: Task,
{
    let map_count = maps.len();
    let reduce_count = reduces.len();
    let required = dispatch_threshold.clamp(1, map_count.max(1)).min(map_count);

    let mut map_set = executor.submit(maps);
    reporter.report(&JobEvent::MapsDispatched { count: map_count });

    let completed = match map_set.wait_for(required).await {
        Ok(completed) => completed,
        Err(error) => {
            map_set.abort();
            return Err(missing_map(error));
        }
    };
    reporter.report(&JobEvent::ReduceDispatchReady {
        completed,
        required,
    });

    let mut reduce_set = executor.submit(reduces);
    reporter.report(&JobEvent::ReducesDispatched {
        count: reduce_count,
    });

    if let Err(error) = map_set.wait_all().await {
        map_set.abort();
        reduce_set.abort();
        return Err(missing_map(error));
    }
    reporter.report(&JobEvent::MapsCompleted { count: map_count });

    if let Err(error) = reduce_set.wait_all().await {
        reduce_set.abort();
        return Err(error);
    }
    reporter.report(&JobEvent::ReducesCompleted {
        count: reduce_count,
    });

    Ok(PhaseResults {
        maps: map_set.into_results()?,
        reduces: reduce_set.into_results()?,
    })
}

/// Plans, runs and finalizes sort jobs.
pub struct Driver<E: TaskExecutor> {
    executor: E,
    storage: Arc<dyn Storage>,
    config: SortConfig,
    reporter: Arc<dyn JobReporter>,
    cost_model: CostModel,
}

impl<E: TaskExecutor> Driver<E> {
    pub fn new(executor: E, storage: Arc<dyn Storage>, config: SortConfig) -> Self {
        let cost_model = CostModel::new(config.billing);
        Self {
            executor,
            storage,
            config,
            reporter: Arc::new(TracingReporter),
            cost_model,
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn JobReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn config(&self) -> &SortConfig {
        &self.config
    }

    /// Run one job under a fresh job id.
    pub async fn run(&self) -> SortResult<JobSummary> {
        self.run_job(JobId::generate()).await
    }

    /// Run one job under `job_id`. Intermediates are left in place when the
    /// job fails.
    pub async fn run_job(&self, job_id: JobId) -> SortResult<JobSummary> {
        self.config.validate()?;
        let codec = ShardCodec::new(self.config.compression)?;
        let store = ShardStore::new(
            self.storage.clone(),
            self.config.layout(job_id.clone()),
            codec,
        );

        match self.drive(&job_id, &store).await {
            Ok(summary) => Ok(summary),
            Err(error) => {
                self.reporter.report(&JobEvent::JobFailed {
                    job_id,
                    kind: error.kind().to_string(),
                    message: error.chain(),
                });
                Err(error)
            }
        }
    }

    async fn input_splits(&self, store: &ShardStore) -> SortResult<(u64, Vec<InputSplit>)> {
        let key = &self.config.input_key;
        let size = store.input_size(key).await?.ok_or_else(|| {
            SortError::InvalidInput(format!("input object {} does not exist", key))
        })?;
        let splits = InputSplit::compute(size, &self.config.record_format, self.config.map_tasks)?;
        Ok((size, splits))
    }

    /// Keys from the head of every split.
    async fn sample_keys(
        &self,
        store: &ShardStore,
        splits: &[InputSplit],
        per_split: usize,
    ) -> SortResult<Vec<Vec<u8>>> {
        let format = self.config.record_format;
        let record_len = format.record_len as u64;
        let samples: Vec<Vec<Vec<u8>>> = stream::iter(splits.iter().copied())
            .map(|split| async move {
                let records = (split.len() / record_len).min(per_split as u64);
                let end = split.start + records * record_len;
                let data = store
                    .read_input(&self.config.input_key, split.start..end)
                    .await?;
                let keys: Vec<Vec<u8>> = format
                    .parse(&data)?
                    .into_rows()
                    .into_iter()
                    .map(|row| row.key)
                    .collect();
                Ok::<_, SortError>(keys)
            })
            .buffered(self.config.io_concurrency.max(1))
            .try_collect()
            .await?;
        Ok(samples.into_iter().flatten().collect())
    }

    async fn resolve_partitioning(
        &self,
        store: &ShardStore,
        splits: &[InputSplit],
    ) -> SortResult<PartitionPlan> {
        let scheme = &self.config.partitioning;
        let sample = match scheme {
            PartitionScheme::Sampled {
                sample_records_per_split,
            } => self.sample_keys(store, splits, *sample_records_per_split).await?,
            _ => Vec::new(),
        };
        let sampled_keys = sample.len();
        let plan = scheme.resolve(
            self.config.reduce_tasks,
            self.config.record_format.key_len,
            sample,
        )?;
        self.reporter.report(&JobEvent::PartitioningResolved {
            order_preserving: plan.preserves_key_order(),
            num_partitions: plan.num_partitions(),
            sampled_keys,
        });
        Ok(plan)
    }

    fn map_tasks(
        &self,
        splits: Vec<InputSplit>,
        plan: &PartitionPlan,
        store: &ShardStore,
    ) -> Vec<MapTask> {
        splits
            .into_iter()
            .map(|split| MapTask {
                split,
                input_key: self.config.input_key.clone(),
                num_reducers: self.config.reduce_tasks,
                format: self.config.record_format,
                partitioning: plan.clone(),
                compression: self.config.compression,
                layout: store.layout().clone(),
                io_concurrency: self.config.io_concurrency,
            })
            .collect()
    }

    fn reduce_tasks(&self, upload: Option<&UploadId>, store: &ShardStore) -> Vec<ReduceTask> {
        (0..self.config.reduce_tasks)
            .map(|reduce_id| ReduceTask {
                reduce_id,
                num_mappers: self.config.map_tasks,
                format: self.config.record_format,
                compression: self.config.compression,
                layout: store.layout().clone(),
                output: match upload {
                    Some(upload) => OutputTarget::Segment {
                        upload: upload.clone(),
                    },
                    None => OutputTarget::Whole,
                },
                io_concurrency: self.config.io_concurrency,
                manifest_poll_interval_ms: self.config.manifest_poll_interval_ms,
                map_wait_timeout_ms: self.config.map_wait_timeout_ms,
            })
            .collect()
    }

    async fn abort_upload(&self, store: &ShardStore, upload: Option<&UploadId>) {
        if let Some(upload) = upload {
            if let Err(error) = store.abort_segmented_output(upload).await {
                warn!(key = %upload.key, error = %error, "Failed to abort segmented output");
            }
        }
    }

    async fn drive(&self, job_id: &JobId, store: &ShardStore) -> SortResult<JobSummary> {
        let start_time = unix_seconds();
        if matches!(self.config.output_mode, OutputMode::Whole) {
            let existing = store.existing_output_parts().await?;
            if let Some(first) = existing.first() {
                return Err(SortError::InvalidConfig(format!(
                    "output prefix {} already holds {} part objects ({}, ...)",
                    self.config.output_prefix,
                    existing.len(),
                    first
                )));
            }
        }
        let (input_bytes, splits) = self.input_splits(store).await?;
        self.reporter.report(&JobEvent::JobStarted {
            job_id: job_id.clone(),
            input_key: self.config.input_key.clone(),
            input_bytes,
            map_tasks: self.config.map_tasks,
            reduce_tasks: self.config.reduce_tasks,
        });

        let plan = self.resolve_partitioning(store, &splits).await?;
        let estimate = ShuffleEstimate::for_job(
            &self.cost_model,
            self.config.map_tasks,
            self.config.reduce_tasks,
        );
        self.reporter.report(&JobEvent::ShuffleEstimated(estimate));

        let upload = match self.config.output_mode {
            OutputMode::Segmented => Some(store.begin_segmented_output().await?),
            OutputMode::Whole => None,
        };

        let maps = self.map_tasks(splits, &plan, store);
        let reduces = self.reduce_tasks(upload.as_ref(), store);
        let phases = match execute_phases(
            &self.executor,
            maps,
            reduces,
            self.config.map_barrier_count(),
            self.reporter.as_ref(),
        )
        .await
        {
            Ok(phases) => phases,
            Err(error) => {
                self.abort_upload(store, upload.as_ref()).await;
                return Err(error);
            }
        };

        let mut results = match self.finalize(store, upload.as_ref(), &phases).await {
            Ok(results) => results,
            Err(error) => {
                self.abort_upload(store, upload.as_ref()).await;
                return Err(error);
            }
        };
        self.reporter.report(&JobEvent::OutputFinalized {
            keys: results.output_keys.clone(),
        });
        let end_time = unix_seconds();
        results.requests = results.requests + store.requests();

        let summary = self.summarize(
            job_id,
            input_bytes,
            &plan,
            phases,
            results,
            SortTimes {
                start_time,
                end_time,
            },
        );
        let summary_key = store.persist_summary(&summary).await?;
        self.reporter
            .report(&JobEvent::SummaryPersisted { key: summary_key });

        if !self.config.keep_intermediates {
            match store.cleanup_job().await {
                Ok(objects) => self
                    .reporter
                    .report(&JobEvent::IntermediatesCleaned { objects }),
                Err(error) => {
                    warn!(job_id = %job_id, error = %error, "Failed to delete intermediates")
                }
            }
        }

        let client = self.storage.stats();
        debug!(
            reads = client.read_count,
            writes = client.write_count,
            errors = client.error_count,
            bytes_read = client.bytes_read,
            bytes_written = client.bytes_written,
            "Store client counters"
        );

        self.reporter.report(&JobEvent::JobFinished {
            job_id: job_id.clone(),
            rows: summary.execution_results.rows_out,
            elapsed_seconds: summary.sort.elapsed(),
        });
        Ok(summary)
    }

    /// Check row conservation, then publish the output.
    async fn finalize(
        &self,
        store: &ShardStore,
        upload: Option<&UploadId>,
        phases: &PhaseResults<MapResult, ReduceResult>,
    ) -> SortResult<ExecutionResults> {
        let rows_in: u64 = phases.maps.iter().map(|(m, _)| m.rows_in).sum();
        let rows_out: u64 = phases.reduces.iter().map(|(r, _)| r.rows_out).sum();
        if rows_in != rows_out {
            return Err(SortError::RowCountMismatch {
                expected: rows_in,
                actual: rows_out,
            });
        }

        let output_keys = match upload {
            Some(upload) => {
                let mut reduces: Vec<&ReduceResult> =
                    phases.reduces.iter().map(|(r, _)| r).collect();
                reduces.sort_by_key(|r| r.reduce_id);
                let tokens = reduces
                    .iter()
                    .map(|r| {
                        r.segment.clone().ok_or_else(|| {
                            SortError::InvalidInput(format!(
                                "reduce task {} returned no output segment",
                                r.reduce_id
                            ))
                        })
                    })
                    .collect::<SortResult<Vec<_>>>()?;
                store.complete_segmented_output(upload, &tokens).await?;
                vec![upload.key.clone()]
            }
            None => phases
                .reduces
                .iter()
                .filter_map(|(r, _)| r.output_key.clone())
                .collect(),
        };
        debug!(outputs = output_keys.len(), rows = rows_out, "Output finalized");

        let task_requests = phases
            .maps
            .iter()
            .map(|(m, _)| m.requests)
            .chain(phases.reduces.iter().map(|(r, _)| r.requests))
            .fold(RequestCounts::default(), |acc, r| acc + r);

        Ok(ExecutionResults {
            rows_in,
            rows_out,
            bytes_in: phases.maps.iter().map(|(m, _)| m.bytes_in).sum(),
            bytes_out: phases.reduces.iter().map(|(r, _)| r.bytes_out).sum(),
            shards_written: phases
                .maps
                .iter()
                .map(|(m, _)| m.shards_written as u64)
                .sum(),
            output_keys,
            requests: task_requests,
        })
    }

    fn summarize(
        &self,
        job_id: &JobId,
        input_bytes: u64,
        plan: &PartitionPlan,
        phases: PhaseResults<MapResult, ReduceResult>,
        results: ExecutionResults,
        sort: SortTimes,
    ) -> JobSummary {
        let map_stats: Vec<InvocationStats> =
            phases.maps.iter().map(|(_, s)| s.clone()).collect();
        let reduce_stats: Vec<InvocationStats> =
            phases.reduces.iter().map(|(_, s)| s.clone()).collect();
        let cost = JobCost::compute(&self.cost_model, &map_stats, &reduce_stats);
        info!(
            %job_id,
            total_cost = cost.total_cost,
            shuffle_cost = cost.shuffle_cost,
            "Job cost computed"
        );

        JobSummary {
            execution_info: ExecutionInfo {
                job_id: job_id.clone(),
                input_key: self.config.input_key.clone(),
                input_bytes,
                map_tasks: self.config.map_tasks,
                reduce_tasks: self.config.reduce_tasks,
                record_format: self.config.record_format,
                range_bounds: match plan {
                    PartitionPlan::Range { bounds } => bounds.clone(),
                    PartitionPlan::Hash { .. } => Vec::new(),
                },
                order_preserving: plan.preserves_key_order(),
                compression: self.config.compression,
                output_mode: self.config.output_mode,
                map_completion_threshold: self.config.map_completion_threshold,
                runtime_memory_mb: self.config.executor.runtime_memory_mb,
            },
            map_data: phases
                .maps
                .into_iter()
                .map(|(result, stats)| MapRecord { result, stats })
                .collect(),
            red_data: phases
                .reduces
                .into_iter()
                .map(|(result, stats)| ReduceRecord { result, stats })
                .collect(),
            sort,
            cost,
            execution_results: results,
        }
    }
}
