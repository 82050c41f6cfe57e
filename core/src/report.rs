//! Job events and the persisted job summary.
//!
//! A [`JobReporter`] is handed to the driver for one run and receives every
//! [`JobEvent`] of that run. The [`JobSummary`] is the typed aggregate
//! written to the log prefix once the job has finished.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

use terasort_common::CompressionAlgorithm;

use crate::config::OutputMode;
use crate::cost::{JobCost, ShuffleEstimate};
use crate::executor::InvocationStats;
use crate::shard_store::RequestCounts;
use crate::task::{MapResult, ReduceResult};
use crate::types::{JobId, RecordFormat};

/// Something that happened during one job run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    JobStarted {
        job_id: JobId,
        input_key: String,
        input_bytes: u64,
        map_tasks: u32,
        reduce_tasks: u32,
    },
    PartitioningResolved {
        order_preserving: bool,
        num_partitions: u32,
        sampled_keys: usize,
    },
    ShuffleEstimated(ShuffleEstimate),
    MapsDispatched {
        count: usize,
    },
    /// Barrier 1: enough maps finished to start reducers.
    ReduceDispatchReady {
        completed: usize,
        required: usize,
    },
    ReducesDispatched {
        count: usize,
    },
    /// Barrier 2: every map finished.
    MapsCompleted {
        count: usize,
    },
    ReducesCompleted {
        count: usize,
    },
    OutputFinalized {
        keys: Vec<String>,
    },
    SummaryPersisted {
        key: String,
    },
    IntermediatesCleaned {
        objects: usize,
    },
    JobFinished {
        job_id: JobId,
        rows: u64,
        elapsed_seconds: f64,
    },
    JobFailed {
        job_id: JobId,
        kind: String,
        message: String,
    },
}

/// Sink for the events of one job run.
pub trait JobReporter: Send + Sync {
    fn report(&self, event: &JobEvent);
}

/// Forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl JobReporter for TracingReporter {
    fn report(&self, event: &JobEvent) {
        match event {
            JobEvent::JobStarted {
                job_id,
                input_key,
                input_bytes,
                map_tasks,
                reduce_tasks,
            } => info!(
                %job_id,
                input_key = %input_key,
                input_bytes,
                map_tasks,
                reduce_tasks,
                "Sort job started"
            ),
            JobEvent::PartitioningResolved {
                order_preserving,
                num_partitions,
                sampled_keys,
            } => info!(
                order_preserving,
                num_partitions, sampled_keys, "Partitioning resolved"
            ),
            JobEvent::ShuffleEstimated(estimate) => info!(
                direct_cost = estimate.direct_cost,
                two_level_cost = estimate.two_level_cost,
                recommended = ?estimate.recommended,
                "Shuffle cost estimated"
            ),
            JobEvent::MapsDispatched { count } => info!(count, "Map tasks dispatched"),
            JobEvent::ReduceDispatchReady {
                completed,
                required,
            } => info!(completed, required, "Map completion threshold reached"),
            JobEvent::ReducesDispatched { count } => info!(count, "Reduce tasks dispatched"),
            JobEvent::MapsCompleted { count } => info!(count, "All map tasks completed"),
            JobEvent::ReducesCompleted { count } => info!(count, "All reduce tasks completed"),
            JobEvent::OutputFinalized { keys } => {
                info!(objects = keys.len(), "Sorted output finalized")
            }
            JobEvent::SummaryPersisted { key } => info!(key = %key, "Job summary persisted"),
            JobEvent::IntermediatesCleaned { objects } => {
                info!(objects, "Intermediate objects deleted")
            }
            JobEvent::JobFinished {
                job_id,
                rows,
                elapsed_seconds,
            } => info!(%job_id, rows, elapsed_seconds, "Sort job finished"),
            JobEvent::JobFailed {
                job_id,
                kind,
                message,
            } => error!(%job_id, kind = %kind, "Sort job failed: {}", message),
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default, Clone)]
pub struct CollectingReporter {
    events: Arc<Mutex<Vec<JobEvent>>>,
}

impl CollectingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<JobEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl JobReporter for CollectingReporter {
    fn report(&self, event: &JobEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event.clone()),
            Err(_) => warn!("Event collector poisoned, dropping event"),
        }
    }
}

/// Static description of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionInfo {
    pub job_id: JobId,
    pub input_key: String,
    pub input_bytes: u64,
    pub map_tasks: u32,
    pub reduce_tasks: u32,
    pub record_format: RecordFormat,
    /// Inclusive upper bounds of each range partition, empty for hashing.
    pub range_bounds: Vec<Vec<u8>>,
    pub order_preserving: bool,
    pub compression: CompressionAlgorithm,
    pub output_mode: OutputMode,
    pub map_completion_threshold: f64,
    pub runtime_memory_mb: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapRecord {
    pub result: MapResult,
    pub stats: InvocationStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReduceRecord {
    pub result: ReduceResult,
    pub stats: InvocationStats,
}

/// Wall-clock bounds of the sort, in unix seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SortTimes {
    pub start_time: f64,
    pub end_time: f64,
}

impl SortTimes {
    pub fn elapsed(&self) -> f64 {
        (self.end_time - self.start_time).max(0.0)
    }
}

/// Job-wide totals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResults {
    pub rows_in: u64,
    pub rows_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub shards_written: u64,
    pub output_keys: Vec<String>,
    /// Store requests issued by all tasks.
    pub requests: RequestCounts,
}

/// Everything known about a finished job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub execution_info: ExecutionInfo,
    pub map_data: Vec<MapRecord>,
    pub red_data: Vec<ReduceRecord>,
    pub sort: SortTimes,
    pub cost: JobCost,
    pub execution_results: ExecutionResults,
}

impl JobSummary {
    pub fn job_id(&self) -> &JobId {
        &self.execution_info.job_id
    }

    pub fn map_stats(&self) -> Vec<InvocationStats> {
        self.map_data.iter().map(|r| r.stats.clone()).collect()
    }

    pub fn reduce_stats(&self) -> Vec<InvocationStats> {
        self.red_data.iter().map(|r| r.stats.clone()).collect()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(body: &str) -> serde_json::Result<Self> {
        serde_json::from_str(body)
    }
}
