//! Terasort Core - object-store shuffle sort
//!
//! Sorts a fixed-width record dataset held in an object store with
//! independently scheduled map and reduce tasks that only talk to each
//! other through the store.

pub mod codec;
pub mod config;
pub mod cost;
pub mod dataset;
pub mod driver;
pub mod error;
pub mod executor;
pub mod report;
pub mod shard_store;
pub mod shuffle;
pub mod task;
pub mod types;

pub use codec::ShardCodec;
pub use config::{OutputMode, SortConfig};
pub use cost::{BillingRates, CostModel, JobCost, ShuffleEstimate, ShuffleStrategy};
pub use dataset::{DatasetGenerator, DatasetInfo, OutputValidator, ValidationReport};
pub use driver::{Driver, PhaseResults, execute_phases};
pub use error::{SortError, SortResult};
pub use executor::{ExecutorConfig, InvocationStats, LocalExecutor, Task, TaskExecutor, TaskSet};
pub use report::{CollectingReporter, JobEvent, JobReporter, JobSummary, TracingReporter};
pub use shard_store::{JobLayout, MapManifest, RequestCounts, ShardStore};
pub use shuffle::{PartitionPlan, PartitionScheme, Partitioner};
pub use task::{MapResult, MapTask, ReduceResult, ReduceTask};
pub use types::{Batch, InputSplit, JobId, RecordFormat, Row, TaskId};
