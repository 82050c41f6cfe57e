//! Job configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;

use terasort_common::{CompressionAlgorithm, StorageConfig};

use crate::cost::BillingRates;
use crate::error::{SortError, SortResult};
use crate::executor::ExecutorConfig;
use crate::shard_store::JobLayout;
use crate::shuffle::PartitionScheme;
use crate::types::{JobId, RecordFormat};

/// How the sorted output is materialised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// One `part-NNNNN` object per reduce task.
    #[default]
    Whole,
    /// A single object assembled from one segment per reduce task.
    Segmented,
}

/// Configuration of one sort job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SortConfig {
    /// Key of the input dataset.
    pub input_key: String,
    /// Number of map tasks
    pub map_tasks: u32,
    /// Number of reduce tasks
    pub reduce_tasks: u32,
    /// Layout of input and output records
    pub record_format: RecordFormat,
    /// Key routing policy, fixed for the whole job
    pub partitioning: PartitionScheme,
    pub output_mode: OutputMode,
    pub output_prefix: String,
    /// Object name of the segmented output
    pub output_name: String,
    /// Root of intermediate shards and manifests
    pub intermediate_prefix: String,
    /// Where job summaries are persisted
    pub log_prefix: String,
    /// Compression of shard payloads
    pub compression: CompressionAlgorithm,
    /// Fraction of map tasks that must finish before reducers are dispatched
    pub map_completion_threshold: f64,
    /// Concurrent object requests inside one task
    pub io_concurrency: usize,
    pub manifest_poll_interval_ms: u64,
    /// Reducer patience for missing map manifests
    pub map_wait_timeout_ms: u64,
    /// Leave intermediates in place after a successful run
    pub keep_intermediates: bool,
    pub executor: ExecutorConfig,
    pub storage: StorageConfig,
    pub billing: BillingRates,
}

impl Default for SortConfig {
    fn default() -> Self {
        Self {
            input_key: String::new(),
            map_tasks: 4,
            reduce_tasks: 4,
            record_format: RecordFormat::default(),
            partitioning: PartitionScheme::default(),
            output_mode: OutputMode::default(),
            output_prefix: "terasort/output".to_string(),
            output_name: "sorted".to_string(),
            intermediate_prefix: "terasort/intermediate".to_string(),
            log_prefix: "terasort/logs".to_string(),
            compression: CompressionAlgorithm::default(),
            map_completion_threshold: 0.8,
            io_concurrency: 16,
            manifest_poll_interval_ms: 100,
            map_wait_timeout_ms: 15 * 60 * 1000, // 15 minutes
            keep_intermediates: false,
            executor: ExecutorConfig::default(),
            storage: StorageConfig::default(),
            billing: BillingRates::default(),
        }
    }
}

impl SortConfig {
    pub fn new<S: Into<String>>(input_key: S) -> Self {
        Self {
            input_key: input_key.into(),
            ..Self::default()
        }
    }

    /// Load a configuration from a JSON file. Missing fields take defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> SortResult<Self> {
        let path = path.as_ref();
        let body = std::fs::read_to_string(path).map_err(|e| {
            SortError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&body)
            .map_err(|e| SortError::InvalidConfig(format!("{}: {}", path.display(), e)))
    }

    pub fn with_tasks(mut self, map_tasks: u32, reduce_tasks: u32) -> Self {
        self.map_tasks = map_tasks;
        self.reduce_tasks = reduce_tasks;
        self
    }

    pub fn with_record_format(mut self, record_format: RecordFormat) -> Self {
        self.record_format = record_format;
        self
    }

    pub fn with_partitioning(mut self, partitioning: PartitionScheme) -> Self {
        self.partitioning = partitioning;
        self
    }

    pub fn with_output(mut self, mode: OutputMode, prefix: impl Into<String>) -> Self {
        self.output_mode = mode;
        self.output_prefix = prefix.into();
        self
    }

    pub fn with_compression(mut self, compression: CompressionAlgorithm) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_map_completion_threshold(mut self, threshold: f64) -> Self {
        self.map_completion_threshold = threshold;
        self
    }

    pub fn with_map_wait_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.map_wait_timeout_ms = timeout_ms;
        self
    }

    pub fn with_executor(mut self, executor: ExecutorConfig) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }

    /// Map tasks that must succeed before reduce tasks are dispatched.
    pub fn map_barrier_count(&self) -> usize {
        let needed = (self.map_completion_threshold * self.map_tasks as f64).ceil() as usize;
        needed.clamp(1, self.map_tasks.max(1) as usize)
    }

    pub fn layout(&self, job_id: JobId) -> JobLayout {
        JobLayout {
            job_id,
            intermediate_prefix: self.intermediate_prefix.clone(),
            output_prefix: self.output_prefix.clone(),
            output_name: self.output_name.clone(),
            log_prefix: self.log_prefix.clone(),
        }
    }

    /// Reject configurations that cannot run, before any task starts.
    pub fn validate(&self) -> SortResult<()> {
        if self.input_key.trim().is_empty() {
            return Err(SortError::InvalidConfig("input_key is empty".to_string()));
        }
        if self.map_tasks == 0 || self.reduce_tasks == 0 {
            return Err(SortError::InvalidConfig(format!(
                "need at least one map and one reduce task, got {} and {}",
                self.map_tasks, self.reduce_tasks
            )));
        }
        self.record_format.validate()?;
        if !(self.map_completion_threshold > 0.0 && self.map_completion_threshold <= 1.0) {
            return Err(SortError::InvalidConfig(format!(
                "map_completion_threshold must be in (0, 1], got {}",
                self.map_completion_threshold
            )));
        }
        if self.io_concurrency == 0 || self.executor.max_concurrency == 0 {
            return Err(SortError::InvalidConfig(
                "concurrency limits must be positive".to_string(),
            ));
        }
        if self.manifest_poll_interval_ms == 0 {
            return Err(SortError::InvalidConfig(
                "manifest_poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.output_mode == OutputMode::Segmented {
            if !self.partitioning.preserves_key_order() {
                return Err(SortError::PartitionConfigError(
                    "segmented output needs a range partitioning scheme; hash partitions are not key ordered"
                        .to_string(),
                ));
            }
            if self.output_name.trim_matches('/').is_empty() {
                return Err(SortError::InvalidConfig("output_name is empty".to_string()));
            }
        }
        match &self.partitioning {
            PartitionScheme::ExplicitRange { bounds }
                if bounds.len() != (self.reduce_tasks - 1) as usize =>
            {
                Err(SortError::PartitionConfigError(format!(
                    "{} reduce tasks need {} range bounds, got {}",
                    self.reduce_tasks,
                    self.reduce_tasks - 1,
                    bounds.len()
                )))
            }
            PartitionScheme::Sampled {
                sample_records_per_split: 0,
            } => Err(SortError::PartitionConfigError(
                "sample_records_per_split must be positive".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_with_input_is_valid() {
        let config = SortConfig::new("datasets/1gb");
        config.validate().unwrap();
        assert_eq!(config.map_barrier_count(), 4);
        assert!(SortConfig::default().validate().is_err());
    }

    #[test]
    fn test_segmented_hash_output_rejected_at_setup() {
        let config = SortConfig::new("in")
            .with_partitioning(PartitionScheme::Hash)
            .with_output(OutputMode::Segmented, "out");
        assert!(matches!(
            config.validate(),
            Err(SortError::PartitionConfigError(_))
        ));

        let ranged = SortConfig::new("in").with_output(OutputMode::Segmented, "out");
        ranged.validate().unwrap();
    }

    #[test]
    fn test_explicit_bounds_must_match_reducers() {
        let config = SortConfig::new("in")
            .with_tasks(2, 3)
            .with_partitioning(PartitionScheme::ExplicitRange {
                bounds: vec![b"m".to_vec()],
            });
        assert!(matches!(
            config.validate(),
            Err(SortError::PartitionConfigError(_))
        ));
    }

    #[test]
    fn test_threshold_bounds() {
        for bad in [0.0, -0.5, 1.5, f64::NAN] {
            let config = SortConfig::new("in").with_map_completion_threshold(bad);
            assert!(config.validate().is_err(), "{bad} accepted");
        }
        let config = SortConfig::new("in")
            .with_tasks(10, 2)
            .with_map_completion_threshold(0.25);
        assert_eq!(config.map_barrier_count(), 3);
        let tiny = SortConfig::new("in")
            .with_tasks(10, 2)
            .with_map_completion_threshold(0.01);
        assert_eq!(tiny.map_barrier_count(), 1);
    }

    #[test]
    fn test_from_json_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "input_key": "datasets/small",
                "map_tasks": 8,
                "partitioning": {{"type": "sampled", "sample_records_per_split": 64}},
                "output_mode": "segmented",
                "compression": "lz4",
                "storage": {{"backend": {{"type": "memory"}}}}
            }}"#
        )
        .unwrap();

        let config = SortConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.map_tasks, 8);
        assert_eq!(config.reduce_tasks, 4);
        assert_eq!(config.compression, CompressionAlgorithm::Lz4);
        assert_eq!(config.output_mode, OutputMode::Segmented);
        assert_eq!(
            config.partitioning,
            PartitionScheme::Sampled {
                sample_records_per_split: 64
            }
        );
        config.validate().unwrap();

        assert!(matches!(
            SortConfig::from_json_file("/nonexistent/terasort.json"),
            Err(SortError::InvalidConfig(_))
        ));
    }
}
