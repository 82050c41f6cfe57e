//! Defines partitioners for distributing rows in a shuffle.

use fnv::FnvHasher;
use rayon::prelude::*;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::Debug;
use std::hash::Hasher;
use std::sync::Arc;

use crate::codec::ShardCodec;
use crate::error::{SortError, SortResult};
use crate::types::{Batch, Row};

/// Maps a key to the reduce task that owns it.
pub trait Partitioner: Send + Sync + Debug {
    fn num_partitions(&self) -> u32;

    fn get_partition(&self, key: &[u8]) -> u32;

    /// Whether partition `i` only holds keys no greater than any key of
    /// partition `i + 1`.
    fn preserves_key_order(&self) -> bool {
        false
    }
}

/// A partitioner that uses the FNV-1a hash of the key to distribute data.
///
/// FNV is unseeded, so every process routes a key to the same partition.
#[derive(Clone, Debug)]
pub struct HashPartitioner {
    num_partitions: u32,
}

impl HashPartitioner {
    pub fn new(num_partitions: u32) -> SortResult<Self> {
        if num_partitions == 0 {
            return Err(SortError::PartitionConfigError(
                "Number of partitions must be positive".to_string(),
            ));
        }
        Ok(Self { num_partitions })
    }

    /// 64-bit FNV-1a of `key`.
    pub fn hash_key(key: &[u8]) -> u64 {
        let mut hasher = FnvHasher::default();
        hasher.write(key);
        hasher.finish()
    }
}

impl Partitioner for HashPartitioner {
    fn num_partitions(&self) -> u32 {
        self.num_partitions
    }

    fn get_partition(&self, key: &[u8]) -> u32 {
        (Self::hash_key(key) % self.num_partitions as u64) as u32
    }
}

/// A range partitioner that distributes keys based on sorted ranges.
///
/// Bound `i` is the inclusive upper limit of partition `i`; keys above the
/// last bound go to the last partition.
#[derive(Clone, Debug)]
pub struct RangePartitioner {
    num_partitions: u32,
    range_bounds: Vec<Vec<u8>>,
}

impl RangePartitioner {
    /// Create a new range partitioner with the given bounds.
    /// The bounds must have length = num_partitions - 1.
    pub fn new(num_partitions: u32, mut range_bounds: Vec<Vec<u8>>) -> SortResult<Self> {
        if num_partitions == 0 {
            return Err(SortError::PartitionConfigError(
                "Number of partitions must be positive".to_string(),
            ));
        }
        if range_bounds.len() != (num_partitions - 1) as usize {
            return Err(SortError::PartitionConfigError(format!(
                "{} partitions need {} range bounds, got {}",
                num_partitions,
                num_partitions - 1,
                range_bounds.len()
            )));
        }

        range_bounds.sort();
        Ok(Self {
            num_partitions,
            range_bounds,
        })
    }

    /// Evenly spaced bounds over the first eight bytes of the key space,
    /// suited to uniformly distributed keys such as gensort output.
    pub fn uniform(num_partitions: u32, key_len: usize) -> SortResult<Self> {
        let n = num_partitions as u128;
        let bounds = (1..num_partitions)
            .map(|i| {
                let upper = (((i as u128) << 64) / n - 1) as u64;
                let mut bound = upper.to_be_bytes().to_vec();
                bound.resize(key_len, 0xff);
                bound
            })
            .collect();
        Self::new(num_partitions, bounds)
    }

    /// Create a range partitioner by sampling the given keys.
    pub fn from_sample(num_partitions: u32, mut sample_data: Vec<Vec<u8>>) -> SortResult<Self> {
        if num_partitions == 0 {
            return Err(SortError::PartitionConfigError(
                "Number of partitions must be positive".to_string(),
            ));
        }

        if sample_data.is_empty() || num_partitions == 1 {
            // Without samples every non-empty key lands in the last partition.
            let bounds = vec![Vec::new(); (num_partitions - 1) as usize];
            return Self::new(num_partitions, bounds);
        }

        sample_data.sort();
        sample_data.dedup();

        let step = sample_data.len() as f64 / num_partitions as f64;
        let range_bounds = (1..num_partitions)
            .map(|i| {
                let index = ((i as f64 * step) as usize)
                    .saturating_sub(1)
                    .min(sample_data.len() - 1);
                sample_data[index].clone()
            })
            .collect();

        Self::new(num_partitions, range_bounds)
    }

    pub fn range_bounds(&self) -> &[Vec<u8>] {
        &self.range_bounds
    }
}

impl Partitioner for RangePartitioner {
    fn num_partitions(&self) -> u32 {
        self.num_partitions
    }

    fn get_partition(&self, key: &[u8]) -> u32 {
        // Binary search to find the appropriate partition
        match self
            .range_bounds
            .binary_search_by(|bound| bound.as_slice().cmp(key))
        {
            Ok(index) => index as u32,
            Err(index) => index as u32,
        }
    }

    fn preserves_key_order(&self) -> bool {
        true
    }
}

/// User-facing choice of partitioning policy, fixed for a whole job.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PartitionScheme {
    /// `fnv1a64(key) mod N`. Output parts are not globally ordered.
    Hash,
    /// Evenly spaced bounds over the 64-bit key prefix.
    #[default]
    UniformRange,
    /// Explicit bounds, one fewer than the number of reduce tasks. Keys are
    /// raw bytes, written as hex strings in configuration files.
    ExplicitRange {
        #[serde(with = "hex_keys")]
        bounds: Vec<Vec<u8>>,
    },
    /// Bounds taken from keys sampled at the start of every split.
    Sampled { sample_records_per_split: usize },
}

impl PartitionScheme {
    pub fn preserves_key_order(&self) -> bool {
        !matches!(self, PartitionScheme::Hash)
    }

    /// Resolve into the concrete plan shipped to every task.
    ///
    /// `sample` is only consulted by [`PartitionScheme::Sampled`].
    pub fn resolve(
        &self,
        num_partitions: u32,
        key_len: usize,
        sample: Vec<Vec<u8>>,
    ) -> SortResult<PartitionPlan> {
        let plan = match self {
            PartitionScheme::Hash => {
                HashPartitioner::new(num_partitions)?;
                PartitionPlan::Hash { num_partitions }
            }
            PartitionScheme::UniformRange => PartitionPlan::Range {
                bounds: RangePartitioner::uniform(num_partitions, key_len)?.range_bounds,
            },
            PartitionScheme::ExplicitRange { bounds } => {
                if bounds.windows(2).any(|w| w[0] > w[1]) {
                    return Err(SortError::PartitionConfigError(
                        "explicit range bounds must be sorted".to_string(),
                    ));
                }
                PartitionPlan::Range {
                    bounds: RangePartitioner::new(num_partitions, bounds.clone())?.range_bounds,
                }
            }
            PartitionScheme::Sampled { .. } => PartitionPlan::Range {
                bounds: RangePartitioner::from_sample(num_partitions, sample)?.range_bounds,
            },
        };
        Ok(plan)
    }
}

mod hex_keys {
    use super::*;

    pub fn serialize<S: Serializer>(keys: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(keys.iter().map(hex::encode))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Vec<u8>>, D::Error> {
        Vec::<String>::deserialize(deserializer)?
            .iter()
            .map(|key| hex::decode(key).map_err(serde::de::Error::custom))
            .collect()
    }
}

/// Resolved partitioning, serializable so it can travel in task descriptors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PartitionPlan {
    Hash { num_partitions: u32 },
    Range { bounds: Vec<Vec<u8>> },
}

impl PartitionPlan {
    pub fn num_partitions(&self) -> u32 {
        match self {
            PartitionPlan::Hash { num_partitions } => *num_partitions,
            PartitionPlan::Range { bounds } => bounds.len() as u32 + 1,
        }
    }

    pub fn preserves_key_order(&self) -> bool {
        matches!(self, PartitionPlan::Range { .. })
    }

    pub fn build(&self) -> SortResult<Arc<dyn Partitioner>> {
        Ok(match self {
            PartitionPlan::Hash { num_partitions } => {
                Arc::new(HashPartitioner::new(*num_partitions)?)
            }
            PartitionPlan::Range { bounds } => Arc::new(RangePartitioner::new(
                bounds.len() as u32 + 1,
                bounds.clone(),
            )?),
        })
    }
}

/// One encoded shard produced by [`partition_batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardBlob {
    pub rows: u64,
    pub data: bytes::Bytes,
}

/// Split `batch` into exactly `num_partitions` encoded shards.
///
/// Shard `i` holds the rows routed to partition `i` in their input order.
/// Partitions with no rows get the zero-length encoding.
pub fn partition_batch(
    batch: &Batch,
    partitioner: &dyn Partitioner,
    codec: &ShardCodec,
) -> SortResult<Vec<ShardBlob>> {
    let num_partitions = partitioner.num_partitions() as usize;
    let ids: Vec<u32> = batch
        .rows()
        .par_iter()
        .map(|row| partitioner.get_partition(&row.key))
        .collect();

    let mut buckets: Vec<Vec<&Row>> = vec![Vec::new(); num_partitions];
    for (row, id) in batch.iter().zip(ids) {
        buckets
            .get_mut(id as usize)
            .ok_or_else(|| {
                SortError::PartitionConfigError(format!(
                    "partitioner returned {} for {} partitions",
                    id, num_partitions
                ))
            })?
            .push(row);
    }

    buckets
        .par_iter()
        .map(|rows| {
            Ok(ShardBlob {
                rows: rows.len() as u64,
                data: codec.encode_rows(rows)?,
            })
        })
        .collect()
}
