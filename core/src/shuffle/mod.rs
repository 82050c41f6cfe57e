//! Shuffle components: key routing and per-reducer shard production.

pub mod partitioner;

pub use partitioner::{
    HashPartitioner, PartitionPlan, PartitionScheme, Partitioner, RangePartitioner, ShardBlob,
    partition_batch,
};
