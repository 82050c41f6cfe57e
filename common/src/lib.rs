//! Common storage and encoding utilities for the terasort workspace.
//!
//! This crate provides the object-store client used by every worker and the
//! compressors applied to intermediate shard payloads.

pub mod compression;
pub mod error;
pub mod storage;

pub use compression::{
    CompressionAlgorithm, CompressionBuilder, Compressor, MAX_DECOMPRESSED_BYTES,
};
pub use error::{CommonError, Diagnose, ErrorCategory, ErrorSeverity, Result};
pub use storage::{
    ObjectStoreStorage, SegmentToken, Storage, StorageBackend, StorageBuilder, StorageConfig,
    StorageStats, UploadId,
};
