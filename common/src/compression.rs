//! Compression abstraction for shard payloads.
//!
//! Shards are written once and read once, so the algorithm is picked per
//! job and recorded in every shard header by its one-byte tag.

use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::io::Read;

use crate::error::{CommonError, Result};

/// Compression algorithm types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionAlgorithm {
    /// Payload stored as is.
    Uncompressed,
    /// Zstd compression - high performance with excellent compression ratio.
    #[default]
    Zstd,
    /// LZ4 compression - extremely fast compression and decompression.
    Lz4,
    /// Snappy compression - balanced compression ratio and speed.
    Snappy,
}

impl CompressionAlgorithm {
    /// Get the default compression level for this algorithm.
    pub fn default_level(&self) -> i32 {
        match self {
            CompressionAlgorithm::Zstd => 3,
            _ => 0,
        }
    }

    /// Stable on-disk tag.
    pub fn tag(&self) -> u8 {
        match self {
            CompressionAlgorithm::Uncompressed => 0,
            CompressionAlgorithm::Zstd => 1,
            CompressionAlgorithm::Lz4 => 2,
            CompressionAlgorithm::Snappy => 3,
        }
    }

    /// Inverse of [`CompressionAlgorithm::tag`].
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(CompressionAlgorithm::Uncompressed),
            1 => Some(CompressionAlgorithm::Zstd),
            2 => Some(CompressionAlgorithm::Lz4),
            3 => Some(CompressionAlgorithm::Snappy),
            _ => None,
        }
    }
}

/// Largest payload a compressor will inflate.
pub const MAX_DECOMPRESSED_BYTES: usize = 1 << 31;

/// Generic compressor interface.
pub trait Compressor: Debug + Send + Sync {
    /// Compress the input data and return compressed bytes.
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompress the input data and return original bytes.
    ///
    /// Fails instead of inflating past the compressor's size limit.
    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>>;

    /// Get the compression algorithm used by this compressor.
    fn algorithm(&self) -> CompressionAlgorithm;
}

/// Builder for creating compressor instances.
pub struct CompressionBuilder {
    algorithm: CompressionAlgorithm,
    level: i32,
    max_decompressed_len: usize,
}

impl CompressionBuilder {
    /// Create a new compression builder with the specified algorithm.
    pub fn with_algorithm(algorithm: CompressionAlgorithm) -> Self {
        Self {
            algorithm,
            level: algorithm.default_level(),
            max_decompressed_len: MAX_DECOMPRESSED_BYTES,
        }
    }

    /// Set the compression level.
    pub fn level(mut self, level: i32) -> Self {
        self.level = level;
        self
    }

    /// Cap the size of a decompressed payload.
    pub fn max_decompressed_len(mut self, limit: usize) -> Self {
        self.max_decompressed_len = limit;
        self
    }

    /// Build a compressor instance.
    pub fn build(self) -> Result<Box<dyn Compressor>> {
        if self.algorithm == CompressionAlgorithm::Zstd && !(1..=22).contains(&self.level) {
            return Err(CommonError::configuration_error(format!(
                "Invalid zstd compression level: {}. Must be between 1 and 22",
                self.level
            )));
        }
        Ok(Box::new(BlockCompressor {
            algorithm: self.algorithm,
            level: self.level,
            limit: self.max_decompressed_len,
        }))
    }
}

/// One compressor type for every algorithm; each call is a self-contained block.
#[derive(Debug)]
struct BlockCompressor {
    algorithm: CompressionAlgorithm,
    level: i32,
    limit: usize,
}

impl BlockCompressor {
    fn check_len(&self, len: usize) -> Result<()> {
        if len > self.limit {
            return Err(CommonError::decompression_error(format!(
                "{:?} payload inflates to {} bytes, limit is {}",
                self.algorithm, len, self.limit
            )));
        }
        Ok(())
    }

    fn decode_zstd(&self, compressed_data: &[u8]) -> Result<Vec<u8>> {
        let decoder = zstd::stream::read::Decoder::new(compressed_data).map_err(|e| {
            CommonError::decompression_error_with_source("Zstd decompression failed", e)
        })?;
        let mut out = Vec::new();
        // One byte past the limit tells an exact fit from an overflow.
        decoder
            .take(self.limit as u64 + 1)
            .read_to_end(&mut out)
            .map_err(|e| {
                CommonError::decompression_error_with_source("Zstd decompression failed", e)
            })?;
        self.check_len(out.len())?;
        Ok(out)
    }
}

impl Compressor for BlockCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let compressed = match self.algorithm {
            CompressionAlgorithm::Uncompressed => data.to_vec(),
            CompressionAlgorithm::Zstd => zstd::encode_all(data, self.level).map_err(|e| {
                CommonError::compression_error_with_source("Zstd compression failed", e)
            })?,
            CompressionAlgorithm::Lz4 => lz4_flex::compress_prepend_size(data),
            CompressionAlgorithm::Snappy => snap::raw::Encoder::new()
                .compress_vec(data)
                .map_err(|e| {
                    CommonError::compression_error_with_source("Snappy compression failed", e)
                })?,
        };
        Ok(compressed)
    }

    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>> {
        match self.algorithm {
            CompressionAlgorithm::Uncompressed => {
                self.check_len(compressed_data.len())?;
                Ok(compressed_data.to_vec())
            }
            CompressionAlgorithm::Zstd => self.decode_zstd(compressed_data),
            CompressionAlgorithm::Lz4 => {
                let (len, _) = lz4_flex::block::uncompressed_size(compressed_data).map_err(|e| {
                    CommonError::decompression_error_with_source("LZ4 decompression failed", e)
                })?;
                self.check_len(len)?;
                lz4_flex::decompress_size_prepended(compressed_data).map_err(|e| {
                    CommonError::decompression_error_with_source("LZ4 decompression failed", e)
                })
            }
            CompressionAlgorithm::Snappy => {
                let len = snap::raw::decompress_len(compressed_data).map_err(|e| {
                    CommonError::decompression_error_with_source("Snappy decompression failed", e)
                })?;
                self.check_len(len)?;
                snap::raw::Decoder::new()
                    .decompress_vec(compressed_data)
                    .map_err(|e| {
                        CommonError::decompression_error_with_source(
                            "Snappy decompression failed",
                            e,
                        )
                    })
            }
        }
    }

    fn algorithm(&self) -> CompressionAlgorithm {
        self.algorithm
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [CompressionAlgorithm; 4] = [
        CompressionAlgorithm::Uncompressed,
        CompressionAlgorithm::Zstd,
        CompressionAlgorithm::Lz4,
        CompressionAlgorithm::Snappy,
    ];

    fn sample_payload() -> Vec<u8> {
        b"AsfAGHM5om00000000000000000000000000000000000000000000000000000000000000000000000000000000000000000"
            .repeat(20)
    }

    #[test]
    fn test_every_algorithm_round_trips() {
        let payload = sample_payload();
        for algorithm in ALL {
            let compressor = CompressionBuilder::with_algorithm(algorithm).build().unwrap();
            let compressed = compressor.compress(&payload).unwrap();
            assert_eq!(compressor.decompress(&compressed).unwrap(), payload);
            assert_eq!(compressor.algorithm(), algorithm);
        }
    }

    #[test]
    fn test_tags_are_stable() {
        for algorithm in ALL {
            assert_eq!(CompressionAlgorithm::from_tag(algorithm.tag()), Some(algorithm));
        }
        assert_eq!(CompressionAlgorithm::from_tag(42), None);
    }

    #[test]
    fn test_invalid_zstd_level_rejected() {
        let result = CompressionBuilder::with_algorithm(CompressionAlgorithm::Zstd)
            .level(99)
            .build();
        assert!(matches!(result, Err(CommonError::ConfigurationError { .. })));
    }

    #[test]
    fn test_garbage_fails_to_decompress() {
        for algorithm in [
            CompressionAlgorithm::Zstd,
            CompressionAlgorithm::Lz4,
            CompressionAlgorithm::Snappy,
        ] {
            let compressor = CompressionBuilder::with_algorithm(algorithm).build().unwrap();
            let result = compressor.decompress(&[0x10, 0x00, 0x00, 0x00, 0xff, 0xff]);
            assert!(
                matches!(result, Err(CommonError::DecompressionError { .. })),
                "{algorithm:?} accepted garbage"
            );
        }
    }

    #[test]
    fn test_decompression_stops_at_size_limit() {
        let payload = sample_payload();
        for algorithm in ALL {
            let writer = CompressionBuilder::with_algorithm(algorithm).build().unwrap();
            let compressed = writer.compress(&payload).unwrap();

            let exact = CompressionBuilder::with_algorithm(algorithm)
                .max_decompressed_len(payload.len())
                .build()
                .unwrap();
            assert_eq!(exact.decompress(&compressed).unwrap(), payload);

            let capped = CompressionBuilder::with_algorithm(algorithm)
                .max_decompressed_len(payload.len() - 1)
                .build()
                .unwrap();
            let result = capped.decompress(&compressed);
            assert!(
                matches!(result, Err(CommonError::DecompressionError { .. })),
                "{algorithm:?} inflated past its limit"
            );
        }
    }
}
