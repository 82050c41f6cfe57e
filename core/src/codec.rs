//! Binary encoding of row batches for intermediate shards.
//!
//! A non-empty shard is laid out as
//!
//! ```text
//! magic "TSRT" | version u8 | compression tag u8 | row count u32 LE | crc32 u32 LE | payload
//! ```
//!
//! where the payload is the (optionally compressed) bincode encoding of two
//! columns, keys and values. The empty batch encodes to the zero-length
//! blob, so mappers never have to materialise headers for empty shards.

use bincode::{Decode, Encode};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;

use terasort_common::{
    CompressionAlgorithm, CompressionBuilder, Compressor, MAX_DECOMPRESSED_BYTES,
};

use crate::error::{SortError, SortResult};
use crate::types::{Batch, Row};

const MAGIC: &[u8; 4] = b"TSRT";
const FORMAT_VERSION: u8 = 1;
const HEADER_LEN: usize = 14;
/// Upper bound on a decoded payload, guards allocations on hostile input.
const MAX_PAYLOAD_BYTES: usize = MAX_DECOMPRESSED_BYTES;

#[derive(Encode)]
struct ColumnsRef<'a> {
    keys: Vec<&'a [u8]>,
    values: Vec<&'a [u8]>,
}

#[derive(Decode)]
struct Columns {
    keys: Vec<Vec<u8>>,
    values: Vec<Vec<u8>>,
}

fn bincode_config() -> impl bincode::config::Config {
    bincode::config::standard().with_limit::<MAX_PAYLOAD_BYTES>()
}

fn corrupt(reason: impl Into<String>) -> SortError {
    SortError::CorruptShard {
        location: "<unnamed>".to_string(),
        reason: reason.into(),
    }
}

/// Encoder/decoder for shard payloads.
///
/// Encoding uses the configured algorithm. Decoding follows the algorithm
/// recorded in each shard header, so shards written by a differently
/// configured worker still decode.
#[derive(Debug, Clone)]
pub struct ShardCodec {
    algorithm: CompressionAlgorithm,
    compressors: Arc<HashMap<CompressionAlgorithm, Box<dyn Compressor>>>,
}

impl ShardCodec {
    /// Create a codec that compresses with `algorithm`.
    pub fn new(algorithm: CompressionAlgorithm) -> SortResult<Self> {
        let mut compressors = HashMap::new();
        for candidate in [
            CompressionAlgorithm::Uncompressed,
            CompressionAlgorithm::Zstd,
            CompressionAlgorithm::Lz4,
            CompressionAlgorithm::Snappy,
        ] {
            let compressor = CompressionBuilder::with_algorithm(candidate)
                .max_decompressed_len(MAX_PAYLOAD_BYTES)
                .build()
                .map_err(|e| SortError::InvalidConfig(e.to_string()))?;
            compressors.insert(candidate, compressor);
        }
        Ok(Self {
            algorithm,
            compressors: Arc::new(compressors),
        })
    }

    pub fn algorithm(&self) -> CompressionAlgorithm {
        self.algorithm
    }

    fn compressor(&self, algorithm: CompressionAlgorithm) -> SortResult<&dyn Compressor> {
        self.compressors
            .get(&algorithm)
            .map(|c| c.as_ref())
            .ok_or_else(|| corrupt(format!("no compressor for {:?}", algorithm)))
    }

    pub fn encode(&self, batch: &Batch) -> SortResult<Bytes> {
        let rows: Vec<&Row> = batch.iter().collect();
        self.encode_rows(&rows)
    }

    /// Encode a sequence of borrowed rows, preserving their order.
    pub fn encode_rows(&self, rows: &[&Row]) -> SortResult<Bytes> {
        if rows.is_empty() {
            return Ok(Bytes::new());
        }
        let row_count = u32::try_from(rows.len()).map_err(|_| {
            SortError::InvalidInput(format!("{} rows exceed the shard row limit", rows.len()))
        })?;

        let columns = ColumnsRef {
            keys: rows.iter().map(|r| r.key.as_slice()).collect(),
            values: rows.iter().map(|r| r.value.as_slice()).collect(),
        };
        let raw = bincode::encode_to_vec(&columns, bincode_config())
            .map_err(|e| SortError::Serialization(e.to_string()))?;
        let payload = self
            .compressor(self.algorithm)?
            .compress(&raw)
            .map_err(|e| SortError::Serialization(e.to_string()))?;

        let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
        out.extend_from_slice(MAGIC);
        out.push(FORMAT_VERSION);
        out.push(self.algorithm.tag());
        out.extend_from_slice(&row_count.to_le_bytes());
        out.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        out.extend_from_slice(&payload);
        Ok(Bytes::from(out))
    }

    /// Decode a shard. Anything that is not a well-formed shard is
    /// reported as [`SortError::CorruptShard`].
    pub fn decode(&self, data: &[u8]) -> SortResult<Batch> {
        if data.is_empty() {
            return Ok(Batch::empty());
        }
        if data.len() < HEADER_LEN {
            return Err(corrupt(format!("{} bytes is shorter than the header", data.len())));
        }
        let (header, payload) = data.split_at(HEADER_LEN);
        if &header[0..4] != MAGIC {
            return Err(corrupt("bad magic"));
        }
        if header[4] != FORMAT_VERSION {
            return Err(corrupt(format!("unsupported format version {}", header[4])));
        }
        let algorithm = CompressionAlgorithm::from_tag(header[5])
            .ok_or_else(|| corrupt(format!("unknown compression tag {}", header[5])))?;
        let row_count = u32::from_le_bytes([header[6], header[7], header[8], header[9]]) as usize;
        let crc = u32::from_le_bytes([header[10], header[11], header[12], header[13]]);

        if crc32fast::hash(payload) != crc {
            return Err(corrupt("crc mismatch"));
        }

        let raw = self
            .compressor(algorithm)?
            .decompress(payload)
            .map_err(|e| corrupt(e.to_string()))?;
        let (columns, consumed): (Columns, usize) =
            bincode::decode_from_slice(&raw, bincode_config()).map_err(|e| corrupt(e.to_string()))?;
        if consumed != raw.len() {
            return Err(corrupt(format!(
                "{} trailing bytes after columns",
                raw.len() - consumed
            )));
        }
        if columns.keys.len() != columns.values.len() {
            return Err(corrupt(format!(
                "{} keys but {} values",
                columns.keys.len(),
                columns.values.len()
            )));
        }
        if columns.keys.len() != row_count {
            return Err(corrupt(format!(
                "header records {} rows, payload holds {}",
                row_count,
                columns.keys.len()
            )));
        }

        Ok(columns
            .keys
            .into_iter()
            .zip(columns.values)
            .map(|(key, value)| Row { key, value })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_batch() -> Batch {
        Batch::new(vec![
            Row::new(*b"charlie", *b"3"),
            Row::new(*b"alpha", Vec::new()),
            Row::new(Vec::new(), *b"empty key"),
            Row::new(*b"alpha", *b"duplicate key"),
        ])
    }

    #[test]
    fn test_round_trip_every_algorithm() {
        for algorithm in [
            CompressionAlgorithm::Uncompressed,
            CompressionAlgorithm::Zstd,
            CompressionAlgorithm::Lz4,
            CompressionAlgorithm::Snappy,
        ] {
            let codec = ShardCodec::new(algorithm).unwrap();
            let batch = sample_batch();
            let encoded = codec.encode(&batch).unwrap();
            assert_eq!(codec.decode(&encoded).unwrap(), batch, "{algorithm:?}");
        }
    }

    #[test]
    fn test_empty_batch_is_zero_length() {
        let codec = ShardCodec::new(CompressionAlgorithm::Zstd).unwrap();
        let encoded = codec.encode(&Batch::empty()).unwrap();
        assert!(encoded.is_empty());
        assert!(codec.decode(&encoded).unwrap().is_empty());
    }

    #[test]
    fn test_decode_follows_header_algorithm() {
        let writer = ShardCodec::new(CompressionAlgorithm::Lz4).unwrap();
        let reader = ShardCodec::new(CompressionAlgorithm::Zstd).unwrap();
        let encoded = writer.encode(&sample_batch()).unwrap();
        assert_eq!(reader.decode(&encoded).unwrap(), sample_batch());
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let codec = ShardCodec::new(CompressionAlgorithm::Zstd).unwrap();
        assert_eq!(
            codec.encode(&sample_batch()).unwrap(),
            codec.encode(&sample_batch()).unwrap()
        );
    }

    #[test]
    fn test_malformed_input_is_corrupt_shard() {
        let codec = ShardCodec::new(CompressionAlgorithm::Uncompressed).unwrap();
        let encoded = codec.encode(&sample_batch()).unwrap().to_vec();

        let mut flipped = encoded.clone();
        let last = flipped.len() - 1;
        flipped[last] ^= 0xff;

        let mut bad_magic = encoded.clone();
        bad_magic[0] = b'X';

        let mut bad_tag = encoded.clone();
        bad_tag[5] = 9;

        let mut wrong_count = encoded.clone();
        wrong_count[6] = 99;

        let truncated = encoded[..encoded.len() - 3].to_vec();

        for (name, data) in [
            ("flipped", flipped),
            ("bad magic", bad_magic),
            ("bad tag", bad_tag),
            ("wrong count", wrong_count),
            ("truncated", truncated),
            ("short", b"TSR".to_vec()),
        ] {
            assert!(
                matches!(codec.decode(&data), Err(SortError::CorruptShard { .. })),
                "{name} was accepted"
            );
        }
    }

    #[test]
    fn test_trailing_payload_bytes_rejected() {
        let codec = ShardCodec::new(CompressionAlgorithm::Uncompressed).unwrap();
        let mut data = codec.encode(&sample_batch()).unwrap().to_vec();
        data.push(0);
        let crc = crc32fast::hash(&data[HEADER_LEN..]);
        data[10..14].copy_from_slice(&crc.to_le_bytes());

        let err = codec.decode(&data).unwrap_err();
        assert!(matches!(err, SortError::CorruptShard { ref reason, .. } if reason.contains("trailing")));
    }

    #[test]
    fn test_oversized_payload_claim_is_corrupt_shard() {
        // Valid header and crc, but the lz4 size prefix claims 4 GiB.
        let payload = [0xff, 0xff, 0xff, 0xff, 0x00];
        let mut data = Vec::new();
        data.extend_from_slice(MAGIC);
        data.push(FORMAT_VERSION);
        data.push(CompressionAlgorithm::Lz4.tag());
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        data.extend_from_slice(&payload);

        let codec = ShardCodec::new(CompressionAlgorithm::Lz4).unwrap();
        let err = codec.decode(&data).unwrap_err();
        assert!(matches!(err, SortError::CorruptShard { ref reason, .. } if reason.contains("limit")));
    }
}
