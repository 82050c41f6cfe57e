//! Synthetic input datasets and validation of sorted output.
//!
//! Generated records follow the gensort layout: a binary key spread over the
//! whole byte range, then an ASCII value carrying the record number. The
//! checksum is the wrapping sum of the CRC32 of every record, so it does not
//! depend on record order and an input and its sorted output share it.

use bytes::Bytes;
use fnv::FnvHasher;
use serde::{Deserialize, Serialize};
use std::hash::Hasher;
use tracing::{debug, info, warn};

use terasort_common::{Storage, UploadId};

use crate::error::{SortError, SortResult};
use crate::types::{RecordFormat, Row};

/// Records per uploaded segment when writing a dataset.
pub const DEFAULT_RECORDS_PER_SEGMENT: u64 = 100_000;

/// Records fetched per ranged read when validating.
const VALIDATE_RECORDS_PER_READ: u64 = 65_536;

fn record_crc(record: &[u8]) -> u64 {
    crc32fast::hash(record) as u64
}

/// Deterministic record generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatasetGenerator {
    format: RecordFormat,
    seed: u64,
}

/// Description of a written dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetInfo {
    pub key: String,
    pub records: u64,
    pub bytes: u64,
    pub checksum: u64,
}

impl DatasetGenerator {
    pub fn new(format: RecordFormat, seed: u64) -> SortResult<Self> {
        format.validate()?;
        Ok(Self { format, seed })
    }

    pub fn format(&self) -> &RecordFormat {
        &self.format
    }

    fn key_block(&self, index: u64, block: u64) -> [u8; 8] {
        let mut hasher = FnvHasher::default();
        hasher.write(&self.seed.to_le_bytes());
        hasher.write(&index.to_le_bytes());
        hasher.write(&block.to_le_bytes());
        hasher.finish().to_be_bytes()
    }

    /// Record number `index` of the dataset.
    pub fn record(&self, index: u64) -> Row {
        let mut key = Vec::with_capacity(self.format.key_len);
        let mut block = 0u64;
        while key.len() < self.format.key_len {
            let bytes = self.key_block(index, block);
            let take = (self.format.key_len - key.len()).min(bytes.len());
            key.extend_from_slice(&bytes[..take]);
            block += 1;
        }

        let filler = b'A' + (index % 26) as u8;
        let value: Vec<u8> = format!("{:016X}", index)
            .into_bytes()
            .into_iter()
            .chain(std::iter::repeat(filler))
            .take(self.format.value_len())
            .collect();
        Row::new(key, value)
    }

    /// Raw bytes of records `start..start + count`.
    pub fn generate(&self, start: u64, count: u64) -> Vec<u8> {
        let mut out = Vec::with_capacity(count as usize * self.format.record_len);
        for index in start..start + count {
            let row = self.record(index);
            out.extend_from_slice(&row.key);
            out.extend_from_slice(&row.value);
        }
        out
    }

    /// Write `records` records to `key` as one object, uploading
    /// `records_per_segment` records per segment.
    pub async fn write(
        &self,
        storage: &dyn Storage,
        key: &str,
        records: u64,
        records_per_segment: u64,
    ) -> SortResult<DatasetInfo> {
        let per_segment = records_per_segment.max(1);
        let mut checksum = 0u64;

        if records <= per_segment {
            let data = self.generate(0, records);
            checksum = data
                .chunks_exact(self.format.record_len)
                .fold(checksum, |sum, record| sum.wrapping_add(record_crc(record)));
            storage
                .put(key, Bytes::from(data))
                .await
                .map_err(|e| SortError::store(format!("write dataset {}", key), e))?;
        } else {
            let upload = storage
                .begin_segmented_write(key)
                .await
                .map_err(|e| SortError::store(format!("begin dataset {}", key), e))?;
            let mut tokens = Vec::new();
            let mut start = 0u64;
            while start < records {
                let count = per_segment.min(records - start);
                let data = self.generate(start, count);
                checksum = data
                    .chunks_exact(self.format.record_len)
                    .fold(checksum, |sum, record| sum.wrapping_add(record_crc(record)));
                let index = tokens.len() as u32;
                match storage.put_segment(&upload, index, Bytes::from(data)).await {
                    Ok(token) => tokens.push(token),
                    Err(e) => {
                        abandon(storage, &upload).await;
                        return Err(SortError::store(format!("write dataset {}", key), e));
                    }
                }
                debug!(key, segment = index, records = count, "Uploaded dataset segment");
                start += count;
            }
            if let Err(e) = storage.complete_segmented_write(&upload, &tokens).await {
                abandon(storage, &upload).await;
                return Err(SortError::store(format!("complete dataset {}", key), e));
            }
        }

        let info = DatasetInfo {
            key: key.to_string(),
            records,
            bytes: records * self.format.record_len as u64,
            checksum,
        };
        info!(key, records, bytes = info.bytes, "Wrote dataset");
        Ok(info)
    }
}

async fn abandon(storage: &dyn Storage, upload: &UploadId) {
    if let Err(error) = storage.abort_segmented_write(upload).await {
        warn!(key = %upload.key, error = %error, "Failed to abort dataset upload");
    }
}

/// Outcome of validating a dataset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub records: u64,
    pub checksum: u64,
    pub duplicate_keys: u64,
    /// Index of the first record whose key is smaller than its predecessor's.
    pub first_unordered: Option<u64>,
    pub unordered_records: u64,
}

impl ValidationReport {
    pub fn is_sorted(&self) -> bool {
        self.unordered_records == 0
    }
}

/// Streaming order and checksum check over fixed-width records.
///
/// Records may arrive in any number of chunks as long as every chunk holds
/// whole records; order is checked across chunk boundaries.
#[derive(Debug, Clone)]
pub struct OutputValidator {
    format: RecordFormat,
    last_key: Option<Vec<u8>>,
    report: ValidationReport,
}

impl OutputValidator {
    pub fn new(format: RecordFormat) -> SortResult<Self> {
        format.validate()?;
        Ok(Self {
            format,
            last_key: None,
            report: ValidationReport::default(),
        })
    }

    pub fn absorb(&mut self, data: &[u8]) -> SortResult<()> {
        self.format.record_count(data.len() as u64)?;
        for record in data.chunks_exact(self.format.record_len) {
            let key = &record[..self.format.key_len];
            if let Some(last) = &self.last_key {
                match key.cmp(last.as_slice()) {
                    std::cmp::Ordering::Less => {
                        self.report.unordered_records += 1;
                        self.report
                            .first_unordered
                            .get_or_insert(self.report.records);
                    }
                    std::cmp::Ordering::Equal => self.report.duplicate_keys += 1,
                    std::cmp::Ordering::Greater => {}
                }
            }
            self.report.checksum = self.report.checksum.wrapping_add(record_crc(record));
            self.report.records += 1;
            match &mut self.last_key {
                Some(last) => {
                    last.clear();
                    last.extend_from_slice(key);
                }
                None => self.last_key = Some(key.to_vec()),
            }
        }
        Ok(())
    }

    /// Validate `keys` as one dataset, in the given order.
    pub async fn absorb_objects(&mut self, storage: &dyn Storage, keys: &[String]) -> SortResult<()> {
        let chunk = VALIDATE_RECORDS_PER_READ * self.format.record_len as u64;
        for key in keys {
            let size = storage
                .head(key)
                .await
                .map_err(|e| SortError::store(format!("head {}", key), e))?
                .ok_or_else(|| SortError::InvalidInput(format!("object {} does not exist", key)))?;
            self.format.record_count(size)?;
            let mut offset = 0u64;
            while offset < size {
                let end = (offset + chunk).min(size);
                let data = storage
                    .get_range(key, offset..end)
                    .await
                    .map_err(|e| SortError::store(format!("read {}", key), e))?;
                self.absorb(&data)?;
                offset = end;
            }
        }
        Ok(())
    }

    pub fn report(&self) -> &ValidationReport {
        &self.report
    }

    pub fn finish(self) -> ValidationReport {
        self.report
    }
}

/// Validate the concatenation of `keys`.
pub async fn validate_objects(
    storage: &dyn Storage,
    format: RecordFormat,
    keys: &[String],
) -> SortResult<ValidationReport> {
    let mut validator = OutputValidator::new(format)?;
    validator.absorb_objects(storage, keys).await?;
    let report = validator.finish();
    info!(
        objects = keys.len(),
        records = report.records,
        sorted = report.is_sorted(),
        "Validated dataset"
    );
    Ok(report)
}
