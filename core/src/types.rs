//! Core data types shared by map tasks, reduce tasks and the driver.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{SortError, SortResult};

/// A single key/value record. Keys order byte-lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Row {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Row {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Encoded width of this row as a fixed-width record.
    pub fn record_len(&self) -> usize {
        self.key.len() + self.value.len()
    }
}

/// An ordered, immutable sequence of rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    rows: Vec<Row>,
}

impl Batch {
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Row> {
        self.rows.iter()
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }
}

impl From<Vec<Row>> for Batch {
    fn from(rows: Vec<Row>) -> Self {
        Self::new(rows)
    }
}

impl FromIterator<Row> for Batch {
    fn from_iter<I: IntoIterator<Item = Row>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Which phase a task belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Map,
    Reduce,
}

/// Identifier of one map or reduce task within a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId {
    pub kind: TaskKind,
    pub index: u32,
}

impl TaskId {
    pub fn map(index: u32) -> Self {
        Self {
            kind: TaskKind::Map,
            index,
        }
    }

    pub fn reduce(index: u32) -> Self {
        Self {
            kind: TaskKind::Reduce,
            index,
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TaskKind::Map => write!(f, "map-{:06}", self.index),
            TaskKind::Reduce => write!(f, "reduce-{:06}", self.index),
        }
    }
}

/// Current wall-clock time as fractional Unix seconds.
pub fn unix_seconds() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1e6
}

/// Identifier of one sort run: `YYYY-mm-dd-HH-MM-SS-<8 hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Fresh id from the current UTC time and a random suffix.
    pub fn generate() -> Self {
        let timestamp = chrono::Utc::now().format("%Y-%m-%d-%H-%M-%S");
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("{}-{}", timestamp, &suffix[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fixed-width record layout of input and output datasets.
///
/// The default is the gensort layout: a 10-byte key followed by a 90-byte
/// value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFormat {
    pub key_len: usize,
    pub record_len: usize,
}

impl Default for RecordFormat {
    fn default() -> Self {
        Self {
            key_len: 10,
            record_len: 100,
        }
    }
}

impl RecordFormat {
    pub fn value_len(&self) -> usize {
        self.record_len - self.key_len
    }

    pub fn validate(&self) -> SortResult<()> {
        if self.key_len == 0 || self.record_len <= self.key_len {
            return Err(SortError::InvalidConfig(format!(
                "record format needs 0 < key_len < record_len, got key_len={} record_len={}",
                self.key_len, self.record_len
            )));
        }
        Ok(())
    }

    /// Number of whole records in `size` bytes, rejecting partial records.
    pub fn record_count(&self, size: u64) -> SortResult<u64> {
        let record_len = self.record_len as u64;
        if size % record_len != 0 {
            return Err(SortError::InvalidInput(format!(
                "{} bytes is not a whole number of {}-byte records",
                size, self.record_len
            )));
        }
        Ok(size / record_len)
    }

    /// Split raw record bytes into rows.
    pub fn parse(&self, data: &[u8]) -> SortResult<Batch> {
        self.record_count(data.len() as u64)?;
        Ok(data
            .chunks_exact(self.record_len)
            .map(|record| {
                let (key, value) = record.split_at(self.key_len);
                Row::new(key, value)
            })
            .collect())
    }

    /// Concatenate rows back into raw record bytes.
    pub fn serialize<'a, I>(&self, rows: I) -> SortResult<Vec<u8>>
    where
        I: IntoIterator<Item = &'a Row>,
    {
        let mut out = Vec::new();
        for row in rows {
            if row.key.len() != self.key_len || row.record_len() != self.record_len {
                return Err(SortError::InvalidInput(format!(
                    "row with {}-byte key and {}-byte value does not fit the {}/{} record format",
                    row.key.len(),
                    row.value.len(),
                    self.key_len,
                    self.record_len
                )));
            }
            out.extend_from_slice(&row.key);
            out.extend_from_slice(&row.value);
        }
        Ok(out)
    }
}

/// Record-aligned byte range read by one map task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSplit {
    pub map_id: u32,
    pub start: u64,
    pub end: u64,
}

impl InputSplit {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Divide `dataset_size` bytes into `num_maps` record-aligned ranges.
    ///
    /// Records are spread as evenly as possible; the first
    /// `records % num_maps` splits hold one extra record.
    pub fn compute(
        dataset_size: u64,
        format: &RecordFormat,
        num_maps: u32,
    ) -> SortResult<Vec<InputSplit>> {
        if num_maps == 0 {
            return Err(SortError::InvalidConfig(
                "at least one map task is required".to_string(),
            ));
        }
        let records = format.record_count(dataset_size)?;
        let record_len = format.record_len as u64;
        let base = records / num_maps as u64;
        let extra = records % num_maps as u64;

        let mut splits = Vec::with_capacity(num_maps as usize);
        let mut start = 0u64;
        for map_id in 0..num_maps {
            let count = base + u64::from((map_id as u64) < extra);
            let end = start + count * record_len;
            splits.push(InputSplit { map_id, start, end });
            start = end;
        }
        Ok(splits)
    }
}
