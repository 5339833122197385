//! Compaction log entries and their persisted encoding.
//!
//! Every completed compaction is recorded as one [`CompactionLogEntry`] in the
//! compaction log table, keyed by [`log_key`] so that a plain ascending key
//! scan visits entries in compaction order.

pub mod legacy;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("malformed log key: {0:?}")]
    BadKey(String),

    #[error("corrupt legacy log line {line:?}: {reason}")]
    CorruptLine { line: String, reason: &'static str },
}

/// Width of the zero-padded sequence-number prefix of a log key; the decimal
/// length of `u64::MAX`.
pub const SEQUENCE_NUMBER_WIDTH: usize = 20;

/// One SST file as seen by a compaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionFileInfo {
    pub file_name: String,
    pub start_key: Option<Bytes>,
    pub end_key: Option<Bytes>,
    pub column_family: Option<String>,
    pub num_entries: Option<u64>,
    /// Set once the backup copy of this file has had its values stripped.
    pub pruned: bool,
}

impl CompactionFileInfo {
    /// A record carrying only the file name, as produced by legacy logs.
    pub fn named(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            start_key: None,
            end_key: None,
            column_family: None,
            num_entries: None,
            pruned: false,
        }
    }

    pub fn with_key_range(mut self, start_key: Bytes, end_key: Bytes) -> Self {
        self.start_key = Some(start_key);
        self.end_key = Some(end_key);
        self
    }

    pub fn with_column_family(mut self, column_family: impl Into<String>) -> Self {
        self.column_family = Some(column_family.into());
        self
    }

    pub fn with_num_entries(mut self, num_entries: u64) -> Self {
        self.num_entries = Some(num_entries);
        self
    }

    pub fn mark_pruned(&mut self) {
        self.pruned = true;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionLogEntry {
    pub db_sequence_number: u64,
    /// Wall-clock completion time, epoch milliseconds.
    pub compaction_time: u64,
    pub input_files: Vec<CompactionFileInfo>,
    pub output_files: Vec<CompactionFileInfo>,
    pub compaction_reason: Option<String>,
}

impl CompactionLogEntry {
    pub fn new(
        db_sequence_number: u64,
        compaction_time: u64,
        input_files: Vec<CompactionFileInfo>,
        output_files: Vec<CompactionFileInfo>,
    ) -> Self {
        Self {
            db_sequence_number,
            compaction_time,
            input_files,
            output_files,
            compaction_reason: None,
        }
    }

    pub fn with_reason(mut self, reason: Option<String>) -> Self {
        self.compaction_reason = reason;
        self
    }

    pub fn key(&self) -> Vec<u8> {
        log_key(self.db_sequence_number, self.compaction_time)
    }

    pub fn encode(&self) -> Result<Vec<u8>, LogError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, LogError> {
        Ok(bincode::deserialize(bytes)?)
    }

    pub fn input_file_names(&self) -> impl Iterator<Item = &str> {
        self.input_files.iter().map(|f| f.file_name.as_str())
    }

    pub fn output_file_names(&self) -> impl Iterator<Item = &str> {
        self.output_files.iter().map(|f| f.file_name.as_str())
    }
}

/// `zero-padded(sequence number) + "-" + compaction time`.
pub fn log_key(db_sequence_number: u64, compaction_time: u64) -> Vec<u8> {
    format!("{db_sequence_number:0width$}-{compaction_time}", width = SEQUENCE_NUMBER_WIDTH)
        .into_bytes()
}

/// Inverse of [`log_key`].
pub fn parse_log_key(key: &[u8]) -> Result<(u64, u64), LogError> {
    let bad = || LogError::BadKey(String::from_utf8_lossy(key).into_owned());
    let text = std::str::from_utf8(key).map_err(|_| bad())?;
    let (seq, time) = text.split_once('-').ok_or_else(bad)?;
    if seq.len() != SEQUENCE_NUMBER_WIDTH {
        return Err(bad());
    }
    Ok((
        seq.parse().map_err(|_| bad())?,
        time.parse().map_err(|_| bad())?,
    ))
}
