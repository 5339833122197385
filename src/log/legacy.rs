//! Line-oriented compaction logs written by older releases.
//!
//! Each `*.log` file in the compaction-log directory holds lines of the form:
//! ```text
//! # <compaction reason>
//! S <sequence number> <snapshot id> <creation time millis>
//! C <sequence number> <in1>,<in2>:<out1>,<out2>
//! ```
//! `#` and `S` lines update state that the following `C` lines inherit. A `C`
//! line whose file section ends with `:` records an SST deletion and carries no
//! compaction.

use std::io::{BufRead, Write};
use std::path::Path;

use super::{CompactionFileInfo, CompactionLogEntry, LogError};

pub const LEGACY_LOG_SUFFIX: &str = ".log";

const COMMENT_PREFIX: &str = "# ";
const SNAPSHOT_PREFIX: &str = "S ";
const ENTRY_PREFIX: &str = "C ";
const FILE_DELIMITER: char = ',';
const INPUT_OUTPUT_DELIMITER: char = ':';

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LegacyLine<'a> {
    Reason(&'a str),
    SnapshotCreated { creation_time: u64 },
    Compaction {
        db_sequence_number: u64,
        inputs: Vec<&'a str>,
        outputs: Vec<&'a str>,
    },
    SstDeletion,
    Invalid,
}

/// Classifies one line. Structural problems yield [`LegacyLine::Invalid`];
/// unparsable numbers are reported as corruption.
pub fn parse_line(line: &str) -> Result<LegacyLine<'_>, LogError> {
    if let Some(reason) = line.strip_prefix(COMMENT_PREFIX) {
        return Ok(LegacyLine::Reason(reason));
    }

    if let Some(rest) = line.strip_prefix(SNAPSHOT_PREFIX) {
        let fields: Vec<&str> = rest.split(' ').collect();
        if fields.len() != 3 {
            return Ok(LegacyLine::Invalid);
        }
        let creation_time = fields[2].parse().map_err(|_| LogError::CorruptLine {
            line: line.to_string(),
            reason: "snapshot creation time is not a number",
        })?;
        return Ok(LegacyLine::SnapshotCreated { creation_time });
    }

    if line.starts_with(ENTRY_PREFIX) {
        let fields: Vec<&str> = line.split(' ').collect();
        if fields.len() != 3 {
            return Ok(LegacyLine::Invalid);
        }
        let files: Vec<&str> = fields[2].split(INPUT_OUTPUT_DELIMITER).collect();
        if files.len() != 2 || files[1].is_empty() {
            return Ok(if line.ends_with(INPUT_OUTPUT_DELIMITER) {
                LegacyLine::SstDeletion
            } else {
                LegacyLine::Invalid
            });
        }
        let db_sequence_number = fields[1].parse().map_err(|_| LogError::CorruptLine {
            line: line.to_string(),
            reason: "sequence number is not a number",
        })?;
        let inputs = split_files(files[0]);
        let outputs = split_files(files[1]);
        if inputs.is_empty() || outputs.is_empty() {
            return Ok(LegacyLine::Invalid);
        }
        return Ok(LegacyLine::Compaction {
            db_sequence_number,
            inputs,
            outputs,
        });
    }

    Ok(LegacyLine::Invalid)
}

fn split_files(files: &str) -> Vec<&str> {
    files
        .split(FILE_DELIMITER)
        .filter(|f| !f.is_empty())
        .collect()
}

/// Carries the reason and creation time between lines while replaying.
#[derive(Debug, Default)]
pub struct LegacyReplay {
    reason: Option<String>,
    creation_time: u64,
}

impl LegacyReplay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, line: &str) -> Result<Option<CompactionLogEntry>, LogError> {
        tracing::debug!(line, "processing legacy compaction log line");
        match parse_line(line)? {
            LegacyLine::Reason(reason) => {
                self.reason = Some(reason.to_string());
                Ok(None)
            }
            LegacyLine::SnapshotCreated { creation_time } => {
                self.creation_time = creation_time;
                Ok(None)
            }
            LegacyLine::Compaction {
                db_sequence_number,
                inputs,
                outputs,
            } => {
                let named = |files: Vec<&str>| {
                    files
                        .into_iter()
                        .map(CompactionFileInfo::named)
                        .collect::<Vec<_>>()
                };
                Ok(Some(
                    CompactionLogEntry::new(
                        db_sequence_number,
                        self.creation_time,
                        named(inputs),
                        named(outputs),
                    )
                    .with_reason(self.reason.clone()),
                ))
            }
            LegacyLine::SstDeletion => {
                tracing::debug!(line, "ignoring legacy log line for SST deletion");
                Ok(None)
            }
            LegacyLine::Invalid => {
                tracing::error!(line, "invalid line in compaction log");
                Ok(None)
            }
        }
    }

    /// Replays every line of `path`, returning the compactions it records.
    pub fn replay_file(&mut self, path: &Path) -> anyhow::Result<Vec<CompactionLogEntry>> {
        let file = std::fs::File::open(path)?;
        let mut entries = Vec::new();
        for line in std::io::BufReader::new(file).lines() {
            if let Some(entry) = self.apply(&line?)? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }
}

pub fn format_reason_line(reason: &str) -> String {
    format!("{COMMENT_PREFIX}{reason}")
}

pub fn format_snapshot_line(db_sequence_number: u64, snapshot_id: &str, creation_time: u64) -> String {
    format!("{SNAPSHOT_PREFIX}{db_sequence_number} {snapshot_id} {creation_time}")
}

pub fn format_compaction_line<I, O>(db_sequence_number: u64, inputs: I, outputs: O) -> String
where
    I: IntoIterator,
    I::Item: AsRef<str>,
    O: IntoIterator,
    O::Item: AsRef<str>,
{
    let join = |files: Vec<String>| files.join(",");
    let inputs = join(inputs.into_iter().map(|f| f.as_ref().to_string()).collect());
    let outputs = join(outputs.into_iter().map(|f| f.as_ref().to_string()).collect());
    format!("{ENTRY_PREFIX}{db_sequence_number} {inputs}{INPUT_OUTPUT_DELIMITER}{outputs}")
}

/// Appends lines to a legacy log file. Kept for migration tooling and for
/// producing fixtures; new history is written to the log table only.
pub struct LegacyLogWriter {
    file: std::io::BufWriter<std::fs::File>,
}

impl LegacyLogWriter {
    pub fn create(path: &Path) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            file: std::io::BufWriter::new(file),
        })
    }

    pub fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")
    }

    /// Writes `entry` as an optional reason line followed by its `C` line.
    pub fn write_entry(&mut self, entry: &CompactionLogEntry) -> std::io::Result<()> {
        if let Some(reason) = &entry.compaction_reason {
            self.write_line(&format_reason_line(reason))?;
        }
        self.write_line(&format_compaction_line(
            entry.db_sequence_number,
            entry.input_file_names(),
            entry.output_file_names(),
        ))
    }

    pub fn finish(mut self) -> std::io::Result<()> {
        self.file.flush()?;
        self.file.get_ref().sync_data()
    }
}
