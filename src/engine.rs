//! Interfaces of the storage engine the differ observes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;

/// Column family the engine always reports live files for.
pub const DEFAULT_COLUMN_FAMILY: &str = "default";

/// Metadata of one live SST file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveFileMetadata {
    /// Path or bare name of the file, including the `.sst` extension.
    pub file_name: String,
    pub column_family: String,
    pub level: u32,
    pub size: u64,
    pub num_entries: u64,
    pub smallest_key: Bytes,
    pub largest_key: Bytes,
}

/// The store whose compactions are tracked, or a read-only checkpoint of it.
pub trait StoreEngine: Send + Sync {
    /// Directory holding the store's SST files.
    fn db_path(&self) -> &Path;

    fn latest_sequence_number(&self) -> u64;

    fn live_files_metadata(&self) -> std::io::Result<Vec<LiveFileMetadata>>;
}

/// What the engine reports about a compaction job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionJobInfo {
    pub column_family: String,
    /// Full paths of the files being compacted.
    pub input_files: Vec<PathBuf>,
    /// Full paths of the files written by the job.
    pub output_files: Vec<PathBuf>,
    pub reason: Option<String>,
}

impl CompactionJobInfo {
    pub fn new(
        column_family: impl Into<String>,
        input_files: Vec<PathBuf>,
        output_files: Vec<PathBuf>,
    ) -> Self {
        Self {
            column_family: column_family.into(),
            input_files,
            output_files,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Lifecycle phase of a compaction event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompactionPhase {
    Begin,
    Completed,
}

/// A compaction notification. The begin and completed events of one job are
/// correlated by the names of its input files.
#[derive(Debug, Clone)]
pub struct CompactionEvent {
    pub phase: CompactionPhase,
    pub job: CompactionJobInfo,
}

impl CompactionEvent {
    pub fn begin(job: CompactionJobInfo) -> Self {
        Self {
            phase: CompactionPhase::Begin,
            job,
        }
    }

    pub fn completed(job: CompactionJobInfo) -> Self {
        Self {
            phase: CompactionPhase::Completed,
            job,
        }
    }
}

/// A point-in-time snapshot of the store, as supplied by the caller of a diff.
#[derive(Clone)]
pub struct DifferSnapshotInfo {
    pub snapshot_id: String,
    pub db_path: PathBuf,
    /// Engine sequence number at which the snapshot was taken.
    pub snapshot_generation: u64,
    /// Column family name -> key prefix the caller is interested in.
    pub table_prefixes: Option<BTreeMap<String, Bytes>>,
    pub store: Arc<dyn StoreEngine>,
}

impl std::fmt::Debug for DifferSnapshotInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DifferSnapshotInfo")
            .field("snapshot_id", &self.snapshot_id)
            .field("db_path", &self.db_path)
            .field("snapshot_generation", &self.snapshot_generation)
            .field("table_prefixes", &self.table_prefixes)
            .finish()
    }
}

impl DifferSnapshotInfo {
    pub fn new(
        snapshot_id: impl Into<String>,
        snapshot_generation: u64,
        store: Arc<dyn StoreEngine>,
    ) -> Self {
        Self {
            snapshot_id: snapshot_id.into(),
            db_path: store.db_path().to_path_buf(),
            snapshot_generation,
            table_prefixes: None,
            store,
        }
    }

    pub fn with_table_prefixes(mut self, prefixes: BTreeMap<String, Bytes>) -> Self {
        self.table_prefixes = Some(prefixes);
        self
    }
}
