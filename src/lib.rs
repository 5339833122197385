//! `layerdiff` tracks the compaction history of an LSM-tree store so that two
//! historical snapshots can be compared file by file instead of key by key.
//!
//! - Every compaction the store reports is recorded as an edge set in a DAG of
//!   SST files and persisted to a compaction log table.
//! - Inputs of each compaction are hard-linked into a backup directory so the
//!   files a diff points at outlive the compaction that replaced them.
//! - A diff walks the DAG from the later snapshot's files toward older files
//!   until it meets files the earlier snapshot holds.
//! - Background tasks expire old history and shrink the backup directory.

pub mod dag;
pub mod differ;
pub mod engine;
pub mod error;
pub mod internal_key;
pub mod log;
pub mod options;
pub mod registry;
pub mod scheduler;
pub mod sst;
pub mod table;

pub use dag::{CompactionDag, CompactionNode};
pub use differ::{CheckpointDiffer, DiffResult, DifferTables};
pub use engine::{
    CompactionEvent, CompactionJobInfo, CompactionPhase, DifferSnapshotInfo, LiveFileMetadata,
    StoreEngine,
};
pub use error::DifferError;
pub use log::{CompactionFileInfo, CompactionLogEntry};
pub use options::DifferOptions;
pub use registry::DifferRegistry;
pub use table::{FileTable, FileTableOptions, KvTable, MemoryTable};
