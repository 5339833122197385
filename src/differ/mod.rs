//! The checkpoint differ: records compactions as they happen and answers
//! "which SST files differ between these two snapshots".
//!
//! Locking:
//! - `dag` is the instance lock. It guards the DAG and every read-modify-write
//!   of the compaction log table. Diff traversal holds it for the whole walk.
//! - `in_flight` holds begin-time file metadata until the matching completed
//!   event arrives. It is only ever taken alone or nested inside `dag`.
//! - `bootstrap` serialises changes to the backup directory against
//!   checkpoint bootstrap readers. It is never taken while holding `dag`.

mod capture;
mod diff;
mod history;
mod maintenance;

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::dag::{CompactionDag, DagStats};
use crate::error::{DifferError, Result};
use crate::log::CompactionFileInfo;
use crate::options::DifferOptions;
use crate::scheduler::Scheduler;
use crate::table::KvTable;

pub use diff::DiffResult;
pub use history::HistoryLoadReport;
pub use maintenance::{
    HistoryPruneReport, PruningMetrics, PruningMetricsSnapshot, ValuePruneReport,
};

const PRUNED_SST_FILE_TEMP: &str = "pruned.sst.tmp";
const LOG_DIR_README: &str = "_README.txt";
const LOG_DIR_README_TEXT: &str = "This directory holds legacy compaction logs that are replayed \
into the compaction log table on startup and then deleted.\n";

/// Tables owned by the host store that the differ persists into.
#[derive(Clone)]
pub struct DifferTables {
    /// Compaction history, keyed by sequence number and completion time.
    pub compaction_log: Arc<dyn KvTable>,
    /// The host's snapshot bookkeeping. Compactions are only tracked once it
    /// holds at least one snapshot.
    pub snapshot_info: Arc<dyn KvTable>,
}

impl std::fmt::Debug for DifferTables {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DifferTables").finish_non_exhaustive()
    }
}

/// FIFO of log keys whose backup SSTs still carry values.
#[derive(Debug, Default)]
struct PruneQueue {
    keys: VecDeque<Bytes>,
    members: HashSet<Bytes>,
}

impl PruneQueue {
    fn push(&mut self, key: Bytes) {
        if self.members.insert(key.clone()) {
            self.keys.push_back(key);
        }
    }

    fn peek(&self) -> Option<Bytes> {
        self.keys.front().cloned()
    }

    fn pop(&mut self) {
        if let Some(key) = self.keys.pop_front() {
            self.members.remove(&key);
        }
    }

    fn len(&self) -> usize {
        self.keys.len()
    }
}

pub struct CheckpointDiffer {
    metadata_dir: PathBuf,
    backup_dir: PathBuf,
    log_dir: PathBuf,
    options: DifferOptions,
    tables: RwLock<Option<DifferTables>>,
    dag: Mutex<CompactionDag>,
    in_flight: Mutex<HashMap<String, CompactionFileInfo>>,
    prune_queue: Mutex<PruneQueue>,
    bootstrap: Mutex<()>,
    suspended: AtomicBool,
    closed: AtomicBool,
    metrics: PruningMetrics,
    scheduler: Mutex<Option<Scheduler>>,
}

impl std::fmt::Debug for CheckpointDiffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointDiffer")
            .field("metadata_dir", &self.metadata_dir)
            .field("dag", &self.dag.lock().stats())
            .field("suspended", &self.suspended.load(Ordering::Relaxed))
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl CheckpointDiffer {
    /// Creates the backup and compaction-log directories under
    /// `metadata_dir` and starts the maintenance tasks.
    ///
    /// Tables must be attached with [`CheckpointDiffer::attach_tables`] before
    /// history is loaded or compactions are recorded.
    pub fn open(metadata_dir: impl AsRef<Path>, options: DifferOptions) -> Result<Arc<Self>> {
        let metadata_dir = metadata_dir.as_ref().to_path_buf();
        let backup_dir = metadata_dir.join(&options.sst_backup_dir_name);
        let log_dir = metadata_dir.join(&options.compaction_log_dir_name);
        std::fs::create_dir_all(&backup_dir)?;
        std::fs::create_dir_all(&log_dir)?;
        let readme = log_dir.join(LOG_DIR_README);
        if !readme.exists() {
            std::fs::write(&readme, LOG_DIR_README_TEXT)?;
        }

        // A crash mid-rewrite can leave the temporary output behind.
        let stale = backup_dir.join(PRUNED_SST_FILE_TEMP);
        if let Err(e) = std::fs::remove_file(&stale) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }

        let differ = Arc::new(Self {
            metadata_dir,
            backup_dir,
            log_dir,
            options,
            tables: RwLock::new(None),
            dag: Mutex::new(CompactionDag::new()),
            in_flight: Mutex::new(HashMap::new()),
            prune_queue: Mutex::new(PruneQueue::default()),
            bootstrap: Mutex::new(()),
            suspended: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            metrics: PruningMetrics::default(),
            scheduler: Mutex::new(None),
        });

        if !differ.options.prune_daemon_interval.is_zero() {
            let scheduler = maintenance::start(Arc::downgrade(&differ), &differ.options)?;
            *differ.scheduler.lock() = Some(scheduler);
        }

        tracing::info!(
            metadata_dir = %differ.metadata_dir.display(),
            backup_dir = %differ.backup_dir.display(),
            "checkpoint differ opened"
        );
        Ok(differ)
    }

    pub fn attach_tables(&self, tables: DifferTables) {
        *self.tables.write() = Some(tables);
    }

    fn tables(&self) -> Result<DifferTables> {
        self.tables
            .read()
            .clone()
            .ok_or(DifferError::NotAttached("compaction log table"))
    }

    pub fn metadata_dir(&self) -> &Path {
        &self.metadata_dir
    }

    pub fn sst_backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub fn compaction_log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn options(&self) -> &DifferOptions {
        &self.options
    }

    pub fn dag_stats(&self) -> DagStats {
        self.dag.lock().stats()
    }

    /// Runs `f` against the DAG under the instance lock.
    pub fn with_dag<R>(&self, f: impl FnOnce(&CompactionDag) -> R) -> R {
        f(&*self.dag.lock())
    }

    pub fn pruning_metrics(&self) -> PruningMetricsSnapshot {
        self.metrics.snapshot(self.prune_queue.lock().len())
    }

    /// Blocks backup-directory changes for as long as the guard is held.
    pub fn lock_bootstrap_state(&self) -> MutexGuard<'_, ()> {
        self.bootstrap.lock()
    }

    /// Turns the maintenance tasks into no-ops until [`Self::resume`].
    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.suspended.store(false, Ordering::SeqCst);
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stops the maintenance tasks and rejects further compaction events.
    /// Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let scheduler = self.scheduler.lock().take();
        if let Some(mut scheduler) = scheduler {
            scheduler.shutdown(self.options.shutdown_timeout);
        }
        tracing::info!(metadata_dir = %self.metadata_dir.display(), "checkpoint differ closed");
    }

    fn should_run(&self) -> bool {
        !self.is_suspended() && !self.is_closed()
    }

    fn backup_path(&self, file_name: &str) -> PathBuf {
        crate::sst::sst_path(&self.backup_dir, file_name)
    }

    /// Deletes backup copies of `files`. Missing files are not an error;
    /// failures are logged and the remaining files are still attempted.
    fn remove_backup_files(&self, files: &HashSet<String>) -> usize {
        let mut removed = 0;
        for file in files {
            let path = self.backup_path(file);
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to remove backup SST file");
                }
            }
        }
        removed
    }
}

fn upgrade(differ: &Weak<CheckpointDiffer>) -> Option<Arc<CheckpointDiffer>> {
    differ.upgrade().filter(|d| !d.is_closed())
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
