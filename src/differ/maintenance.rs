//! Periodic tasks bounding the DAG and the backup directory.

use std::sync::atomic::AtomicU64;

use anyhow::Context;

use super::*;
use crate::log::CompactionLogEntry;
use crate::sst::{fsync_parent_dir, strip_values};

#[derive(Debug, Default)]
pub struct PruningMetrics {
    files_pruned: AtomicU64,
    files_skipped: AtomicU64,
    batches: AtomicU64,
    failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruningMetricsSnapshot {
    pub files_pruned: u64,
    pub files_skipped: u64,
    pub batches: u64,
    pub failures: u64,
    pub queue_len: usize,
}

impl PruningMetrics {
    pub(super) fn snapshot(&self, queue_len: usize) -> PruningMetricsSnapshot {
        PruningMetricsSnapshot {
            files_pruned: self.files_pruned.load(Ordering::Relaxed),
            files_skipped: self.files_skipped.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            queue_len,
        }
    }
}

/// Result of one value-stripping run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValuePruneReport {
    pub entries_processed: usize,
    pub files_pruned: usize,
    pub files_skipped: usize,
}

/// Result of one history-pruning run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryPruneReport {
    pub expired_entries: usize,
    pub nodes_removed: HashSet<String>,
    pub backups_deleted: usize,
}

pub(super) fn start(differ: Weak<CheckpointDiffer>, options: &DifferOptions) -> anyhow::Result<Scheduler> {
    let interval = options.prune_daemon_interval;
    let mut scheduler = Scheduler::new("compaction-dag");

    let weak = differ.clone();
    scheduler.schedule_with_fixed_delay("history-pruner", interval, interval, move || {
        match upgrade(&weak) {
            Some(d) => d.prune_older_snapshots_with_compaction_history().map(|_| ()),
            None => Ok(()),
        }
    })?;

    let weak = differ.clone();
    scheduler.schedule_with_fixed_delay("sst-pruner", interval, interval, move || {
        match upgrade(&weak) {
            Some(d) => d.prune_sst_files().map(|_| ()),
            None => Ok(()),
        }
    })?;

    if options.value_pruning {
        scheduler.schedule_with_fixed_delay("sst-value-pruner", interval, interval, move || {
            match upgrade(&differ) {
                Some(d) => d.prune_sst_file_values().map(|_| ()),
                None => Ok(()),
            }
        })?;
    }
    Ok(scheduler)
}

impl CheckpointDiffer {
    /// Drops compactions older than `max_time_in_dag` from the DAG, deleting
    /// their log entries and the backup copies of every removed file.
    pub fn prune_older_snapshots_with_compaction_history(&self) -> anyhow::Result<HistoryPruneReport> {
        if !self.should_run() {
            return Ok(HistoryPruneReport::default());
        }
        let tables = self.tables()?;
        let max_age = self.options.max_time_in_dag.as_millis() as u64;
        let now = now_millis();

        let (expired_files, expired_keys) = {
            let _guard = self.dag.lock();
            let mut files = HashSet::new();
            let mut keys = Vec::new();
            for (key, value) in tables.compaction_log.scan()? {
                let entry = CompactionLogEntry::decode(&value)
                    .with_context(|| format!("decode compaction log entry {key:?}"))?;
                if now.saturating_sub(entry.compaction_time) < max_age {
                    break;
                }
                files.extend(entry.input_file_names().map(str::to_owned));
                keys.push(key);
            }
            (files, keys)
        };

        if expired_keys.is_empty() {
            return Ok(HistoryPruneReport::default());
        }

        let removed = self.dag.lock().prune(&expired_files);
        if !removed.is_empty() {
            tracing::info!(
                removed = removed.len(),
                entries = expired_keys.len(),
                "pruned expired compactions from DAG"
            );
        }

        let backups_deleted = {
            let _bootstrap = self.bootstrap.lock();
            let deleted = self.remove_backup_files(&removed);
            for key in &expired_keys {
                tables.compaction_log.delete(key)?;
            }
            deleted
        };

        Ok(HistoryPruneReport {
            expired_entries: expired_keys.len(),
            nodes_removed: removed,
            backups_deleted,
        })
    }

    /// Deletes backup copies of files that were themselves produced by a
    /// tracked compaction. Diffing only ever needs the content of files at
    /// the edge of recorded history.
    pub fn prune_sst_files(&self) -> anyhow::Result<usize> {
        if !self.should_run() {
            return Ok(0);
        }
        let non_leaf = self.dag.lock().non_leaf_files();
        if non_leaf.is_empty() {
            return Ok(0);
        }
        let _bootstrap = self.bootstrap.lock();
        let removed = self.remove_backup_files(&non_leaf);
        tracing::debug!(candidates = non_leaf.len(), removed, "pruned non-leaf backup SST files");
        Ok(removed)
    }

    /// Rewrites backed-up input files of queued log entries without values.
    ///
    /// Handles up to `prune_sst_batch_size` entries. A failure ends the run and
    /// leaves the failing entry at the head of the queue for the next run.
    pub fn prune_sst_file_values(&self) -> anyhow::Result<ValuePruneReport> {
        let mut report = ValuePruneReport::default();
        if !self.should_run() || !self.options.value_pruning {
            return Ok(report);
        }
        let tables = self.tables()?;
        self.metrics.batches.fetch_add(1, Ordering::Relaxed);

        while report.entries_processed < self.options.prune_sst_batch_size {
            let Some(key) = self.prune_queue.lock().peek() else {
                break;
            };
            if let Err(err) = self.prune_entry_values(&tables, &key, &mut report) {
                self.metrics.failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(key = ?key, error = %err, "could not strip values from backup SST files");
                return Err(err);
            }
            self.prune_queue.lock().pop();
            report.entries_processed += 1;
        }
        Ok(report)
    }

    fn prune_entry_values(
        &self,
        tables: &DifferTables,
        key: &Bytes,
        report: &mut ValuePruneReport,
    ) -> anyhow::Result<()> {
        let mut updated = {
            let _guard = self.dag.lock();
            match tables.compaction_log.get(key)? {
                Some(value) => CompactionLogEntry::decode(&value)?,
                // Already expired by history pruning.
                None => return Ok(()),
            }
        };

        let tmp = self.backup_dir.join(PRUNED_SST_FILE_TEMP);
        let mut changed = false;
        for info in updated.input_files.iter_mut().filter(|i| !i.pruned) {
            let path = self.backup_path(&info.file_name);
            if !path.exists() {
                tracing::debug!(path = %path.display(), "backup SST missing; skipping value pruning");
                self.metrics.files_skipped.fetch_add(1, Ordering::Relaxed);
                report.files_skipped += 1;
                continue;
            }

            match std::fs::remove_file(&tmp) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            let stats = strip_values(&path, &tmp, self.options.sst_block_size)
                .with_context(|| format!("strip values from {}", path.display()))?;

            {
                let _bootstrap = self.bootstrap.lock();
                if !path.exists() {
                    // Deleted by another maintenance task while we rewrote it.
                    std::fs::remove_file(&tmp)?;
                    continue;
                }
                std::fs::rename(&tmp, &path)?;
                fsync_parent_dir(&path)?;
            }

            tracing::debug!(
                file = %info.file_name,
                puts = stats.puts,
                tombstones = stats.tombstones,
                bytes_dropped = stats.bytes_dropped,
                "stripped values from backup SST"
            );
            info.mark_pruned();
            changed = true;
            self.metrics.files_pruned.fetch_add(1, Ordering::Relaxed);
            report.files_pruned += 1;
        }

        if changed {
            let _guard = self.dag.lock();
            if tables.compaction_log.get(key)?.is_some() {
                tables.compaction_log.put(key, &updated.encode()?)?;
            }
        }
        Ok(())
    }
}
