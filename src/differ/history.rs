use anyhow::Context;
use rayon::prelude::*;

use super::*;
use crate::log::legacy::{LegacyReplay, LEGACY_LOG_SUFFIX};
use crate::log::CompactionLogEntry;

/// What startup recovery found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistoryLoadReport {
    pub legacy_files_replayed: usize,
    pub legacy_entries: usize,
    pub table_entries: usize,
}

impl CheckpointDiffer {
    /// Rebuilds the DAG from persisted history.
    ///
    /// Legacy flat log files are first moved into the log table (and deleted
    /// once replayed); then every table entry is applied to the DAG in key
    /// order and queued for value pruning. The DAG is built from the table
    /// alone, so every start produces the same graph.
    pub fn load_history_on_startup(&self) -> Result<HistoryLoadReport> {
        let tables = self.tables()?;

        let mut report = HistoryLoadReport::default();
        let mut dag = self.dag.lock();

        // Reason and creation time carry over from one legacy file to the next.
        let mut replay = LegacyReplay::new();
        for path in self.legacy_log_files()? {
            let entries = replay
                .replay_file(&path)
                .with_context(|| format!("replay legacy compaction log {}", path.display()))?;
            let mut migrated = 0;
            for entry in entries {
                if migrate_legacy_entry(tables.compaction_log.as_ref(), entry)? {
                    migrated += 1;
                }
            }
            std::fs::remove_file(&path)?;
            tracing::info!(path = %path.display(), entries = migrated, "migrated legacy compaction log");
            report.legacy_files_replayed += 1;
            report.legacy_entries += migrated;
        }

        let rows = tables.compaction_log.scan()?;
        let decoded: Vec<(Bytes, CompactionLogEntry)> = rows
            .into_par_iter()
            .map(|(key, value)| CompactionLogEntry::decode(&value).map(|entry| (key, entry)))
            .collect::<std::result::Result<_, _>>()?;

        let mut queue = self.prune_queue.lock();
        for (key, entry) in decoded {
            dag.populate(&entry.input_files, &entry.output_files, entry.db_sequence_number);
            if self.options.value_pruning {
                queue.push(key);
            }
            report.table_entries += 1;
        }

        tracing::info!(
            nodes = dag.len(),
            edges = dag.edge_count(),
            legacy_files = report.legacy_files_replayed,
            table_entries = report.table_entries,
            "loaded compaction history"
        );
        Ok(report)
    }

    fn legacy_log_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.log_dir)? {
            let path = entry?.path();
            let is_log = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(LEGACY_LOG_SUFFIX));
            if is_log && path.is_file() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

/// Writes a replayed legacy entry into the log table. Returns `false` when
/// the identical entry is already there, as after a crash between writing the
/// table and deleting the legacy file. A different entry under the same key is
/// kept by moving the new one to the next free millisecond.
fn migrate_legacy_entry(table: &dyn KvTable, mut entry: CompactionLogEntry) -> Result<bool> {
    loop {
        let key = entry.key();
        let encoded = entry.encode()?;
        match table.get(&key)? {
            None => {
                table.put(&key, &encoded)?;
                return Ok(true);
            }
            Some(existing) if existing.as_ref() == encoded.as_slice() => {
                tracing::debug!(seq = entry.db_sequence_number, "legacy compaction already migrated");
                return Ok(false);
            }
            Some(_) => {
                tracing::warn!(
                    seq = entry.db_sequence_number,
                    time = entry.compaction_time,
                    "legacy compaction log key collides with another entry; bumping its time"
                );
                entry.compaction_time = entry
                    .compaction_time
                    .checked_add(1)
                    .ok_or_else(|| anyhow::anyhow!("legacy compaction time overflow"))?;
            }
        }
    }
}
