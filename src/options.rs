use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DifferOptions {
    /// Compactions older than this are dropped from the DAG and their backup
    /// SST files deleted.
    pub max_time_in_dag: Duration,
    /// Delay between maintenance runs. Zero disables the background tasks.
    pub prune_daemon_interval: Duration,
    /// Log entries handled per value-stripping run.
    pub prune_sst_batch_size: usize,
    /// Strip values from backed-up SST files after they are recorded.
    pub value_pruning: bool,
    /// Column families whose compactions are tracked.
    pub tracked_column_families: BTreeSet<String>,
    /// Block size of value-stripped SST rewrites.
    pub sst_block_size: usize,
    /// Traversal levels after which a diff is treated as a corrupt (cyclic)
    /// graph.
    pub max_traversal_levels: usize,
    /// How long `close` waits for a running maintenance task.
    pub shutdown_timeout: Duration,
    pub sst_backup_dir_name: String,
    pub compaction_log_dir_name: String,
}

impl Default for DifferOptions {
    fn default() -> Self {
        Self {
            max_time_in_dag: Duration::from_secs(30 * 24 * 60 * 60),
            prune_daemon_interval: Duration::from_secs(60 * 60),
            prune_sst_batch_size: 2000,
            value_pruning: true,
            tracked_column_families: ["keyTable", "directoryTable", "fileTable"]
                .into_iter()
                .map(String::from)
                .collect(),
            sst_block_size: 4 * 1024,
            max_traversal_levels: 1_000_000,
            shutdown_timeout: Duration::from_secs(60),
            sst_backup_dir_name: "compaction-sst-backup".to_string(),
            compaction_log_dir_name: "compaction-log".to_string(),
        }
    }
}

impl DifferOptions {
    pub fn is_tracked(&self, column_family: &str) -> bool {
        self.tracked_column_families.contains(column_family)
    }
}
